use crate::error::{ConversionError, Result};
use crate::types::{BoundaryComparison, BoundaryDelta, BoundarySet};

/// Frames at which the separator begins in a per-frame label path.
///
/// Walks the path carrying the last non-blank label. A frame counts when its
/// label is non-blank, differs from the carried label and is the separator.
/// Runs of separators and a trailing separator are treated like any other label.
pub fn derive_boundaries(labels: &[usize], blank: usize, separator: usize) -> BoundarySet {
    let mut frames = Vec::new();
    let mut last: Option<usize> = None;
    for (frame, &label) in labels.iter().enumerate() {
        if label == blank || last == Some(label) {
            continue;
        }
        if label == separator {
            frames.push(frame);
        }
        last = Some(label);
    }
    BoundarySet { frames }
}

/// Pairs boundaries positionally. Sets of different length cannot be paired
/// and are reported as a structural mismatch with no numeric delta.
pub fn compare_boundaries(left: &BoundarySet, right: &BoundarySet, stride_ms: f64) -> BoundaryComparison {
    if left.len() != right.len() {
        return BoundaryComparison::StructuralMismatch {
            left: left.clone(),
            right: right.clone(),
        };
    }
    let deltas: Vec<BoundaryDelta> = left
        .frames
        .iter()
        .zip(&right.frames)
        .map(|(&a, &b)| {
            let frame_diff = a.abs_diff(b);
            BoundaryDelta {
                left_frame: a,
                right_frame: b,
                frame_diff,
                time_diff_ms: frame_diff as f64 * stride_ms,
            }
        })
        .collect();
    let max_time_diff_ms = deltas.iter().map(|d| d.time_diff_ms).fold(0.0, f64::max);
    BoundaryComparison::Aligned {
        deltas,
        max_time_diff_ms,
    }
}

impl BoundaryComparison {
    /// The per-boundary deltas, or [`ConversionError::StructuralMismatch`].
    pub fn into_deltas(self) -> Result<Vec<BoundaryDelta>> {
        match self {
            Self::Aligned { deltas, .. } => Ok(deltas),
            Self::StructuralMismatch { left, right } => Err(ConversionError::StructuralMismatch {
                left: left.len(),
                right: right.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLANK: usize = 0;
    const SEP: usize = 9;

    #[test]
    fn separator_onsets_are_reported() {
        // h h _ | | _ w
        let labels = [3, 3, BLANK, SEP, SEP, BLANK, 4];
        assert_eq!(derive_boundaries(&labels, BLANK, SEP).frames, vec![3]);
    }

    #[test]
    fn separator_after_blank_gap_is_not_repeated() {
        // a | _ | b : the second | matches the carried label
        let labels = [1, SEP, BLANK, SEP, 2, SEP];
        assert_eq!(derive_boundaries(&labels, BLANK, SEP).frames, vec![1, 5]);
    }

    #[test]
    fn leading_and_trailing_separators_count() {
        let labels = [SEP, 1, SEP];
        assert_eq!(derive_boundaries(&labels, BLANK, SEP).frames, vec![0, 2]);
        assert!(derive_boundaries(&[BLANK; 5], BLANK, SEP).is_empty());
    }

    #[test]
    fn equal_length_sets_give_exact_time_deltas() {
        let a = BoundarySet { frames: vec![10, 40] };
        let b = BoundarySet { frames: vec![12, 39] };
        let cmp = compare_boundaries(&a, &b, 20.0);
        assert_eq!(cmp.max_time_diff_ms(), Some(40.0));
        let deltas = cmp.into_deltas().unwrap();
        assert_eq!(deltas[0].frame_diff, 2);
        assert_eq!(deltas[0].time_diff_ms, 40.0);
        assert_eq!(deltas[1].time_diff_ms, 20.0);
    }

    #[test]
    fn unequal_sets_are_a_structural_mismatch() {
        let a = BoundarySet { frames: vec![10] };
        let b = BoundarySet { frames: vec![10, 30] };
        let cmp = compare_boundaries(&a, &b, 20.0);
        assert!(cmp.is_structural_mismatch());
        assert_eq!(cmp.max_time_diff_ms(), None);
        let err = cmp.into_deltas().unwrap_err();
        assert_eq!(err.kind(), "structural_mismatch");
    }

    #[test]
    fn empty_sets_compare_with_zero_delta() {
        let cmp = compare_boundaries(&BoundarySet::default(), &BoundarySet::default(), 20.0);
        assert_eq!(cmp.max_time_diff_ms(), Some(0.0));
    }
}
