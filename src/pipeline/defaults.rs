use crate::alignment::viterbi::forced_align_viterbi;
use crate::error::{ConversionError, Result};
use crate::pipeline::traits::ForcedAlignPrimitive;
use crate::types::DecisionPath;

/// CPU CTC Viterbi search; the default [`ForcedAlignPrimitive`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ViterbiForcedAligner;

impl ForcedAlignPrimitive for ViterbiForcedAligner {
    fn align(
        &self,
        log_probs: &[Vec<f32>],
        targets: &[usize],
        input_length: usize,
        target_length: usize,
        blank: usize,
    ) -> Result<DecisionPath> {
        if input_length > log_probs.len() || target_length > targets.len() {
            return Err(ConversionError::invalid_input(format!(
                "lengths ({input_length} frames, {target_length} targets) exceed the supplied \
                 {} frames and {} targets",
                log_probs.len(),
                targets.len()
            )));
        }
        forced_align_viterbi(&log_probs[..input_length], &targets[..target_length], blank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viterbi_forced_aligner_matches_free_function() {
        let log_probs = vec![vec![0.0f32, -10.0], vec![-10.0, 0.0], vec![0.0, -10.0]];
        let path = ViterbiForcedAligner.align(&log_probs, &[1], 3, 1, 0).unwrap();
        let expected = forced_align_viterbi(&log_probs, &[1], 0).unwrap();
        assert_eq!(path, expected);
        assert_eq!(path.labels, vec![0, 1, 0]);
    }

    #[test]
    fn lengths_limit_the_search() {
        let log_probs = vec![vec![0.0f32, -1.0]; 4];
        let path = ViterbiForcedAligner.align(&log_probs, &[1, 1], 2, 1, 0).unwrap();
        assert_eq!(path.len(), 2);
        assert!(ViterbiForcedAligner.align(&log_probs, &[1], 5, 1, 0).is_err());
    }
}
