use std::sync::Arc;

use candle_core::{Tensor, D};
use serde::Serialize;

use crate::alignment::boundaries::{compare_boundaries, derive_boundaries};
use crate::alignment::vocabulary::LabelVocabulary;
use crate::error::{ConversionError, Result};
use crate::pipeline::traits::ForcedAlignPrimitive;
use crate::types::{BoundaryComparison, BoundarySet, DecisionPath};

/// Decision path and word boundaries for one emission tensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathAnalysis {
    pub path: DecisionPath,
    pub boundaries: BoundarySet,
    pub transcript: String,
}

impl PathAnalysis {
    pub fn frames(&self) -> usize {
        self.path.len()
    }
}

/// Boundary comparison of two emission tensors for the same audio and transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignmentComparison {
    pub left: PathAnalysis,
    pub right: PathAnalysis,
    pub boundaries: BoundaryComparison,
    /// Fraction of frames whose forced-alignment labels agree.
    pub path_agreement: f64,
}

/// Turns emissions into decision paths and separator boundaries.
#[derive(Clone)]
pub struct AlignmentPathAnalyzer {
    vocabulary: Arc<LabelVocabulary>,
    aligner: Arc<dyn ForcedAlignPrimitive>,
    stride_ms: f64,
}

impl AlignmentPathAnalyzer {
    pub fn new(
        vocabulary: Arc<LabelVocabulary>,
        aligner: Arc<dyn ForcedAlignPrimitive>,
        stride_ms: f64,
    ) -> Self {
        Self {
            vocabulary,
            aligner,
            stride_ms,
        }
    }

    pub fn vocabulary(&self) -> &LabelVocabulary {
        &self.vocabulary
    }

    pub fn stride_ms(&self) -> f64 {
        self.stride_ms
    }

    /// Log-softmax over the vocabulary axis of `[1, frames, vocab]` or `[frames, vocab]` emissions.
    pub fn log_probabilities(&self, emissions: &Tensor) -> Result<Vec<Vec<f32>>> {
        let emissions = match emissions.rank() {
            3 if emissions.dim(0).ok() == Some(1) => emissions
                .squeeze(0)
                .map_err(|e| ConversionError::shape_contract("squeeze batch", e))?,
            2 => emissions.clone(),
            _ => {
                return Err(ConversionError::shape_contract(
                    "align emissions",
                    format!("expected [1, frames, vocab] or [frames, vocab], got {:?}", emissions.dims()),
                ))
            }
        };
        let vocab = emissions
            .dim(1)
            .map_err(|e| ConversionError::shape_contract("align emissions", e))?;
        if vocab != self.vocabulary.len() {
            return Err(ConversionError::shape_contract(
                "align emissions",
                format!(
                    "emission vocabulary axis is {vocab}, vocabulary has {} symbols",
                    self.vocabulary.len()
                ),
            ));
        }
        candle_nn::ops::log_softmax(&emissions, D::Minus1)
            .and_then(|t| t.to_vec2::<f32>())
            .map_err(|e| ConversionError::inference("log_softmax", e))
    }

    pub fn decision_path(&self, log_probs: &[Vec<f32>], targets: &[usize]) -> Result<DecisionPath> {
        let path = self.aligner.align(
            log_probs,
            targets,
            log_probs.len(),
            targets.len(),
            self.vocabulary.blank_id(),
        )?;
        if path.len() != log_probs.len() {
            return Err(ConversionError::shape_contract(
                "forced alignment",
                format!("aligner returned {} labels for {} frames", path.len(), log_probs.len()),
            ));
        }
        Ok(path)
    }

    pub fn boundaries(&self, path: &DecisionPath) -> BoundarySet {
        derive_boundaries(
            &path.labels,
            self.vocabulary.blank_id(),
            self.vocabulary.separator_id(),
        )
    }

    pub fn analyze(&self, emissions: &Tensor, targets: &[usize]) -> Result<PathAnalysis> {
        let log_probs = self.log_probabilities(emissions)?;
        let path = self.decision_path(&log_probs, targets)?;
        let boundaries = self.boundaries(&path);
        let transcript = self.vocabulary.render(&path.labels);
        Ok(PathAnalysis {
            path,
            boundaries,
            transcript,
        })
    }

    pub fn compare_paths(&self, left: &PathAnalysis, right: &PathAnalysis) -> BoundaryComparison {
        compare_boundaries(&left.boundaries, &right.boundaries, self.stride_ms)
    }

    pub fn compare_emissions(
        &self,
        left: &Tensor,
        right: &Tensor,
        transcript: &str,
    ) -> Result<AlignmentComparison> {
        let targets = self.vocabulary.encode_transcript(transcript);
        let left = self.analyze(left, &targets)?;
        let right = self.analyze(right, &targets)?;
        let boundaries = self.compare_paths(&left, &right);

        let frames = left.frames().max(right.frames());
        let matching = left
            .path
            .labels
            .iter()
            .zip(&right.path.labels)
            .filter(|(a, b)| a == b)
            .count();
        let path_agreement = if frames == 0 {
            1.0
        } else {
            matching as f64 / frames as f64
        };

        if boundaries.is_structural_mismatch() {
            tracing::warn!(
                left = left.boundaries.len(),
                right = right.boundaries.len(),
                "word boundary sets disagree structurally"
            );
        } else {
            tracing::debug!(
                boundaries = left.boundaries.len(),
                max_time_diff_ms = boundaries.max_time_diff_ms(),
                path_agreement,
                "word boundaries compared"
            );
        }

        Ok(AlignmentComparison {
            left,
            right,
            boundaries,
            path_agreement,
        })
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::pipeline::defaults::ViterbiForcedAligner;

    fn analyzer() -> AlignmentPathAnalyzer {
        let vocab = LabelVocabulary::from_symbols(["-", "a", "b", "|"]).unwrap();
        AlignmentPathAnalyzer::new(Arc::new(vocab), Arc::new(ViterbiForcedAligner), 20.0)
    }

    fn peaked(labels: &[usize]) -> Tensor {
        let rows: Vec<f32> = labels
            .iter()
            .flat_map(|&l| (0..4).map(move |v| if v == l { 5.0 } else { 0.0 }))
            .collect();
        Tensor::from_vec(rows, (1, labels.len(), 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn analyze_finds_separator_onset() {
        let a = analyzer();
        let out = a.analyze(&peaked(&[1, 0, 3, 3, 2, 0]), &[1, 3, 2]).unwrap();
        assert_eq!(out.path.labels, vec![1, 0, 3, 3, 2, 0]);
        assert_eq!(out.boundaries.frames, vec![2]);
        assert_eq!(out.transcript, "a b");
    }

    #[test]
    fn shifted_separator_yields_time_delta() {
        let a = analyzer();
        let cmp = a
            .compare_emissions(&peaked(&[1, 0, 3, 2, 0, 0]), &peaked(&[1, 1, 0, 3, 2, 0]), "a b")
            .unwrap();
        assert_eq!(cmp.boundaries.max_time_diff_ms(), Some(20.0));
        assert!(cmp.path_agreement < 1.0);
    }

    #[test]
    fn vocabulary_axis_must_match() {
        let a = analyzer();
        let wrong = Tensor::zeros((1, 3, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        let err = a.log_probabilities(&wrong).unwrap_err();
        assert_eq!(err.kind(), "shape_contract_violation");
    }

    #[test]
    fn batched_emissions_are_rejected() {
        let a = analyzer();
        let batched = Tensor::zeros((2, 3, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(a.log_probabilities(&batched).is_err());
    }
}
