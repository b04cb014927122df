use std::collections::BTreeMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Named tensors passed into and out of an inference session.
pub type NamedTensors = BTreeMap<String, Tensor>;

/// How an axis may vary between export time and call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisRole {
    Fixed,
    Batch,
    Sequence,
}

impl AxisRole {
    pub fn is_dynamic(self) -> bool {
        !matches!(self, Self::Fixed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Precision {
    F32,
    Int8Dynamic,
}

impl Precision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::Int8Dynamic => "int8-dynamic",
        }
    }
}

/// Per-frame label indices chosen by the forced aligner plus the path score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionPath {
    pub labels: Vec<usize>,
    pub score: f32,
}

impl DecisionPath {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Frame indices at which the separator symbol begins in a decision path.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BoundarySet {
    pub frames: Vec<usize>,
}

impl BoundarySet {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Per-boundary disagreement between two decision paths with the same segmentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundaryDelta {
    pub left_frame: usize,
    pub right_frame: usize,
    pub frame_diff: usize,
    pub time_diff_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoundaryComparison {
    Aligned {
        deltas: Vec<BoundaryDelta>,
        max_time_diff_ms: f64,
    },
    StructuralMismatch {
        left: BoundarySet,
        right: BoundarySet,
    },
}

impl BoundaryComparison {
    pub fn is_structural_mismatch(&self) -> bool {
        matches!(self, Self::StructuralMismatch { .. })
    }

    pub fn max_time_diff_ms(&self) -> Option<f64> {
        match self {
            Self::Aligned {
                max_time_diff_ms, ..
            } => Some(*max_time_diff_ms),
            Self::StructuralMismatch { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }
}
