use serde::Serialize;

use crate::parity::battery::TestCase;
use crate::parity::metrics::ElementwiseDiff;
use crate::types::{Precision, Verdict};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaseOutcome {
    Completed {
        frames: usize,
        max_abs_diff: f32,
        mean_abs_diff: f32,
        agreement_rate: f64,
        verdict: Verdict,
    },
    /// Either side failed; excluded from the aggregate.
    Failed { error_kind: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseReport {
    pub case: TestCase,
    #[serde(flatten)]
    pub outcome: CaseOutcome,
}

impl CaseReport {
    pub fn agreement_rate(&self) -> Option<f64> {
        match self.outcome {
            CaseOutcome::Completed { agreement_rate, .. } => Some(agreement_rate),
            CaseOutcome::Failed { .. } => None,
        }
    }

    pub fn verdict(&self) -> Verdict {
        match self.outcome {
            CaseOutcome::Completed { verdict, .. } => verdict,
            CaseOutcome::Failed { .. } => Verdict::Fail,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, CaseOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatterySummary {
    pub cases_total: usize,
    pub cases_failed: usize,
    pub pass_count: usize,
    pub warn_count: usize,
    pub fail_count: usize,
    /// Mean agreement over completed cases; absent when none completed.
    pub mean_agreement_rate: Option<f64>,
    pub worst_agreement_rate: Option<f64>,
    pub worst_max_abs_diff: Option<f32>,
    pub worst_mean_abs_diff: Option<f32>,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caveat: Option<String>,
}

/// Decision-level comparison of two sessions over a battery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrecisionReport {
    pub left: Precision,
    pub right: Precision,
    pub cases: Vec<CaseReport>,
    pub summary: BatterySummary,
}

/// Reference model vs. exported graph on one input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepresentationReport {
    pub input_shape: Vec<usize>,
    pub reference_frames: usize,
    pub session_frames: usize,
    #[serde(flatten)]
    pub diff: ElementwiseDiff,
    pub tolerance: f32,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RepresentationOutcome {
    Compared(RepresentationReport),
    /// Either side failed or the frame counts differ.
    Failed { error_kind: String, message: String },
}

/// Cross-representation result for one battery case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepresentationCase {
    pub case: TestCase,
    #[serde(flatten)]
    pub outcome: RepresentationOutcome,
}

impl RepresentationCase {
    pub fn passed(&self) -> bool {
        matches!(&self.outcome, RepresentationOutcome::Compared(r) if r.passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, RepresentationOutcome::Failed { .. })
    }

    pub fn report(&self) -> Option<&RepresentationReport> {
        match &self.outcome {
            RepresentationOutcome::Compared(report) => Some(report),
            RepresentationOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SweepOutcome {
    Measured { frames: usize, frames_per_second: f64 },
    Failed { error_kind: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPoint {
    pub duration_sec: f64,
    pub num_samples: usize,
    pub expected_frames: usize,
    #[serde(flatten)]
    pub outcome: SweepOutcome,
}

impl SweepPoint {
    pub fn frames(&self) -> Option<usize> {
        match self.outcome {
            SweepOutcome::Measured { frames, .. } => Some(frames),
            SweepOutcome::Failed { .. } => None,
        }
    }

    /// A failed point never matches.
    pub fn matches(&self) -> bool {
        self.frames() == Some(self.expected_frames)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, SweepOutcome::Failed { .. })
    }
}

/// Frame counts of a session across input durations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub precision: Precision,
    pub points: Vec<SweepPoint>,
    pub points_failed: usize,
    pub all_match: bool,
}
