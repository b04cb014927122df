//! Reference-vs-graph and f32-vs-int8 agreement checks over a battery of inputs.

pub mod battery;
pub mod metrics;
pub mod report;
pub mod validator;

pub use battery::{Battery, InputKind, TestCase};
pub use report::{
    BatterySummary, CaseOutcome, CaseReport, PrecisionReport, RepresentationCase,
    RepresentationOutcome, RepresentationReport, SweepOutcome, SweepPoint, SweepReport,
};
pub use validator::ParityValidator;
