pub mod alignment;
pub mod config;
pub mod error;
pub mod export;
pub mod model;
pub mod parity;
pub mod pipeline;
pub mod quantize;
pub mod types;

pub use alignment::{AlignmentPathAnalyzer, LabelVocabulary};
pub use config::{CtcModelConfig, ExportOptions, HarnessConfig, ParityConfig, QuantizationConfig};
pub use error::{ConversionError, Result};
pub use export::{AxisDeclaration, ExportedGraph, GraphExporter, ModelOutput, OutputNormalizer};
pub use model::CtcAcousticModel;
pub use parity::ParityValidator;
pub use pipeline::builder::HarnessBuilder;
pub use pipeline::defaults::ViterbiForcedAligner;
pub use pipeline::model_runtime::{GraphSession, SessionExpectations};
pub use pipeline::runtime::{normalize_audio, AlignmentProbe, ConversionHarness, ConversionOutcome, HarnessReport};
pub use pipeline::traits::{ForcedAlignPrimitive, InferenceSession, TraceableModel};
pub use quantize::{QuantizationReport, Quantizer};
pub use types::{AxisRole, BoundaryComparison, BoundarySet, DecisionPath, NamedTensors, Precision, Verdict};
