pub mod exporter;
pub mod graph;
pub mod normalizer;
pub mod tracer;

pub use exporter::{AxisDeclaration, GraphExporter};
pub use graph::{ExportedGraph, Initializer, Node, Op, TensorData, ValueInfo};
pub use normalizer::{ModelOutput, OutputNormalizer};
