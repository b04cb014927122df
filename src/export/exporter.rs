use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::config::ExportOptions;
use crate::error::{ConversionError, Result};
use crate::export::graph::{AxisInfo, ExportedGraph, ValueInfo};
use crate::export::normalizer::OutputNormalizer;
use crate::export::tracer::{SymDim, Tracer};
use crate::types::{AxisRole, Precision};

/// `{value_name: {axis_index: (axis_name, role)}}`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AxisDeclaration {
    values: BTreeMap<String, BTreeMap<usize, (String, AxisRole)>>,
}

impl AxisDeclaration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn axis(
        mut self,
        value: impl Into<String>,
        index: usize,
        name: impl Into<String>,
        role: AxisRole,
    ) -> Self {
        self.values
            .entry(value.into())
            .or_default()
            .insert(index, (name.into(), role));
        self
    }

    /// Variable batch and time on the audio input; variable batch and frames,
    /// fixed vocabulary on the emissions.
    pub fn ctc_default(options: &ExportOptions) -> Self {
        Self::new()
            .axis(&options.input_name, 0, "batch", AxisRole::Batch)
            .axis(&options.input_name, 1, "time", AxisRole::Sequence)
            .axis(&options.output_name, 0, "batch", AxisRole::Batch)
            .axis(&options.output_name, 1, "frames", AxisRole::Sequence)
            .axis(&options.output_name, 2, "vocab", AxisRole::Fixed)
    }

    pub fn value_names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    fn axes_of(&self, value: &str) -> Option<&BTreeMap<usize, (String, AxisRole)>> {
        self.values.get(value)
    }

    fn check_ranks(&self, value: &str, rank: usize) -> Result<()> {
        if let Some(axes) = self.axes_of(value) {
            if let Some((&index, _)) = axes.iter().find(|(&index, _)| index >= rank) {
                return Err(ConversionError::export(
                    "check axis declaration",
                    format!("{value} has rank {rank}, axis {index} is out of range"),
                ));
            }
        }
        Ok(())
    }

    fn roles(&self, value: &str, rank: usize) -> Vec<Option<AxisRole>> {
        (0..rank)
            .map(|i| {
                self.axes_of(value)
                    .and_then(|axes| axes.get(&i))
                    .map(|(_, role)| *role)
                    .filter(|role| role.is_dynamic())
            })
            .collect()
    }

    fn value_info(&self, value: &str, dims: &[SymDim]) -> ValueInfo {
        let axes = dims
            .iter()
            .enumerate()
            .map(|(i, dim)| {
                let name = self
                    .axes_of(value)
                    .and_then(|axes| axes.get(&i))
                    .map(|(name, _)| name.clone());
                match *dim {
                    SymDim::Fixed(size) => AxisInfo {
                        name,
                        role: AxisRole::Fixed,
                        size: Some(size),
                    },
                    SymDim::Dynamic(role) => AxisInfo {
                        name: name.or_else(|| Some(format!("{value}_dim_{i}"))),
                        role,
                        size: None,
                    },
                }
            })
            .collect();
        ValueInfo {
            name: value.to_string(),
            axes,
        }
    }
}

/// Traces a normalized model into an [`ExportedGraph`].
#[derive(Debug, Clone, Default)]
pub struct GraphExporter {
    options: ExportOptions,
}

impl GraphExporter {
    pub fn new(options: ExportOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    pub fn export(
        &self,
        model: &OutputNormalizer,
        representative: &Tensor,
        axes: &AxisDeclaration,
    ) -> Result<ExportedGraph> {
        let input_name = self.options.input_name.as_str();
        let output_name = self.options.output_name.as_str();

        if let Some(unknown) = axes
            .value_names()
            .find(|name| *name != input_name && *name != output_name)
        {
            return Err(ConversionError::export(
                "check axis declaration",
                format!("unknown value {unknown}; graph has input {input_name} and output {output_name}"),
            ));
        }
        axes.check_ranks(input_name, representative.rank())?;

        let output_dims = model.check_contract(representative)?;
        axes.check_ranks(output_name, output_dims.len())?;

        let mut tracer = Tracer::new();
        let input = tracer.input(
            input_name,
            representative,
            &axes.roles(input_name, representative.rank()),
        );
        let output = model.trace(&mut tracer, &input)?;

        if let Some(capture) = tracer.captures().first() {
            return Err(ConversionError::export(
                "trace",
                format!(
                    "model read the concrete size of dynamic axis {} ({:?}) of {}; \
                     the graph would bake in the example shape",
                    capture.axis, capture.role, capture.value
                ),
            ));
        }

        if let Some(declared) = axes.axes_of(output_name) {
            for (&index, (name, role)) in declared {
                let traced = output.dims()[index];
                match (role.is_dynamic(), traced.is_dynamic()) {
                    (true, false) => {
                        return Err(ConversionError::export(
                            "check output axes",
                            format!("{output_name} axis {index} ({name}) is declared {role:?} but traced as fixed"),
                        ))
                    }
                    (false, true) => {
                        return Err(ConversionError::export(
                            "check output axes",
                            format!("{output_name} axis {index} ({name}) is declared fixed but varies with the input"),
                        ))
                    }
                    _ => {}
                }
            }
        }

        let inputs = vec![axes.value_info(input_name, input.dims())];
        let outputs = vec![axes.value_info(output_name, output.dims())];
        let parts = tracer.finish(&output, output_name);

        let graph = ExportedGraph::from_parts(
            Precision::F32,
            self.options.inline_threshold_bytes,
            inputs,
            outputs,
            parts.nodes,
            parts.initializers,
        );
        graph.validate().map_err(|e| ConversionError::export("validate traced graph", e))?;

        tracing::info!(
            nodes = graph.nodes().len(),
            initializers = graph.initializers().len(),
            input = input_name,
            output = output_name,
            example_shape = ?representative.dims(),
            "graph exported"
        );
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use candle_core::{DType, Device};

    use super::*;
    use crate::export::normalizer::ModelOutput;
    use crate::export::tracer::TracedValue;
    use crate::model::ops::{Eager, GraphOps};
    use crate::pipeline::traits::TraceableModel;

    /// Projects each sample to a 3-way distribution, optionally reading the
    /// sample count the way data-dependent models do.
    struct ToyModel {
        weight: Tensor,
        reads_length: bool,
    }

    impl ToyModel {
        fn new(reads_length: bool) -> Self {
            let weight = Tensor::new(&[[1f32], [-1.0], [0.5]], &Device::Cpu).unwrap();
            Self {
                weight,
                reads_length,
            }
        }

        fn forward<O: GraphOps>(&self, ops: &mut O, x: &O::Value) -> Result<ModelOutput<O::Value>> {
            if self.reads_length {
                let _ = ops.dim(x, 1)?;
            }
            let h = ops.unsqueeze(x, 2)?;
            let w = ops.constant("proj.weight", &self.weight)?;
            let y = ops.linear(&h, &w, None)?;
            Ok(ModelOutput::Tuple(vec![ModelOutput::Tensor(y), ModelOutput::Absent]))
        }
    }

    impl TraceableModel for ToyModel {
        fn forward_eager(&self, input: &Tensor) -> Result<ModelOutput<Tensor>> {
            self.forward(&mut Eager, input)
        }

        fn forward_traced(
            &self,
            tracer: &mut Tracer,
            input: &TracedValue,
        ) -> Result<ModelOutput<TracedValue>> {
            self.forward(tracer, input)
        }
    }

    /// Returns the audio untouched: a `[batch, samples]` output.
    struct PassThrough;

    impl TraceableModel for PassThrough {
        fn forward_eager(&self, input: &Tensor) -> Result<ModelOutput<Tensor>> {
            Ok(ModelOutput::Tensor(input.clone()))
        }

        fn forward_traced(
            &self,
            _tracer: &mut Tracer,
            input: &TracedValue,
        ) -> Result<ModelOutput<TracedValue>> {
            Ok(ModelOutput::Tensor(input.clone()))
        }
    }

    fn example() -> Tensor {
        Tensor::zeros((1, 10), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn exports_declared_axes() {
        let options = ExportOptions::default();
        let model = OutputNormalizer::new(Arc::new(ToyModel::new(false)));
        let graph = GraphExporter::new(options.clone())
            .export(&model, &example(), &AxisDeclaration::ctc_default(&options))
            .unwrap();
        let out = &graph.outputs()[0];
        assert_eq!(out.name, "emissions");
        assert_eq!(out.axes[1].role, AxisRole::Sequence);
        assert_eq!(out.axes[2].size, Some(3));
        assert_eq!(graph.nodes().last().unwrap().outputs, vec!["emissions".to_string()]);
    }

    #[test]
    fn shape_capture_fails_export() {
        let options = ExportOptions::default();
        let model = OutputNormalizer::new(Arc::new(ToyModel::new(true)));
        let err = GraphExporter::new(options.clone())
            .export(&model, &example(), &AxisDeclaration::ctc_default(&options))
            .unwrap_err();
        assert_eq!(err.kind(), "export_failure");
        assert!(err.to_string().contains("bake in"));
    }

    #[test]
    fn unknown_value_in_declaration_fails() {
        let options = ExportOptions::default();
        let model = OutputNormalizer::new(Arc::new(ToyModel::new(false)));
        let axes = AxisDeclaration::ctc_default(&options).axis("lengths", 0, "batch", AxisRole::Batch);
        let err = GraphExporter::new(options)
            .export(&model, &example(), &axes)
            .unwrap_err();
        assert_eq!(err.kind(), "export_failure");
    }

    #[test]
    fn axis_beyond_rank_fails() {
        let options = ExportOptions::default();
        let model = OutputNormalizer::new(Arc::new(ToyModel::new(false)));
        let axes = AxisDeclaration::ctc_default(&options).axis("audio", 4, "extra", AxisRole::Batch);
        assert!(GraphExporter::new(options)
            .export(&model, &example(), &axes)
            .is_err());
    }

    #[test]
    fn fixed_declaration_on_varying_axis_fails() {
        let options = ExportOptions::default();
        let model = OutputNormalizer::new(Arc::new(ToyModel::new(false)));
        let axes = AxisDeclaration::ctc_default(&options).axis("emissions", 1, "frames", AxisRole::Fixed);
        let err = GraphExporter::new(options)
            .export(&model, &example(), &axes)
            .unwrap_err();
        assert!(err.to_string().contains("declared fixed"));
    }

    #[test]
    fn rank_two_output_violates_contract() {
        let options = ExportOptions::default();
        let model = OutputNormalizer::new(Arc::new(PassThrough));
        let err = model.check_contract(&example()).unwrap_err();
        assert_eq!(err.kind(), "shape_contract_violation");
        assert!(err.to_string().contains("[1, 10]"));

        let err = GraphExporter::new(options.clone())
            .export(&model, &example(), &AxisDeclaration::ctc_default(&options))
            .unwrap_err();
        assert_eq!(err.kind(), "shape_contract_violation");
    }
}
