//! Weight-only int8 rewrite of an exported graph with dynamic activation quantization.

pub mod int8;

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::config::QuantizationConfig;
use crate::error::Result;
use crate::export::graph::{ExportedGraph, Initializer, Node, Op, TensorData};
use crate::types::Precision;

pub use int8::{dynamic_quantized_linear, quantize_activations, quantize_weight, QuantizedWeight};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedNode {
    pub node: String,
    pub class: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuantizationReport {
    pub quantized_nodes: usize,
    /// Nodes of a selected class that stayed in f32.
    pub skipped: Vec<SkippedNode>,
    pub f32_size_bytes: usize,
    pub int8_size_bytes: usize,
    pub compression_ratio: f64,
}

pub struct Quantizer {
    config: QuantizationConfig,
}

impl Quantizer {
    pub fn new(config: QuantizationConfig) -> Self {
        Self { config }
    }

    /// Builds a quantized copy of `graph`; the input graph is left untouched.
    pub fn quantize(&self, graph: &ExportedGraph) -> Result<(ExportedGraph, QuantizationReport)> {
        let selected: BTreeSet<&str> = self.config.op_types.iter().map(String::as_str).collect();
        let mut initializers = graph.initializers().clone();
        let mut nodes = Vec::with_capacity(graph.nodes().len());
        let mut skipped = Vec::new();
        let mut quantized_nodes = 0usize;

        for node in graph.nodes() {
            let class = node.op.class();
            if !selected.contains(class) {
                nodes.push(node.clone());
                continue;
            }
            match self.rewrite(node, graph, &mut initializers) {
                Ok(rewritten) => {
                    quantized_nodes += 1;
                    nodes.push(rewritten);
                }
                Err(reason) => {
                    tracing::debug!(node = %node.name, class, %reason, "node left in f32");
                    skipped.push(SkippedNode {
                        node: node.name.clone(),
                        class: class.to_string(),
                        reason,
                    });
                    nodes.push(node.clone());
                }
            }
        }

        let referenced: BTreeSet<&str> = nodes
            .iter()
            .flat_map(|n| n.inputs.iter().map(String::as_str))
            .collect();
        initializers.retain(|name, _| referenced.contains(name.as_str()));

        let quantized = ExportedGraph::from_parts(
            Precision::Int8Dynamic,
            graph.inline_threshold_bytes(),
            graph.inputs().to_vec(),
            graph.outputs().to_vec(),
            nodes,
            initializers,
        );

        let f32_size_bytes = graph.total_size_bytes()?;
        let int8_size_bytes = quantized.total_size_bytes()?;
        let compression_ratio = if int8_size_bytes > 0 {
            f32_size_bytes as f64 / int8_size_bytes as f64
        } else {
            0.0
        };

        tracing::info!(
            quantized_nodes,
            skipped = skipped.len(),
            f32_size_bytes,
            int8_size_bytes,
            compression_ratio,
            "graph quantized"
        );

        Ok((
            quantized,
            QuantizationReport {
                quantized_nodes,
                skipped,
                f32_size_bytes,
                int8_size_bytes,
                compression_ratio,
            },
        ))
    }

    /// Returns the rewritten node, or the reason it has to stay in f32.
    fn rewrite(
        &self,
        node: &Node,
        graph: &ExportedGraph,
        initializers: &mut BTreeMap<String, Initializer>,
    ) -> std::result::Result<Node, String> {
        let (activation, weight_name, bias, transpose) = match node.op {
            Op::Linear => match node.inputs.as_slice() {
                [x, w] => (x, w, None, false),
                [x, w, b] => (x, w, Some(b), false),
                _ => return Err(format!("unexpected operand count {}", node.inputs.len())),
            },
            Op::MatMul => match node.inputs.as_slice() {
                [a, b] => (a, b, None, true),
                _ => return Err(format!("unexpected operand count {}", node.inputs.len())),
            },
            _ => return Err("operator has no int8 kernel".to_string()),
        };

        let weight = graph
            .initializer(weight_name)
            .ok_or_else(|| "weight operand is computed at run time".to_string())?;
        let TensorData::F32(values) = &weight.data else {
            return Err("weight is not f32".to_string());
        };
        let [rows, cols] = weight.shape[..] else {
            return Err(format!("weight has rank {}, expected 2", weight.shape.len()));
        };

        // Linear weights are already [out, in]; constant MatMul operands are [in, out].
        let (out_features, in_features, row_major) = if transpose {
            let mut t = vec![0f32; values.len()];
            for r in 0..rows {
                for c in 0..cols {
                    t[c * rows + r] = values[r * cols + c];
                }
            }
            (cols, rows, t)
        } else {
            (rows, cols, values.clone())
        };

        let quantized_name = format!("{weight_name}_quantized");
        let scale_name = format!("{weight_name}_scale");
        if !initializers.contains_key(&quantized_name) {
            let q = quantize_weight(&row_major, out_features, in_features, self.config.per_channel);
            let scale_len = q.scales.len();
            initializers.insert(
                quantized_name.clone(),
                Initializer {
                    name: quantized_name.clone(),
                    shape: vec![out_features, in_features],
                    data: TensorData::I8(q.values),
                },
            );
            initializers.insert(
                scale_name.clone(),
                Initializer {
                    name: scale_name.clone(),
                    shape: vec![scale_len],
                    data: TensorData::F32(q.scales),
                },
            );
        }

        let mut inputs = vec![activation.clone(), quantized_name, scale_name];
        inputs.extend(bias.cloned());
        Ok(Node {
            name: format!("{}_quant", node.name),
            op: Op::QuantizedLinear,
            inputs,
            outputs: node.outputs.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::graph::{AxisInfo, ValueInfo};
    use crate::types::AxisRole;

    fn init(name: &str, shape: Vec<usize>, values: Vec<f32>) -> (String, Initializer) {
        (
            name.to_string(),
            Initializer {
                name: name.to_string(),
                shape,
                data: TensorData::F32(values),
            },
        )
    }

    fn value(name: &str) -> ValueInfo {
        ValueInfo {
            name: name.to_string(),
            axes: vec![
                AxisInfo {
                    name: Some("batch".into()),
                    role: AxisRole::Batch,
                    size: None,
                },
                AxisInfo {
                    name: None,
                    role: AxisRole::Fixed,
                    size: Some(4),
                },
            ],
        }
    }

    /// x -> Gemm(w, b) -> MatMul(m) -> MatMul(runtime) -> Conv
    fn graph() -> ExportedGraph {
        let initializers = BTreeMap::from([
            init("w", vec![4, 4], (0..16).map(|i| i as f32 / 16.0 - 0.5).collect()),
            init("b", vec![4], vec![0.1; 4]),
            init("m", vec![4, 4], (0..16).map(|i| (i % 5) as f32 - 2.0).collect()),
            init("k", vec![4, 4, 1], vec![0.5; 16]),
        ]);
        let node = |name: &str, op: Op, inputs: &[&str], out: &str| Node {
            name: name.to_string(),
            op,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: vec![out.to_string()],
        };
        ExportedGraph::from_parts(
            Precision::F32,
            1024,
            vec![value("x")],
            vec![value("y")],
            vec![
                node("gemm_0", Op::Linear, &["x", "w", "b"], "v0"),
                node("matmul_1", Op::MatMul, &["v0", "m"], "v1"),
                node("matmul_2", Op::MatMul, &["v1", "v0"], "v2"),
                node(
                    "conv_3",
                    Op::Conv1d {
                        stride: 1,
                        padding: 0,
                        groups: 1,
                    },
                    &["v2", "k"],
                    "y",
                ),
            ],
            initializers,
        )
    }

    #[test]
    fn rewrites_constant_weight_nodes_only() {
        let source = graph();
        let (q, report) = Quantizer::new(QuantizationConfig::default())
            .quantize(&source)
            .unwrap();
        assert_eq!(report.quantized_nodes, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].node, "matmul_2");
        assert_eq!(q.precision(), Precision::Int8Dynamic);
        assert_eq!(q.nodes()[0].op, Op::QuantizedLinear);
        assert_eq!(q.nodes()[0].inputs, vec!["x", "w_quantized", "w_scale", "b"]);
        assert_eq!(q.nodes()[3].op.class(), "Conv");
    }

    #[test]
    fn replaced_weights_are_dropped_and_source_is_untouched() {
        let source = graph();
        let before = source.clone();
        let (q, _) = Quantizer::new(QuantizationConfig::default())
            .quantize(&source)
            .unwrap();
        assert_eq!(source, before);
        assert!(q.initializer("w").is_none());
        assert!(q.initializer("m").is_none());
        assert!(q.initializer("k").is_some());
        let m = q.initializer("m_quantized").unwrap();
        assert_eq!(m.shape, vec![4, 4]);
        assert!(matches!(m.data, TensorData::I8(_)));
        assert_eq!(q.initializer("w_scale").unwrap().shape, vec![4]);
    }

    #[test]
    fn conv_is_quantizable_only_when_selected() {
        let config = QuantizationConfig {
            op_types: vec!["Conv".to_string()],
            per_channel: true,
        };
        let (q, report) = Quantizer::new(config).quantize(&graph()).unwrap();
        assert_eq!(report.quantized_nodes, 0);
        assert_eq!(report.skipped[0].reason, "operator has no int8 kernel");
        assert_eq!(q.nodes().len(), 4);
    }
}
