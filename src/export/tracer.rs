//! Recording executor: runs the model eagerly while building the graph and a
//! symbolic shape for every value.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::{ConversionError, Result};
use crate::export::graph::{Initializer, Node, Op};
use crate::model::ops::{kernels, Conv1dParams, GraphOps};
use crate::types::AxisRole;

/// Symbolic size of one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymDim {
    Fixed(usize),
    /// Varies at call time; carries the role of the input axis it derives from.
    Dynamic(AxisRole),
}

impl SymDim {
    pub fn is_dynamic(self) -> bool {
        matches!(self, Self::Dynamic(_))
    }
}

#[derive(Debug, Clone)]
pub struct TracedValue {
    name: String,
    value: Tensor,
    dims: Vec<SymDim>,
}

impl TracedValue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tensor(&self) -> &Tensor {
        &self.value
    }

    pub fn dims(&self) -> &[SymDim] {
        &self.dims
    }

    fn role(&self, axis: usize) -> Option<AxisRole> {
        match self.dims.get(axis) {
            Some(SymDim::Dynamic(role)) => Some(*role),
            _ => None,
        }
    }

    fn roles(&self) -> Vec<Option<AxisRole>> {
        (0..self.dims.len()).map(|i| self.role(i)).collect()
    }
}

/// A read of a concrete dynamic-axis size during tracing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeCapture {
    pub value: String,
    pub axis: usize,
    pub role: AxisRole,
}

/// Everything a finished trace produced.
pub struct TraceParts {
    pub nodes: Vec<Node>,
    pub initializers: BTreeMap<String, Initializer>,
    pub captures: Vec<ShapeCapture>,
}

#[derive(Default)]
pub struct Tracer {
    nodes: Vec<Node>,
    initializers: BTreeMap<String, Initializer>,
    captures: Vec<ShapeCapture>,
    next_id: usize,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a graph input. `roles[i]` marks axis `i` dynamic; missing entries are fixed.
    pub fn input(&mut self, name: &str, tensor: &Tensor, roles: &[Option<AxisRole>]) -> TracedValue {
        let roles = (0..tensor.rank())
            .map(|i| roles.get(i).copied().flatten())
            .collect();
        TracedValue {
            name: name.to_string(),
            value: tensor.clone(),
            dims: resolve_dims(roles, tensor),
        }
    }

    pub fn captures(&self) -> &[ShapeCapture] {
        &self.captures
    }

    /// Renames `output` to `name` everywhere it is referenced and hands over the trace.
    pub fn finish(mut self, output: &TracedValue, name: &str) -> TraceParts {
        let old = output.name.as_str();
        if old != name {
            for node in &mut self.nodes {
                for slot in node.inputs.iter_mut().chain(node.outputs.iter_mut()) {
                    if slot == old {
                        *slot = name.to_string();
                    }
                }
            }
        }
        TraceParts {
            nodes: self.nodes,
            initializers: self.initializers,
            captures: self.captures,
        }
    }

    fn record(
        &mut self,
        op: Op,
        inputs: &[&TracedValue],
        value: candle_core::Result<Tensor>,
        roles: Vec<Option<AxisRole>>,
    ) -> Result<TracedValue> {
        let class = op.class();
        let value = value.map_err(|e| {
            ConversionError::export("trace", format!("{class} failed on example input: {e}"))
        })?;
        if roles.len() != value.rank() {
            return Err(ConversionError::export(
                "trace",
                format!(
                    "{class} produced rank {} but symbolic rank {}",
                    value.rank(),
                    roles.len()
                ),
            ));
        }
        let id = self.next_id;
        self.next_id += 1;
        let output = format!("v{id}");
        self.nodes.push(Node {
            name: format!("{}_{id}", class.to_ascii_lowercase()),
            op,
            inputs: inputs.iter().map(|v| v.name.clone()).collect(),
            outputs: vec![output.clone()],
        });
        let dims = resolve_dims(roles, &value);
        Ok(TracedValue {
            name: output,
            value,
            dims,
        })
    }
}

fn resolve_dims(roles: Vec<Option<AxisRole>>, tensor: &Tensor) -> Vec<SymDim> {
    roles
        .into_iter()
        .zip(tensor.dims())
        .map(|(role, &size)| match role {
            Some(role) => SymDim::Dynamic(role),
            None => SymDim::Fixed(size),
        })
        .collect()
}

/// Numpy-style broadcast of dynamic roles, aligned from the trailing axis.
fn broadcast_roles(a: &TracedValue, b: &TracedValue) -> Vec<Option<AxisRole>> {
    let rank = a.dims.len().max(b.dims.len());
    (0..rank)
        .map(|i| {
            let ra = (i + a.dims.len()).checked_sub(rank).and_then(|j| a.role(j));
            let rb = (i + b.dims.len()).checked_sub(rank).and_then(|j| b.role(j));
            ra.or(rb)
        })
        .collect()
}

impl GraphOps for Tracer {
    type Value = TracedValue;

    fn constant(&mut self, name: &str, tensor: &Tensor) -> Result<TracedValue> {
        if !self.initializers.contains_key(name) {
            let init = Initializer::from_tensor(name, tensor)
                .map_err(|e| ConversionError::export("record initializer", e))?;
            self.initializers.insert(name.to_string(), init);
        }
        Ok(TracedValue {
            name: name.to_string(),
            value: tensor.clone(),
            dims: tensor.dims().iter().map(|&d| SymDim::Fixed(d)).collect(),
        })
    }

    fn conv1d(
        &mut self,
        x: &TracedValue,
        weight: &TracedValue,
        bias: Option<&TracedValue>,
        params: Conv1dParams,
    ) -> Result<TracedValue> {
        let value = kernels::conv1d(&x.value, &weight.value, bias.map(|b| &b.value), params);
        let roles = vec![x.role(0), None, x.role(2)];
        let mut inputs = vec![x, weight];
        inputs.extend(bias);
        self.record(
            Op::Conv1d {
                stride: params.stride,
                padding: params.padding,
                groups: params.groups,
            },
            &inputs,
            value,
            roles,
        )
    }

    fn linear(
        &mut self,
        x: &TracedValue,
        weight: &TracedValue,
        bias: Option<&TracedValue>,
    ) -> Result<TracedValue> {
        let value = kernels::linear(&x.value, &weight.value, bias.map(|b| &b.value));
        let mut roles = x.roles();
        if let Some(last) = roles.last_mut() {
            *last = None;
        }
        let mut inputs = vec![x, weight];
        inputs.extend(bias);
        self.record(Op::Linear, &inputs, value, roles)
    }

    fn matmul(&mut self, a: &TracedValue, b: &TracedValue) -> Result<TracedValue> {
        let value = kernels::matmul(&a.value, &b.value);
        let rank = a.dims.len();
        let mut roles = broadcast_roles(a, b);
        if rank >= 2 && roles.len() == rank {
            roles[rank - 2] = a.role(rank - 2);
            roles[rank - 1] = b.role(b.dims.len().saturating_sub(1));
        }
        self.record(Op::MatMul, &[a, b], value, roles)
    }

    fn add(&mut self, a: &TracedValue, b: &TracedValue) -> Result<TracedValue> {
        let value = a.value.broadcast_add(&b.value);
        self.record(Op::Add, &[a, b], value, broadcast_roles(a, b))
    }

    fn scale(&mut self, x: &TracedValue, factor: f64) -> Result<TracedValue> {
        let value = x.value.affine(factor, 0.0);
        self.record(Op::Scale { factor }, &[x], value, x.roles())
    }

    fn gelu(&mut self, x: &TracedValue) -> Result<TracedValue> {
        let value = x.value.gelu();
        self.record(Op::Gelu, &[x], value, x.roles())
    }

    fn softmax(&mut self, x: &TracedValue) -> Result<TracedValue> {
        let value = candle_nn::ops::softmax_last_dim(&x.value);
        self.record(Op::Softmax, &[x], value, x.roles())
    }

    fn layer_norm(
        &mut self,
        x: &TracedValue,
        weight: &TracedValue,
        bias: &TracedValue,
        eps: f64,
    ) -> Result<TracedValue> {
        let value = kernels::layer_norm(&x.value, &weight.value, &bias.value, eps);
        self.record(Op::LayerNorm { eps }, &[x, weight, bias], value, x.roles())
    }

    fn group_norm(
        &mut self,
        x: &TracedValue,
        weight: &TracedValue,
        bias: &TracedValue,
        num_groups: usize,
        eps: f64,
    ) -> Result<TracedValue> {
        let value = kernels::group_norm(&x.value, &weight.value, &bias.value, num_groups, eps);
        self.record(
            Op::GroupNorm { num_groups, eps },
            &[x, weight, bias],
            value,
            x.roles(),
        )
    }

    fn transpose(&mut self, x: &TracedValue, dim0: usize, dim1: usize) -> Result<TracedValue> {
        let value = x.value.transpose(dim0, dim1).and_then(|t| t.contiguous());
        let mut roles = x.roles();
        if dim0 < roles.len() && dim1 < roles.len() {
            roles.swap(dim0, dim1);
        }
        self.record(Op::Transpose { dim0, dim1 }, &[x], value, roles)
    }

    fn unsqueeze(&mut self, x: &TracedValue, dim: usize) -> Result<TracedValue> {
        let value = x.value.unsqueeze(dim);
        let mut roles = x.roles();
        if dim <= roles.len() {
            roles.insert(dim, None);
        }
        self.record(Op::Unsqueeze { dim }, &[x], value, roles)
    }

    fn split_heads(&mut self, x: &TracedValue, num_heads: usize) -> Result<TracedValue> {
        let value = kernels::split_heads(&x.value, num_heads);
        let roles = vec![x.role(0), None, x.role(1), None];
        self.record(Op::SplitHeads { num_heads }, &[x], value, roles)
    }

    fn merge_heads(&mut self, x: &TracedValue) -> Result<TracedValue> {
        let value = kernels::merge_heads(&x.value);
        let roles = vec![x.role(0), x.role(2), None];
        self.record(Op::MergeHeads, &[x], value, roles)
    }

    fn drop_tail(&mut self, x: &TracedValue, axis: usize, count: usize) -> Result<TracedValue> {
        let value = kernels::drop_tail(&x.value, axis, count);
        self.record(Op::DropTail { axis, count }, &[x], value, x.roles())
    }

    fn dim(&mut self, x: &TracedValue, axis: usize) -> Result<usize> {
        if let Some(role) = x.role(axis) {
            tracing::debug!(value = %x.name, axis, ?role, "shape capture on dynamic axis");
            self.captures.push(ShapeCapture {
                value: x.name.clone(),
                axis,
                role,
            });
        }
        x.value
            .dim(axis)
            .map_err(|e| ConversionError::export("trace dim", e))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    fn audio_input(tracer: &mut Tracer, samples: usize) -> TracedValue {
        let t = Tensor::zeros((1, samples), DType::F32, &Device::Cpu).unwrap();
        tracer.input("audio", &t, &[Some(AxisRole::Batch), Some(AxisRole::Sequence)])
    }

    #[test]
    fn linear_keeps_leading_roles_and_fixes_features() {
        let mut tracer = Tracer::new();
        let x = audio_input(&mut tracer, 4);
        let w = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
        let w = tracer.constant("w", &w).unwrap();
        let y = tracer.linear(&x, &w, None).unwrap();
        assert_eq!(
            y.dims(),
            &[SymDim::Dynamic(AxisRole::Batch), SymDim::Fixed(3)]
        );
    }

    #[test]
    fn dim_on_dynamic_axis_is_captured() {
        let mut tracer = Tracer::new();
        let x = audio_input(&mut tracer, 8);
        assert_eq!(tracer.dim(&x, 1).unwrap(), 8);
        let u = tracer.unsqueeze(&x, 1).unwrap();
        assert_eq!(tracer.dim(&u, 1).unwrap(), 1);
        assert_eq!(
            tracer.captures(),
            &[ShapeCapture {
                value: "audio".into(),
                axis: 1,
                role: AxisRole::Sequence
            }]
        );
    }

    #[test]
    fn finish_renames_the_output_value() {
        let mut tracer = Tracer::new();
        let x = audio_input(&mut tracer, 8);
        let g = tracer.gelu(&x).unwrap();
        let parts = tracer.finish(&g, "emissions");
        assert_eq!(parts.nodes.len(), 1);
        assert_eq!(parts.nodes[0].outputs, vec!["emissions".to_string()]);
        assert_eq!(parts.nodes[0].inputs, vec!["audio".to_string()]);
    }

    #[test]
    fn constants_are_deduplicated_by_name() {
        let mut tracer = Tracer::new();
        let w = Tensor::ones(2, DType::F32, &Device::Cpu).unwrap();
        tracer.constant("w", &w).unwrap();
        tracer.constant("w", &w).unwrap();
        let x = audio_input(&mut tracer, 2);
        let parts = tracer.finish(&x, "audio");
        assert_eq!(parts.initializers.len(), 1);
    }
}
