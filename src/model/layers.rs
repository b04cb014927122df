use candle_core::{Shape, Tensor};
use candle_nn::VarBuilder;

use crate::error::Result;
use crate::model::ops::{Conv1dParams, GraphOps};

/// A named weight. The name becomes the initializer name in exported graphs.
#[derive(Clone)]
pub(crate) struct Param {
    name: String,
    tensor: Tensor,
}

impl Param {
    pub(crate) fn load<S: Into<Shape>>(
        vb: &VarBuilder,
        shape: S,
        name: &str,
    ) -> candle_core::Result<Self> {
        let tensor = vb.get(shape, name)?;
        Ok(Self::new(qualified_name(vb, name), tensor))
    }

    pub(crate) fn new(name: String, tensor: Tensor) -> Self {
        Self { name, tensor }
    }

    pub(crate) fn bind<O: GraphOps>(&self, ops: &mut O) -> Result<O::Value> {
        ops.constant(&self.name, &self.tensor)
    }
}

pub(crate) fn qualified_name(vb: &VarBuilder, name: &str) -> String {
    let prefix = vb.prefix();
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

pub(crate) struct Linear {
    weight: Param,
    bias: Option<Param>,
}

impl Linear {
    pub(crate) fn forward<O: GraphOps>(&self, ops: &mut O, x: &O::Value) -> Result<O::Value> {
        let weight = self.weight.bind(ops)?;
        let bias = self.bias.as_ref().map(|b| b.bind(ops)).transpose()?;
        ops.linear(x, &weight, bias.as_ref())
    }
}

pub(crate) fn linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> candle_core::Result<Linear> {
    Ok(Linear {
        weight: Param::load(&vb, (out_dim, in_dim), "weight")?,
        bias: Some(Param::load(&vb, out_dim, "bias")?),
    })
}

pub(crate) struct Conv1d {
    weight: Param,
    bias: Option<Param>,
    params: Conv1dParams,
}

impl Conv1d {
    pub(crate) fn new(weight: Param, bias: Option<Param>, params: Conv1dParams) -> Self {
        Self {
            weight,
            bias,
            params,
        }
    }

    pub(crate) fn forward<O: GraphOps>(&self, ops: &mut O, x: &O::Value) -> Result<O::Value> {
        let weight = self.weight.bind(ops)?;
        let bias = self.bias.as_ref().map(|b| b.bind(ops)).transpose()?;
        ops.conv1d(x, &weight, bias.as_ref(), self.params)
    }
}

pub(crate) struct LayerNorm {
    weight: Param,
    bias: Param,
    eps: f64,
}

impl LayerNorm {
    pub(crate) fn forward<O: GraphOps>(&self, ops: &mut O, x: &O::Value) -> Result<O::Value> {
        let weight = self.weight.bind(ops)?;
        let bias = self.bias.bind(ops)?;
        ops.layer_norm(x, &weight, &bias, self.eps)
    }
}

pub(crate) fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> candle_core::Result<LayerNorm> {
    Ok(LayerNorm {
        weight: Param::load(&vb, size, "weight")?,
        bias: Param::load(&vb, size, "bias")?,
        eps,
    })
}

pub(crate) struct GroupNorm1d {
    weight: Param,
    bias: Param,
    eps: f64,
    num_groups: usize,
}

impl GroupNorm1d {
    pub(crate) fn forward<O: GraphOps>(&self, ops: &mut O, x: &O::Value) -> Result<O::Value> {
        let weight = self.weight.bind(ops)?;
        let bias = self.bias.bind(ops)?;
        ops.group_norm(x, &weight, &bias, self.num_groups, self.eps)
    }
}

pub(crate) fn group_norm_1d(
    num_groups: usize,
    num_channels: usize,
    eps: f64,
    vb: VarBuilder,
) -> candle_core::Result<GroupNorm1d> {
    Ok(GroupNorm1d {
        weight: Param::load(&vb, num_channels, "weight")?,
        bias: Param::load(&vb, num_channels, "bias")?,
        eps,
        num_groups,
    })
}
