use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::CtcModelConfig;
use crate::error::Result;
use crate::model::layers::{
    group_norm_1d, layer_norm, qualified_name, Conv1d, GroupNorm1d, LayerNorm, Param,
};
use crate::model::ops::{Conv1dParams, GraphOps};

enum StageNorm {
    /// Normalizes over channels at every time step.
    Channel(LayerNorm),
    /// One group per channel, normalized over time.
    PerChannel(GroupNorm1d),
    Identity,
}

struct StageShape {
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
}

struct ConvStage {
    conv: Conv1d,
    norm: StageNorm,
}

impl ConvStage {
    fn load(cfg: &CtcModelConfig, index: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let shape = StageShape {
            in_channels: index.checked_sub(1).map_or(1, |prev| cfg.conv_dim[prev]),
            out_channels: cfg.conv_dim[index],
            kernel: cfg.conv_kernel[index],
            stride: cfg.conv_stride[index],
        };

        let conv_vb = vb.pp("conv");
        let weight = Param::load(
            &conv_vb,
            (shape.out_channels, shape.in_channels, shape.kernel),
            "weight",
        )?;
        let bias = cfg
            .conv_bias
            .then(|| Param::load(&conv_vb, shape.out_channels, "bias"))
            .transpose()?;
        let conv = Conv1d::new(
            weight,
            bias,
            Conv1dParams {
                stride: shape.stride,
                ..Default::default()
            },
        );

        let eps = cfg.layer_norm_eps;
        let norm = match cfg.feat_extract_norm.as_str() {
            "layer" => StageNorm::Channel(layer_norm(shape.out_channels, eps, vb.pp("layer_norm"))?),
            // group mode only normalizes the first stage
            "group" if index == 0 => StageNorm::PerChannel(group_norm_1d(
                shape.out_channels,
                shape.out_channels,
                eps,
                vb.pp("layer_norm"),
            )?),
            _ => StageNorm::Identity,
        };
        Ok(Self { conv, norm })
    }

    fn forward<O: GraphOps>(&self, ops: &mut O, xs: &O::Value) -> Result<O::Value> {
        let convolved = self.conv.forward(ops, xs)?;
        let normed = match &self.norm {
            StageNorm::PerChannel(norm) => norm.forward(ops, &convolved)?,
            StageNorm::Channel(norm) => {
                let time_major = ops.transpose(&convolved, 1, 2)?;
                let time_major = norm.forward(ops, &time_major)?;
                ops.transpose(&time_major, 1, 2)?
            }
            StageNorm::Identity => convolved,
        };
        ops.gelu(&normed)
    }
}

pub(crate) struct FeatureExtractor {
    stages: Vec<ConvStage>,
}

impl FeatureExtractor {
    pub(crate) fn load(cfg: &CtcModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let stages = (0..cfg.conv_dim.len())
            .map(|idx| ConvStage::load(cfg, idx, vb.pp(format!("conv_layers.{idx}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { stages })
    }

    /// `[batch, 1, samples] -> [batch, channels, frames]`
    pub(crate) fn forward<O: GraphOps>(&self, ops: &mut O, xs: &O::Value) -> Result<O::Value> {
        self.stages
            .iter()
            .try_fold(xs.clone(), |hidden, stage| stage.forward(ops, &hidden))
    }
}

/// Loads a convolution stored either plainly or weight-normalized
/// (`weight_g`/`weight_v`), folding the normalization into a plain weight.
pub(crate) fn load_weight_norm_conv(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    params: Conv1dParams,
    vb: VarBuilder,
) -> candle_core::Result<Conv1d> {
    let shape = (out_channels, in_channels / params.groups, kernel);
    let weight = match vb.get(shape, "weight_v") {
        Ok(direction) => {
            let magnitude = vb
                .get((1, 1, kernel), "weight_g")
                .or_else(|_| vb.get((out_channels, 1, 1), "weight_g"))?;
            fold_weight_norm(&direction, &magnitude, kernel)?
        }
        Err(_) => vb.get(shape, "weight")?,
    };

    let bias = Param::load(&vb, out_channels, "bias")?;
    Ok(Conv1d::new(
        Param::new(qualified_name(&vb, "weight"), weight),
        Some(bias),
        params,
    ))
}

/// `g * v / ||v||`, where the norm runs over every axis except the one `g`
/// keeps (the kernel axis for `[1, 1, k]`, output channels for `[o, 1, 1]`).
fn fold_weight_norm(
    direction: &Tensor,
    magnitude: &Tensor,
    kernel: usize,
) -> candle_core::Result<Tensor> {
    let kernel_axis = magnitude.dims3()? == (1, 1, kernel);
    let norm = if kernel_axis {
        direction.sqr()?.sum_keepdim(0)?.sum_keepdim(1)?.sqrt()?
    } else {
        direction.sqr()?.sum_keepdim(2)?.sum_keepdim(1)?.sqrt()?
    };
    direction.broadcast_div(&norm)?.broadcast_mul(magnitude)
}
