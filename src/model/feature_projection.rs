use candle_nn::VarBuilder;

use crate::config::CtcModelConfig;
use crate::error::Result;
use crate::model::layers::{layer_norm, linear, LayerNorm, Linear};
use crate::model::ops::GraphOps;

pub(crate) struct FeatureProjection {
    layer_norm: LayerNorm,
    projection: Linear,
}

impl FeatureProjection {
    pub(crate) fn load(cfg: &CtcModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let dim = *cfg.conv_dim.last().unwrap_or(&cfg.hidden_size);
        Ok(Self {
            layer_norm: layer_norm(dim, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            projection: linear(dim, cfg.hidden_size, vb.pp("projection"))?,
        })
    }

    pub(crate) fn forward<O: GraphOps>(&self, ops: &mut O, xs: &O::Value) -> Result<O::Value> {
        let h = self.layer_norm.forward(ops, xs)?;
        self.projection.forward(ops, &h)
    }
}
