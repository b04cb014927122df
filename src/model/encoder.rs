use candle_nn::VarBuilder;

use crate::config::CtcModelConfig;
use crate::error::Result;
use crate::model::feature_extractor::load_weight_norm_conv;
use crate::model::layers::{layer_norm, linear, Conv1d, LayerNorm, Linear};
use crate::model::ops::{Conv1dParams, GraphOps};

/// Grouped convolution over time whose output is added to the projected
/// features in place of a learned position table.
struct ConvPositional {
    conv: Conv1d,
    /// Even kernels produce one extra frame with symmetric padding.
    trim_last: bool,
}

impl ConvPositional {
    fn load(cfg: &CtcModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let kernel = cfg.num_conv_pos_embeddings;
        let conv = load_weight_norm_conv(
            cfg.hidden_size,
            cfg.hidden_size,
            kernel,
            Conv1dParams {
                padding: kernel / 2,
                groups: cfg.num_conv_pos_embedding_groups,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        Ok(Self {
            conv,
            trim_last: kernel % 2 == 0,
        })
    }

    fn forward<O: GraphOps>(&self, ops: &mut O, xs: &O::Value) -> Result<O::Value> {
        let channels_first = ops.transpose(xs, 1, 2)?;
        let mut mixed = self.conv.forward(ops, &channels_first)?;
        if self.trim_last {
            mixed = ops.drop_tail(&mixed, 2, 1)?;
        }
        let mixed = ops.gelu(&mixed)?;
        ops.transpose(&mixed, 1, 2)
    }
}

struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    proj: Linear,
    heads: usize,
    query_scale: f64,
}

impl MultiHeadAttention {
    fn load(cfg: &CtcModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let width = cfg.hidden_size;
        let head_dim = width / cfg.num_attention_heads;
        let square = |name: &str| linear(width, width, vb.pp(name));
        Ok(Self {
            query: square("q_proj")?,
            key: square("k_proj")?,
            value: square("v_proj")?,
            proj: square("out_proj")?,
            heads: cfg.num_attention_heads,
            query_scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn forward<O: GraphOps>(&self, ops: &mut O, xs: &O::Value) -> Result<O::Value> {
        let query = self.query.forward(ops, xs)?;
        let query = ops.scale(&query, self.query_scale)?;
        let query = ops.split_heads(&query, self.heads)?;
        let key = self.key.forward(ops, xs)?;
        let key = ops.split_heads(&key, self.heads)?;
        let value = self.value.forward(ops, xs)?;
        let value = ops.split_heads(&value, self.heads)?;

        let key_t = ops.transpose(&key, 2, 3)?;
        let logits = ops.matmul(&query, &key_t)?;
        let weights = ops.softmax(&logits)?;
        let context = ops.matmul(&weights, &value)?;
        let context = ops.merge_heads(&context)?;
        self.proj.forward(ops, &context)
    }
}

struct PositionwiseMlp {
    expand: Linear,
    contract: Linear,
}

impl PositionwiseMlp {
    fn load(cfg: &CtcModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let (width, inner) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(Self {
            expand: linear(width, inner, vb.pp("intermediate_dense"))?,
            contract: linear(inner, width, vb.pp("output_dense"))?,
        })
    }

    fn forward<O: GraphOps>(&self, ops: &mut O, xs: &O::Value) -> Result<O::Value> {
        let inner = self.expand.forward(ops, xs)?;
        let inner = ops.gelu(&inner)?;
        self.contract.forward(ops, &inner)
    }
}

struct TransformerBlock {
    attention: MultiHeadAttention,
    attention_norm: LayerNorm,
    mlp: PositionwiseMlp,
    mlp_norm: LayerNorm,
    pre_norm: bool,
}

impl TransformerBlock {
    fn load(cfg: &CtcModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let norm = |name: &str| layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp(name));
        Ok(Self {
            attention: MultiHeadAttention::load(cfg, vb.pp("attention"))?,
            attention_norm: norm("layer_norm")?,
            mlp: PositionwiseMlp::load(cfg, vb.pp("feed_forward"))?,
            mlp_norm: norm("final_layer_norm")?,
            pre_norm: cfg.do_stable_layer_norm,
        })
    }

    fn forward<O: GraphOps>(&self, ops: &mut O, xs: &O::Value) -> Result<O::Value> {
        if self.pre_norm {
            let normed = self.attention_norm.forward(ops, xs)?;
            let attended = self.attention.forward(ops, &normed)?;
            let residual = ops.add(xs, &attended)?;
            let normed = self.mlp_norm.forward(ops, &residual)?;
            let projected = self.mlp.forward(ops, &normed)?;
            return ops.add(&residual, &projected);
        }

        // post-norm: each residual sum is normalized before the next sublayer
        let attended = self.attention.forward(ops, xs)?;
        let residual = ops.add(xs, &attended)?;
        let residual = self.attention_norm.forward(ops, &residual)?;
        let projected = self.mlp.forward(ops, &residual)?;
        let out = ops.add(&residual, &projected)?;
        self.mlp_norm.forward(ops, &out)
    }
}

pub(crate) struct Encoder {
    positional: ConvPositional,
    final_norm: LayerNorm,
    blocks: Vec<TransformerBlock>,
}

impl Encoder {
    pub(crate) fn load(cfg: &CtcModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let blocks = (0..cfg.num_hidden_layers)
            .map(|idx| TransformerBlock::load(cfg, vb.pp(format!("layers.{idx}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            positional: ConvPositional::load(cfg, vb.pp("pos_conv_embed"))?,
            final_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            blocks,
        })
    }

    pub(crate) fn forward<O: GraphOps>(&self, ops: &mut O, xs: &O::Value) -> Result<O::Value> {
        let positional = self.positional.forward(ops, xs)?;
        let mut hidden = ops.add(xs, &positional)?;
        for block in &self.blocks {
            hidden = block.forward(ops, &hidden)?;
        }
        self.final_norm.forward(ops, &hidden)
    }
}
