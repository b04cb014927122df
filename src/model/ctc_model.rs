use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::CtcModelConfig;
use crate::error::{ConversionError, Result};
use crate::export::normalizer::ModelOutput;
use crate::export::tracer::{TracedValue, Tracer};
use crate::model::encoder::Encoder;
use crate::model::feature_extractor::FeatureExtractor;
use crate::model::feature_projection::FeatureProjection;
use crate::model::layers::{linear, Linear};
use crate::model::ops::{Eager, GraphOps};
use crate::pipeline::traits::TraceableModel;

/// wav2vec2-style CTC acoustic model: raw 16 kHz audio in, per-frame logits out.
///
/// Like the training-framework original, `forward` returns a pair
/// `(emissions, lengths)` where `lengths` is absent for unpadded input.
pub struct CtcAcousticModel {
    feat_extract: FeatureExtractor,
    feat_proj: FeatureProjection,
    encoder: Encoder,
    lm_head: Linear,
}

impl CtcAcousticModel {
    pub fn load(cfg: &CtcModelConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        Self::load_inner(cfg, vb).map_err(|e| ConversionError::invalid_input(format!("build model: {e}")))
    }

    fn load_inner(cfg: &CtcModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let w = vb.pp("wav2vec2");
        Ok(Self {
            feat_extract: FeatureExtractor::load(cfg, w.pp("feature_extractor"))?,
            feat_proj: FeatureProjection::load(cfg, w.pp("feature_projection"))?,
            encoder: Encoder::load(cfg, w.pp("encoder"))?,
            lm_head: linear(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?,
        })
    }

    pub fn from_safetensors(path: &Path, cfg: &CtcModelConfig, device: &Device) -> Result<Self> {
        let model_data =
            std::fs::read(path).map_err(|e| ConversionError::io("read safetensors", e))?;
        let vb = VarBuilder::from_buffered_safetensors(model_data, DType::F32, device)
            .map_err(|e| ConversionError::safetensors("load safetensors", e))?;
        let model = Self::load(cfg, vb)?;

        tracing::info!(
            hidden_size = cfg.hidden_size,
            layers = cfg.num_hidden_layers,
            vocab = cfg.vocab_size,
            ?device,
            "reference CTC model loaded"
        );
        Ok(model)
    }

    /// `[batch, samples] -> ([batch, frames, vocab], lengths)`
    pub fn forward<O: GraphOps>(&self, ops: &mut O, audio: &O::Value) -> Result<ModelOutput<O::Value>> {
        let h = ops.unsqueeze(audio, 1)?;
        let h = self.feat_extract.forward(ops, &h)?;
        let h = ops.transpose(&h, 1, 2)?;
        let h = self.feat_proj.forward(ops, &h)?;
        let h = self.encoder.forward(ops, &h)?;
        let logits = self.lm_head.forward(ops, &h)?;
        Ok(ModelOutput::Tuple(vec![
            ModelOutput::Tensor(logits),
            ModelOutput::Absent,
        ]))
    }
}

impl TraceableModel for CtcAcousticModel {
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
