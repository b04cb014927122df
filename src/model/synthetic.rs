//! Deterministic, seeded weights for the reference model, for tests and dry runs
//! without a downloaded checkpoint.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::CtcModelConfig;
use crate::error::{ConversionError, Result};
use crate::model::ctc_model::CtcAcousticModel;

/// Logit offset given to the blank class so silence decodes as blank, as it
/// does for a trained CTC head.
const BLANK_BIAS: f32 = 3.0;

enum Init {
    /// Uniform in `±1/sqrt(fan_in)`.
    Uniform { fan_in: usize },
    Ones,
    Zeros,
}

fn parameter_specs(cfg: &CtcModelConfig) -> Vec<(String, Vec<usize>, Init)> {
    let mut specs = Vec::new();
    let fe = "wav2vec2.feature_extractor";
    for i in 0..cfg.conv_dim.len() {
        let in_c = if i == 0 { 1 } else { cfg.conv_dim[i - 1] };
        let out_c = cfg.conv_dim[i];
        let kernel = cfg.conv_kernel[i];
        let p = format!("{fe}.conv_layers.{i}");
        specs.push((
            format!("{p}.conv.weight"),
            vec![out_c, in_c, kernel],
            Init::Uniform {
                fan_in: in_c * kernel,
            },
        ));
        if cfg.conv_bias {
            specs.push((
                format!("{p}.conv.bias"),
                vec![out_c],
                Init::Uniform {
                    fan_in: in_c * kernel,
                },
            ));
        }
        let normed = cfg.feat_extract_norm == "layer" || (cfg.feat_extract_norm == "group" && i == 0);
        if normed {
            push_norm(&mut specs, &format!("{p}.layer_norm"), out_c);
        }
    }

    let last = *cfg.conv_dim.last().unwrap_or(&cfg.hidden_size);
    let fp = "wav2vec2.feature_projection";
    push_norm(&mut specs, &format!("{fp}.layer_norm"), last);
    push_linear(&mut specs, &format!("{fp}.projection"), last, cfg.hidden_size);

    let enc = "wav2vec2.encoder";
    let groups = cfg.num_conv_pos_embedding_groups.max(1);
    let pos_fan_in = cfg.hidden_size / groups * cfg.num_conv_pos_embeddings;
    specs.push((
        format!("{enc}.pos_conv_embed.conv.weight"),
        vec![
            cfg.hidden_size,
            cfg.hidden_size / groups,
            cfg.num_conv_pos_embeddings,
        ],
        Init::Uniform { fan_in: pos_fan_in },
    ));
    specs.push((
        format!("{enc}.pos_conv_embed.conv.bias"),
        vec![cfg.hidden_size],
        Init::Uniform { fan_in: pos_fan_in },
    ));
    push_norm(&mut specs, &format!("{enc}.layer_norm"), cfg.hidden_size);

    for i in 0..cfg.num_hidden_layers {
        let l = format!("{enc}.layers.{i}");
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            push_linear(
                &mut specs,
                &format!("{l}.attention.{proj}"),
                cfg.hidden_size,
                cfg.hidden_size,
            );
        }
        push_norm(&mut specs, &format!("{l}.layer_norm"), cfg.hidden_size);
        push_linear(
            &mut specs,
            &format!("{l}.feed_forward.intermediate_dense"),
            cfg.hidden_size,
            cfg.intermediate_size,
        );
        push_linear(
            &mut specs,
            &format!("{l}.feed_forward.output_dense"),
            cfg.intermediate_size,
            cfg.hidden_size,
        );
        push_norm(&mut specs, &format!("{l}.final_layer_norm"), cfg.hidden_size);
    }

    push_linear(&mut specs, "lm_head", cfg.hidden_size, cfg.vocab_size);
    specs
}

fn push_linear(specs: &mut Vec<(String, Vec<usize>, Init)>, prefix: &str, in_dim: usize, out_dim: usize) {
    specs.push((
        format!("{prefix}.weight"),
        vec![out_dim, in_dim],
        Init::Uniform { fan_in: in_dim },
    ));
    specs.push((
        format!("{prefix}.bias"),
        vec![out_dim],
        Init::Uniform { fan_in: in_dim },
    ));
}

fn push_norm(specs: &mut Vec<(String, Vec<usize>, Init)>, prefix: &str, size: usize) {
    specs.push((format!("{prefix}.weight"), vec![size], Init::Ones));
    specs.push((format!("{prefix}.bias"), vec![size], Init::Zeros));
}

/// Seeded weight map covering every tensor [`CtcAcousticModel::load`] reads.
pub fn synthetic_weights(
    cfg: &CtcModelConfig,
    seed: u64,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut weights = HashMap::new();
    for (name, shape, init) in parameter_specs(cfg) {
        let numel: usize = shape.iter().product();
        let mut values: Vec<f32> = match init {
            Init::Uniform { fan_in } => {
                let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
                (0..numel).map(|_| rng.gen_range(-bound..bound)).collect()
            }
            Init::Ones => vec![1.0; numel],
            Init::Zeros => vec![0.0; numel],
        };
        if name == "lm_head.bias" {
            if let Some(blank) = values.get_mut(cfg.pad_token_id) {
                *blank += BLANK_BIAS;
            }
        }
        let tensor = Tensor::from_vec(values, shape, device)
            .map_err(|e| ConversionError::invalid_input(format!("synthetic tensor {name}: {e}")))?;
        weights.insert(name, tensor);
    }
    Ok(weights)
}

pub fn synthetic_model(cfg: &CtcModelConfig, seed: u64, device: &Device) -> Result<CtcAcousticModel> {
    let weights = synthetic_weights(cfg, seed, device)?;
    let vb = VarBuilder::from_tensors(weights, DType::F32, device);
    CtcAcousticModel::load(cfg, vb)
}

/// Writes the synthetic weights in the checkpoint layout `CtcAcousticModel::from_safetensors` reads.
pub fn save_synthetic_safetensors(cfg: &CtcModelConfig, seed: u64, path: &Path) -> Result<()> {
    let weights = synthetic_weights(cfg, seed, &Device::Cpu)?;
    candle_core::safetensors::save(&weights, path)
        .map_err(|e| ConversionError::safetensors("write synthetic safetensors", e))
}

/// Smallest config that still exercises every layer type.
#[cfg(test)]
pub(crate) fn tiny_config() -> CtcModelConfig {
    serde_json::from_str(
        r#"{
            "hidden_size": 16,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "intermediate_size": 32,
            "conv_dim": [8, 8, 8],
            "conv_kernel": [10, 3, 3],
            "conv_stride": [5, 2, 2],
            "num_conv_pos_embeddings": 4,
            "num_conv_pos_embedding_groups": 2,
            "pad_token_id": 0,
            "vocab_size": 6
        }"#,
    )
    .expect("valid config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::normalizer::normalize;
    use crate::pipeline::traits::TraceableModel;

    #[test]
    fn synthetic_weights_are_seed_deterministic() {
        let cfg = tiny_config();
        let a = synthetic_weights(&cfg, 7, &Device::Cpu).unwrap();
        let b = synthetic_weights(&cfg, 7, &Device::Cpu).unwrap();
        let name = "lm_head.weight";
        assert_eq!(
            a[name].flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b[name].flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn synthetic_model_emits_expected_shape() {
        let cfg = tiny_config();
        let model = synthetic_model(&cfg, 1, &Device::Cpu).expect("model loads");
        let audio = Tensor::zeros((2, 1600), DType::F32, &Device::Cpu).unwrap();
        let out = normalize(model.forward_eager(&audio).unwrap()).unwrap();
        assert_eq!(
            out.dims(),
            &[2, cfg.expected_frame_count(1600), cfg.vocab_size]
        );
    }
}
