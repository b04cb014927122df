use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConversionError, Result};

/// Locations and runtime settings for one conversion run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub model_path: String,
    pub config_path: String,
    pub labels_path: String,
    pub device: String,
    pub expected_sample_rate_hz: u32,
}

impl HarnessConfig {
    pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 16_000;
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            config_path: String::new(),
            labels_path: String::new(),
            device: "cpu".to_string(),
            expected_sample_rate_hz: Self::DEFAULT_SAMPLE_RATE_HZ,
        }
    }
}

/// Architecture hyper-parameters of the reference CTC model (`config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtcModelConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub conv_dim: Vec<usize>,
    pub conv_kernel: Vec<usize>,
    pub conv_stride: Vec<usize>,
    pub num_conv_pos_embeddings: usize,
    pub num_conv_pos_embedding_groups: usize,
    #[serde(default)]
    pub do_stable_layer_norm: bool,
    #[serde(default = "default_eps")]
    pub layer_norm_eps: f64,
    pub pad_token_id: usize,
    pub vocab_size: usize,
    #[serde(default = "default_feat_norm")]
    pub feat_extract_norm: String,
    #[serde(default = "default_conv_bias")]
    pub conv_bias: bool,
}

fn default_eps() -> f64 {
    1e-5
}
fn default_feat_norm() -> String {
    "layer".to_string()
}
fn default_conv_bias() -> bool {
    true
}

impl CtcModelConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ConversionError::io("read config.json", e))?;
        serde_json::from_str(&data).map_err(|e| ConversionError::json("parse config.json", e))
    }

    pub fn frame_stride_ms(&self, sample_rate: u32) -> f64 {
        let stride_samples: usize = self.conv_stride.iter().product();
        stride_samples as f64 / sample_rate as f64 * 1000.0
    }

    /// Number of emission frames the conv stack produces for `num_samples` input samples.
    pub fn expected_frame_count(&self, num_samples: usize) -> usize {
        self.conv_kernel
            .iter()
            .zip(&self.conv_stride)
            .fold(num_samples, |len, (&kernel, &stride)| {
                if len < kernel {
                    0
                } else {
                    (len - kernel) / stride + 1
                }
            })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.conv_dim.len() != self.conv_kernel.len()
            || self.conv_dim.len() != self.conv_stride.len()
        {
            return Err(ConversionError::invalid_input(format!(
                "conv_dim/conv_kernel/conv_stride lengths differ: {}/{}/{}",
                self.conv_dim.len(),
                self.conv_kernel.len(),
                self.conv_stride.len()
            )));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(ConversionError::invalid_input(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(())
    }
}

/// Serialization knobs for the graph exporter.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub input_name: String,
    pub output_name: String,
    /// Initializers larger than this many bytes go to the sidecar weight blob.
    pub inline_threshold_bytes: usize,
}

impl ExportOptions {
    pub const DEFAULT_INPUT_NAME: &'static str = "audio";
    pub const DEFAULT_OUTPUT_NAME: &'static str = "emissions";
    pub const DEFAULT_INLINE_THRESHOLD_BYTES: usize = 1024;
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            input_name: Self::DEFAULT_INPUT_NAME.to_string(),
            output_name: Self::DEFAULT_OUTPUT_NAME.to_string(),
            inline_threshold_bytes: Self::DEFAULT_INLINE_THRESHOLD_BYTES,
        }
    }
}

/// Acceptance policy and battery shape for the parity validator.
#[derive(Debug, Clone, Serialize)]
pub struct ParityConfig {
    /// Max elementwise difference allowed between reference and exported graph.
    pub tolerance: f32,
    /// Mean argmax agreement at or above this rate passes without caveat.
    pub pass_rate: f64,
    /// Mean argmax agreement at or above this rate (and below `pass_rate`) warns.
    pub warn_rate: f64,
    pub sample_rate_hz: u32,
    pub noise_durations_sec: Vec<f64>,
    pub silence_durations_sec: Vec<f64>,
    pub noise_amplitude: f32,
    pub seed: u64,
    pub sweep_durations_sec: Vec<f64>,
    /// Run battery cases on the rayon pool. Disable for runtimes without call-level isolation.
    pub parallel: bool,
}

impl ParityConfig {
    pub const DEFAULT_TOLERANCE: f32 = 1e-4;
    pub const DEFAULT_PASS_RATE: f64 = 0.95;
    pub const DEFAULT_WARN_RATE: f64 = 0.90;
    pub const DEFAULT_SEED: u64 = 42;
    pub const DEFAULT_NOISE_AMPLITUDE: f32 = 0.1;

    /// Rates must lie in `[0, 1]` with `warn_rate <= pass_rate`.
    pub fn validate(&self) -> Result<()> {
        let in_unit = |rate: f64| (0.0..=1.0).contains(&rate);
        if !in_unit(self.pass_rate) || !in_unit(self.warn_rate) {
            return Err(ConversionError::invalid_input(format!(
                "pass_rate {} and warn_rate {} must lie in [0, 1]",
                self.pass_rate, self.warn_rate
            )));
        }
        if self.warn_rate > self.pass_rate {
            return Err(ConversionError::invalid_input(format!(
                "warn_rate {} must not exceed pass_rate {}",
                self.warn_rate, self.pass_rate
            )));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(ConversionError::invalid_input(format!(
                "tolerance {} must be a positive number",
                self.tolerance
            )));
        }
        Ok(())
    }
}

impl Default for ParityConfig {
    fn default() -> Self {
        Self {
            tolerance: Self::DEFAULT_TOLERANCE,
            pass_rate: Self::DEFAULT_PASS_RATE,
            warn_rate: Self::DEFAULT_WARN_RATE,
            sample_rate_hz: HarnessConfig::DEFAULT_SAMPLE_RATE_HZ,
            noise_durations_sec: vec![1.0, 2.0, 5.0],
            silence_durations_sec: vec![1.0],
            noise_amplitude: Self::DEFAULT_NOISE_AMPLITUDE,
            seed: Self::DEFAULT_SEED,
            sweep_durations_sec: vec![0.5, 1.0, 2.0, 5.0],
            parallel: true,
        }
    }
}

/// Which operator classes the quantizer may rewrite, and how.
#[derive(Debug, Clone, Serialize)]
pub struct QuantizationConfig {
    pub op_types: Vec<String>,
    pub per_channel: bool,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            op_types: vec!["MatMul".to_string(), "Gemm".to_string()],
            per_channel: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_CONFIG_JSON: &str = r#"{
        "hidden_size": 768,
        "num_hidden_layers": 12,
        "num_attention_heads": 12,
        "intermediate_size": 3072,
        "conv_dim": [512, 512, 512, 512, 512, 512, 512],
        "conv_kernel": [10, 3, 3, 3, 3, 2, 2],
        "conv_stride": [5, 2, 2, 2, 2, 2, 2],
        "num_conv_pos_embeddings": 128,
        "num_conv_pos_embedding_groups": 16,
        "pad_token_id": 0,
        "vocab_size": 29
    }"#;

    #[test]
    fn harness_config_default() {
        let config = HarnessConfig::default();
        assert!(config.model_path.is_empty());
        assert!(config.labels_path.is_empty());
        assert_eq!(config.device, "cpu");
        assert_eq!(config.expected_sample_rate_hz, 16_000);
    }

    #[test]
    fn model_config_frame_stride_is_twenty_ms() {
        let cfg: CtcModelConfig = serde_json::from_str(MINIMAL_CONFIG_JSON).expect("valid json");
        // stride product = 320, 320 / 16000 * 1000 = 20 ms
        assert!((cfg.frame_stride_ms(16_000) - 20.0).abs() < 1e-9);
        assert_eq!(cfg.feat_extract_norm, "layer");
        assert!(cfg.conv_bias);
        cfg.validate().expect("consistent config");
    }

    #[test]
    fn expected_frame_count_follows_conv_arithmetic() {
        let cfg: CtcModelConfig = serde_json::from_str(MINIMAL_CONFIG_JSON).expect("valid json");
        assert_eq!(cfg.expected_frame_count(16_000), 49);
        assert_eq!(cfg.expected_frame_count(32_000), 99);
        assert_eq!(cfg.expected_frame_count(8_000), 24);
        assert_eq!(cfg.expected_frame_count(5), 0);
    }

    #[test]
    fn validate_rejects_mismatched_conv_lists() {
        let mut cfg: CtcModelConfig =
            serde_json::from_str(MINIMAL_CONFIG_JSON).expect("valid json");
        cfg.conv_stride.pop();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parity_defaults_match_acceptance_policy() {
        let cfg = ParityConfig::default();
        assert_eq!(cfg.tolerance, 1e-4);
        assert_eq!(cfg.pass_rate, 0.95);
        assert_eq!(cfg.warn_rate, 0.90);
        assert_eq!(cfg.silence_durations_sec, vec![1.0]);
        assert_eq!(cfg.noise_durations_sec, vec![1.0, 2.0, 5.0]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parity_thresholds_must_be_ordered() {
        let cfg = ParityConfig {
            pass_rate: 0.90,
            warn_rate: 0.95,
            ..ParityConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(err.to_string().contains("must not exceed"));

        let out_of_range = ParityConfig {
            pass_rate: 95.0,
            ..ParityConfig::default()
        };
        assert!(out_of_range.validate().is_err());
    }
}
