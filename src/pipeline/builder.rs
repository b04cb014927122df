use std::path::Path;
use std::sync::Arc;

use candle_core::Device;

use crate::alignment::analyzer::AlignmentPathAnalyzer;
use crate::alignment::vocabulary::LabelVocabulary;
use crate::config::{CtcModelConfig, ExportOptions, HarnessConfig, ParityConfig, QuantizationConfig};
use crate::error::{ConversionError, Result};
use crate::export::exporter::GraphExporter;
use crate::export::normalizer::OutputNormalizer;
use crate::model::ctc_model::CtcAcousticModel;
use crate::parity::validator::ParityValidator;
use crate::pipeline::defaults::ViterbiForcedAligner;
use crate::pipeline::model_runtime::parse_device;
use crate::pipeline::runtime::{ConversionHarness, ConversionHarnessParts};
use crate::pipeline::traits::{ForcedAlignPrimitive, TraceableModel};
use crate::quantize::Quantizer;

/// Assembles a [`ConversionHarness`]. Anything not supplied is loaded from
/// the paths in [`HarnessConfig`] or falls back to its default.
#[derive(Default)]
pub struct HarnessBuilder {
    config: HarnessConfig,
    model: Option<(Arc<dyn TraceableModel>, CtcModelConfig)>,
    vocabulary: Option<LabelVocabulary>,
    forced_aligner: Option<Arc<dyn ForcedAlignPrimitive>>,
    parity: Option<ParityConfig>,
    quantization: QuantizationConfig,
    export_options: ExportOptions,
    session_device: Option<Device>,
}

impl HarnessBuilder {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Uses an in-memory model instead of `config.json` + safetensors.
    pub fn with_model(mut self, model: Arc<dyn TraceableModel>, model_config: CtcModelConfig) -> Self {
        self.model = Some((model, model_config));
        self
    }

    pub fn with_vocabulary(mut self, vocabulary: LabelVocabulary) -> Self {
        self.vocabulary = Some(vocabulary);
        self
    }

    pub fn with_forced_aligner(mut self, forced_aligner: Arc<dyn ForcedAlignPrimitive>) -> Self {
        self.forced_aligner = Some(forced_aligner);
        self
    }

    /// `sample_rate_hz` is replaced by the harness rate at build time.
    pub fn with_parity_config(mut self, parity: ParityConfig) -> Self {
        self.parity = Some(parity);
        self
    }

    pub fn with_quantization_config(mut self, quantization: QuantizationConfig) -> Self {
        self.quantization = quantization;
        self
    }

    pub fn with_export_options(mut self, export_options: ExportOptions) -> Self {
        self.export_options = export_options;
        self
    }

    pub fn with_session_device(mut self, device: Device) -> Self {
        self.session_device = Some(device);
        self
    }

    pub fn build(self) -> Result<ConversionHarness> {
        let device = match self.session_device {
            Some(device) => device,
            None => parse_device(&self.config.device)?,
        };

        let (model, model_cfg) = match self.model {
            Some(model) => model,
            None => {
                let model_cfg = CtcModelConfig::load(Path::new(&self.config.config_path))?;
                let model =
                    CtcAcousticModel::from_safetensors(Path::new(&self.config.model_path), &model_cfg, &device)?;
                (Arc::new(model) as Arc<dyn TraceableModel>, model_cfg)
            }
        };
        model_cfg.validate()?;

        let vocabulary = match self.vocabulary {
            Some(vocabulary) => vocabulary,
            None => LabelVocabulary::load(Path::new(&self.config.labels_path))?,
        };
        if vocabulary.len() != model_cfg.vocab_size {
            return Err(ConversionError::invalid_input(format!(
                "vocabulary has {} symbols, model emits {}",
                vocabulary.len(),
                model_cfg.vocab_size
            )));
        }
        if model_cfg.pad_token_id != vocabulary.blank_id() {
            tracing::warn!(
                pad_token_id = model_cfg.pad_token_id,
                blank_id = vocabulary.blank_id(),
                "model pad token is not the vocabulary's blank; CTC blank is taken from the vocabulary"
            );
        }

        let sample_rate_hz = if self.config.expected_sample_rate_hz == 0 {
            HarnessConfig::DEFAULT_SAMPLE_RATE_HZ
        } else {
            self.config.expected_sample_rate_hz
        };
        let parity = match self.parity {
            Some(parity) => {
                if parity.sample_rate_hz != sample_rate_hz {
                    tracing::warn!(
                        parity_rate_hz = parity.sample_rate_hz,
                        harness_rate_hz = sample_rate_hz,
                        "parity sample rate overridden by the harness's expected rate"
                    );
                }
                ParityConfig {
                    sample_rate_hz,
                    ..parity
                }
            }
            None => ParityConfig {
                sample_rate_hz,
                ..ParityConfig::default()
            },
        };
        parity.validate()?;
        let frame_stride_ms = model_cfg.frame_stride_ms(sample_rate_hz);

        let analyzer = AlignmentPathAnalyzer::new(
            Arc::new(vocabulary),
            self.forced_aligner
                .unwrap_or_else(|| Arc::new(ViterbiForcedAligner)),
            frame_stride_ms,
        );

        tracing::debug!(
            vocab = model_cfg.vocab_size,
            frame_stride_ms,
            sample_rate_hz,
            ?device,
            "conversion harness assembled"
        );

        Ok(ConversionHarness::from_parts(ConversionHarnessParts {
            reference: OutputNormalizer::new(model),
            model_config: model_cfg,
            exporter: GraphExporter::new(self.export_options),
            quantizer: Quantizer::new(self.quantization),
            validator: ParityValidator::new(parity, device.clone()),
            analyzer,
            device,
        }))
    }
}
