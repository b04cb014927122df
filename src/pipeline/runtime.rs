use candle_core::{Device, Tensor};
use serde::Serialize;

use crate::alignment::analyzer::{AlignmentComparison, AlignmentPathAnalyzer};
use crate::config::{CtcModelConfig, ParityConfig};
use crate::error::{ConversionError, Result};
use crate::export::exporter::{AxisDeclaration, GraphExporter};
use crate::export::graph::ExportedGraph;
use crate::export::normalizer::OutputNormalizer;
use crate::parity::battery::{Battery, TestCase};
use crate::parity::report::{PrecisionReport, RepresentationCase, SweepReport};
use crate::parity::validator::{CaseObserver, ParityValidator};
use crate::pipeline::model_runtime::{GraphSession, SessionExpectations};
use crate::pipeline::traits::InferenceSession;
use crate::quantize::{QuantizationReport, Quantizer};
use crate::types::{Precision, Verdict};

/// Audio plus transcript used to compare word boundaries across precisions.
#[derive(Debug, Clone)]
pub struct AlignmentProbe {
    pub name: String,
    pub samples: Vec<f32>,
    pub sample_rate_hz: u32,
    pub transcript: String,
}

impl AlignmentProbe {
    pub const DEFAULT_TRANSCRIPT: &'static str = "hello world";
    pub const DEFAULT_DURATION_SEC: f64 = 2.0;

    /// Seeded noise with the default transcript.
    pub fn synthetic(config: &ParityConfig) -> Self {
        Self::noise(Self::DEFAULT_DURATION_SEC, config, Self::DEFAULT_TRANSCRIPT)
    }

    pub fn noise(duration_sec: f64, config: &ParityConfig, transcript: &str) -> Self {
        let case = TestCase::noise(
            duration_sec,
            config.sample_rate_hz,
            config.noise_amplitude,
            config.seed,
        );
        Self {
            samples: case.samples(),
            name: case.name,
            sample_rate_hz: config.sample_rate_hz,
            transcript: transcript.to_string(),
        }
    }

    /// A real recording; samples are normalized to zero mean and unit variance.
    pub fn recording(name: &str, samples: &[f32], sample_rate_hz: u32, transcript: &str) -> Self {
        Self {
            name: name.to_string(),
            samples: normalize_audio(samples),
            sample_rate_hz,
            transcript: transcript.to_string(),
        }
    }

    fn audio(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_vec(self.samples.clone(), (1, self.samples.len()), device)
            .map_err(|e| ConversionError::invalid_input(format!("alignment probe {}: {e}", self.name)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphSummary {
    pub precision: Precision,
    pub nodes: usize,
    pub initializers: usize,
    pub size_bytes: usize,
}

impl GraphSummary {
    fn of(graph: &ExportedGraph) -> Result<Self> {
        Ok(Self {
            precision: graph.precision(),
            nodes: graph.nodes().len(),
            initializers: graph.initializers().len(),
            size_bytes: graph.total_size_bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AlignmentOutcome {
    Compared(AlignmentComparison),
    Failed { error_kind: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarnessReport {
    pub frame_stride_ms: f64,
    pub vocab_size: usize,
    pub f32_graph: GraphSummary,
    pub int8_graph: GraphSummary,
    /// Reference model vs. f32 graph, one entry per battery case.
    pub representation: Vec<RepresentationCase>,
    pub precision: PrecisionReport,
    pub sweeps: Vec<SweepReport>,
    pub quantization: QuantizationReport,
    pub alignment_probe: String,
    pub alignment: AlignmentOutcome,
    pub verdict: Verdict,
}

/// Result of a full harness run. Both sessions stay loaded so callers can
/// persist their graphs or keep probing them.
pub struct ConversionOutcome {
    pub f32_session: GraphSession,
    pub int8_session: GraphSession,
    pub report: HarnessReport,
}

/// Export, quantize and verify one reference model.
pub struct ConversionHarness {
    reference: OutputNormalizer,
    model_config: CtcModelConfig,
    exporter: GraphExporter,
    axes: AxisDeclaration,
    expectations: SessionExpectations,
    quantizer: Quantizer,
    validator: ParityValidator,
    analyzer: AlignmentPathAnalyzer,
    device: Device,
}

pub(crate) struct ConversionHarnessParts {
    pub reference: OutputNormalizer,
    pub model_config: CtcModelConfig,
    pub exporter: GraphExporter,
    pub quantizer: Quantizer,
    pub validator: ParityValidator,
    pub analyzer: AlignmentPathAnalyzer,
    pub device: Device,
}

impl ConversionHarness {
    pub(crate) fn from_parts(parts: ConversionHarnessParts) -> Self {
        let options = parts.exporter.options();
        Self {
            axes: AxisDeclaration::ctc_default(options),
            expectations: SessionExpectations::ctc(options),
            reference: parts.reference,
            model_config: parts.model_config,
            exporter: parts.exporter,
            quantizer: parts.quantizer,
            validator: parts.validator,
            analyzer: parts.analyzer,
            device: parts.device,
        }
    }

    pub fn reference(&self) -> &OutputNormalizer {
        &self.reference
    }

    pub fn model_config(&self) -> &CtcModelConfig {
        &self.model_config
    }

    pub fn validator(&self) -> &ParityValidator {
        &self.validator
    }

    pub fn analyzer(&self) -> &AlignmentPathAnalyzer {
        &self.analyzer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn battery(&self) -> Battery {
        Battery::reference(self.validator.config())
    }

    /// Example input for tracing: the first noise duration of the battery.
    pub fn representative_input(&self) -> Result<Tensor> {
        let config = self.validator.config();
        let duration = config.noise_durations_sec.first().copied().unwrap_or(1.0);
        TestCase::noise(duration, config.sample_rate_hz, config.noise_amplitude, config.seed)
            .audio(&self.device)
    }

    pub fn export(&self) -> Result<ExportedGraph> {
        self.exporter
            .export(&self.reference, &self.representative_input()?, &self.axes)
    }

    pub fn quantize(&self, graph: &ExportedGraph) -> Result<(ExportedGraph, QuantizationReport)> {
        self.quantizer.quantize(graph)
    }

    pub fn load_session(&self, graph: ExportedGraph) -> Result<GraphSession> {
        GraphSession::load(graph, &self.expectations, &self.device)
    }

    pub fn run(&self, probe: &AlignmentProbe) -> Result<ConversionOutcome> {
        self.run_observed(probe, &|_| {})
    }

    /// Full conversion flow; `observer` sees each cross-precision battery case.
    ///
    /// Only export, quantization and session loading abort the run. Failures
    /// on individual battery cases, sweep durations or the alignment probe are
    /// recorded in the report and force its verdict.
    pub fn run_observed(
        &self,
        probe: &AlignmentProbe,
        observer: CaseObserver<'_>,
    ) -> Result<ConversionOutcome> {
        let expected_rate = self.validator.config().sample_rate_hz;
        if probe.sample_rate_hz != expected_rate {
            tracing::warn!(
                expected_rate_hz = expected_rate,
                actual_rate_hz = probe.sample_rate_hz,
                "alignment probe sample rate differs from the model's; boundaries may degrade"
            );
        }

        let f32_graph = self.export()?;
        let (int8_graph, quantization) = self.quantize(&f32_graph)?;
        let f32_session = self.load_session(f32_graph)?;
        let int8_session = self.load_session(int8_graph)?;

        let battery = self.battery();
        let representation =
            self.validator
                .cross_representation_battery(&self.reference, &f32_session, &battery);

        let precision =
            self.validator
                .cross_precision_observed(&f32_session, &int8_session, &battery, observer);

        let sweeps = vec![
            self.validator
                .frame_count_sweep(&f32_session, &self.model_config),
            self.validator
                .frame_count_sweep(&int8_session, &self.model_config),
        ];

        let alignment = self.compare_alignment(&f32_session, &int8_session, probe);

        let verdict = overall_verdict(&representation, &precision, &sweeps, &alignment);
        tracing::info!(
            verdict = verdict.as_str(),
            compression_ratio = quantization.compression_ratio,
            mean_agreement_rate = precision.summary.mean_agreement_rate,
            "conversion harness finished"
        );

        let report = HarnessReport {
            frame_stride_ms: self.analyzer.stride_ms(),
            vocab_size: self.analyzer.vocabulary().len(),
            f32_graph: GraphSummary::of(f32_session.graph())?,
            int8_graph: GraphSummary::of(int8_session.graph())?,
            representation,
            precision,
            sweeps,
            quantization,
            alignment_probe: probe.name.clone(),
            alignment,
            verdict,
        };
        Ok(ConversionOutcome {
            f32_session,
            int8_session,
            report,
        })
    }

    fn compare_alignment(
        &self,
        left: &dyn InferenceSession,
        right: &dyn InferenceSession,
        probe: &AlignmentProbe,
    ) -> AlignmentOutcome {
        let compared = probe.audio(&self.device).and_then(|audio| {
            let left = left.emissions(&audio)?;
            let right = right.emissions(&audio)?;
            self.analyzer
                .compare_emissions(&left, &right, &probe.transcript)
        });
        match compared {
            Ok(comparison) => AlignmentOutcome::Compared(comparison),
            Err(err) => {
                tracing::warn!(probe = %probe.name, error = %err, "alignment comparison failed");
                AlignmentOutcome::Failed {
                    error_kind: err.kind().to_string(),
                    message: err.to_string(),
                }
            }
        }
    }
}

/// Starts from the cross-precision verdict. Any failed case, reference
/// mismatch or sweep deviation fails the run; an unusable alignment
/// comparison lowers a passing run to Warn.
fn overall_verdict(
    representation: &[RepresentationCase],
    precision: &PrecisionReport,
    sweeps: &[SweepReport],
    alignment: &AlignmentOutcome,
) -> Verdict {
    let mut verdict = precision.summary.verdict;
    let hard_failure = precision.summary.cases_failed > 0
        || !representation.iter().all(RepresentationCase::passed)
        || !sweeps.iter().all(|s| s.all_match);
    if hard_failure {
        verdict = Verdict::Fail;
    }
    let alignment_ok = matches!(
        alignment,
        AlignmentOutcome::Compared(c) if !c.boundaries.is_structural_mismatch()
    );
    if !alignment_ok {
        verdict = verdict.max(Verdict::Warn);
    }
    verdict
}

/// Zero mean, unit variance. The std floor keeps silence finite.
pub fn normalize_audio(samples: &[f32]) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let n = samples.len() as f64;
    let mean = samples.iter().map(|&x| x as f64).sum::<f64>() / n;
    let var = samples
        .iter()
        .map(|&x| {
            let d = x as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let std = var.sqrt().max(1e-7);
    samples
        .iter()
        .map(|&x| ((x as f64 - mean) / std) as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::alignment::analyzer::PathAnalysis;
    use crate::alignment::vocabulary::LabelVocabulary;
    use crate::export::normalizer::ModelOutput;
    use crate::export::tracer::{TracedValue, Tracer};
    use crate::model::ctc_model::CtcAcousticModel;
    use crate::model::synthetic::{synthetic_model, tiny_config};
    use crate::parity::metrics::ElementwiseDiff;
    use crate::parity::report::{CaseOutcome, CaseReport, RepresentationOutcome, RepresentationReport};
    use crate::pipeline::builder::HarnessBuilder;
    use crate::pipeline::traits::TraceableModel;
    use crate::types::{BoundaryComparison, BoundarySet, DecisionPath};

    fn small_parity() -> ParityConfig {
        ParityConfig {
            noise_durations_sec: vec![0.1, 0.2],
            silence_durations_sec: vec![0.1],
            sweep_durations_sec: vec![0.05, 0.1, 0.25],
            ..ParityConfig::default()
        }
    }

    /// Synthetic model whose eager pass rejects inputs above `max_samples`.
    /// Tracing is unaffected, so export and the sessions still work.
    struct ShortInputsOnly {
        inner: CtcAcousticModel,
        max_samples: usize,
    }

    impl TraceableModel for ShortInputsOnly {
        fn forward_eager(&self, input: &Tensor) -> Result<ModelOutput<Tensor>> {
            if input.dims().last().is_some_and(|&n| n > self.max_samples) {
                return Err(ConversionError::inference(
                    "reference forward",
                    "runtime failure on long input",
                ));
            }
            self.inner.forward_eager(input)
        }

        fn forward_traced(
            &self,
            tracer: &mut Tracer,
            input: &TracedValue,
        ) -> Result<ModelOutput<TracedValue>> {
            self.inner.forward_traced(tracer, input)
        }
    }

    fn harness() -> ConversionHarness {
        let cfg = tiny_config();
        let model = synthetic_model(&cfg, 3, &Device::Cpu).unwrap();
        harness_with(Arc::new(model), cfg)
    }

    fn harness_with(model: Arc<dyn TraceableModel>, cfg: CtcModelConfig) -> ConversionHarness {
        HarnessBuilder::default()
            .with_model(model, cfg)
            .with_vocabulary(LabelVocabulary::from_symbols(["-", "a", "b", "c", "d", "|"]).unwrap())
            .with_parity_config(small_parity())
            .with_session_device(Device::Cpu)
            .build()
            .unwrap()
    }

    #[test]
    fn run_covers_every_stage() {
        let h = harness();
        let probe = AlignmentProbe::noise(0.2, h.validator().config(), "ab ba");
        let outcome = h.run(&probe).unwrap();
        let report = &outcome.report;

        assert_eq!(report.representation.len(), 3);
        assert!(report.representation.iter().all(RepresentationCase::passed));
        assert_eq!(report.precision.cases.len(), 3);
        assert_eq!(report.precision.cases[0].agreement_rate(), Some(1.0));
        assert!(report.sweeps.iter().all(|s| s.all_match));
        assert!(report.quantization.quantized_nodes > 0);
        assert_eq!(report.f32_graph.precision, Precision::F32);
        assert_eq!(report.int8_graph.precision, Precision::Int8Dynamic);
        assert!(report.int8_graph.size_bytes < report.f32_graph.size_bytes);
        match &report.alignment {
            AlignmentOutcome::Compared(c) => assert_eq!(c.left.frames(), c.right.frames()),
            AlignmentOutcome::Failed { message, .. } => panic!("alignment failed: {message}"),
        }
        assert_eq!(outcome.int8_session.precision(), Precision::Int8Dynamic);
    }

    #[test]
    fn infeasible_transcript_is_recorded_not_fatal() {
        let h = harness();
        // 0.05 s yields too few frames for this many targets
        let transcript = "abcd abcd abcd abcd abcd abcd abcd abcd abcd abcd";
        let probe = AlignmentProbe::noise(0.05, h.validator().config(), transcript);
        let outcome = h.run(&probe).unwrap();
        assert!(matches!(outcome.report.alignment, AlignmentOutcome::Failed { .. }));
        assert_ne!(outcome.report.verdict, Verdict::Pass);
    }

    #[test]
    fn failing_reference_case_is_recorded_not_fatal() {
        let cfg = tiny_config();
        let inner = synthetic_model(&cfg, 3, &Device::Cpu).unwrap();
        // battery is 0.1 s silence, 0.1 s and 0.2 s noise; only the last exceeds 2000 samples
        let model = ShortInputsOnly {
            inner,
            max_samples: 2000,
        };
        let h = harness_with(Arc::new(model), cfg);
        let probe = AlignmentProbe::noise(0.1, h.validator().config(), "ab");
        let outcome = h.run(&probe).expect("a failing battery case must not abort the run");
        let report = &outcome.report;

        assert_eq!(report.representation.len(), 3);
        assert!(report.representation[0].passed());
        assert!(report.representation[1].passed());
        match &report.representation[2].outcome {
            RepresentationOutcome::Failed { error_kind, message } => {
                assert_eq!(error_kind, "inference_run_error");
                assert!(message.contains("long input"));
            }
            other => panic!("expected a failed case, got {other:?}"),
        }
        assert_eq!(report.precision.summary.cases_total, 3);
        assert_eq!(report.precision.summary.cases_failed, 0);
        assert!(report.sweeps.iter().all(|s| s.all_match));
        assert_eq!(report.verdict, Verdict::Fail);
        assert!(serde_json::to_string(report).unwrap().contains("\"status\":\"failed\""));
    }

    fn passing_precision() -> PrecisionReport {
        let cases = vec![CaseReport {
            case: TestCase::silence(0.1, 16_000),
            outcome: CaseOutcome::Completed {
                frames: 4,
                max_abs_diff: 0.0,
                mean_abs_diff: 0.0,
                agreement_rate: 1.0,
                verdict: Verdict::Pass,
            },
        }];
        let summary = ParityValidator::new(ParityConfig::default(), Device::Cpu).summarize(&cases);
        PrecisionReport {
            left: Precision::F32,
            right: Precision::Int8Dynamic,
            cases,
            summary,
        }
    }

    fn representation(passed: bool) -> RepresentationCase {
        RepresentationCase {
            case: TestCase::silence(0.1, 16_000),
            outcome: RepresentationOutcome::Compared(RepresentationReport {
                input_shape: vec![1, 1600],
                reference_frames: 4,
                session_frames: 4,
                diff: ElementwiseDiff {
                    max_abs_diff: if passed { 0.0 } else { 0.5 },
                    mean_abs_diff: 0.0,
                },
                tolerance: 1e-4,
                passed,
            }),
        }
    }

    fn sweep(all_match: bool) -> SweepReport {
        SweepReport {
            precision: Precision::Int8Dynamic,
            points: Vec::new(),
            points_failed: 0,
            all_match,
        }
    }

    fn aligned() -> AlignmentOutcome {
        let analysis = PathAnalysis {
            path: DecisionPath {
                labels: vec![0, 1, 0],
                score: 0.0,
            },
            boundaries: BoundarySet { frames: Vec::new() },
            transcript: "a".to_string(),
        };
        AlignmentOutcome::Compared(AlignmentComparison {
            left: analysis.clone(),
            right: analysis,
            boundaries: BoundaryComparison::Aligned {
                deltas: Vec::new(),
                max_time_diff_ms: 0.0,
            },
            path_agreement: 1.0,
        })
    }

    #[test]
    fn clean_run_passes() {
        let verdict = overall_verdict(&[representation(true)], &passing_precision(), &[sweep(true)], &aligned());
        assert_eq!(verdict, Verdict::Pass);
    }

    #[test]
    fn reference_mismatch_forces_fail() {
        let verdict = overall_verdict(&[representation(false)], &passing_precision(), &[sweep(true)], &aligned());
        assert_eq!(verdict, Verdict::Fail);
    }

    #[test]
    fn sweep_mismatch_forces_fail() {
        let verdict = overall_verdict(&[representation(true)], &passing_precision(), &[sweep(false)], &aligned());
        assert_eq!(verdict, Verdict::Fail);
    }

    #[test]
    fn failed_precision_case_forces_fail() {
        let mut precision = passing_precision();
        precision.cases.push(CaseReport {
            case: TestCase::silence(0.2, 16_000),
            outcome: CaseOutcome::Failed {
                error_kind: "inference_run_error".to_string(),
                message: "boom".to_string(),
            },
        });
        precision.summary = ParityValidator::new(ParityConfig::default(), Device::Cpu).summarize(&precision.cases);
        assert_eq!(precision.summary.verdict, Verdict::Pass);
        let verdict = overall_verdict(&[representation(true)], &precision, &[sweep(true)], &aligned());
        assert_eq!(verdict, Verdict::Fail);
    }

    #[test]
    fn failed_alignment_lowers_pass_to_warn() {
        let failed = AlignmentOutcome::Failed {
            error_kind: "invalid_input".to_string(),
            message: "too few frames".to_string(),
        };
        let verdict = overall_verdict(&[representation(true)], &passing_precision(), &[sweep(true)], &failed);
        assert_eq!(verdict, Verdict::Warn);
    }

    #[test]
    fn recording_probe_is_normalized() {
        let probe = AlignmentProbe::recording("clip", &[1.0, 2.0, 3.0, 4.0], 16_000, "a");
        let mean: f32 = probe.samples.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
    }

    #[test]
    fn normalize_audio_handles_silence_and_empty() {
        assert!(normalize_audio(&[]).is_empty());
        assert_eq!(normalize_audio(&[0.0; 8]), vec![0.0; 8]);
    }
}
