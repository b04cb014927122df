use candle_core::{Device, Tensor};
use rayon::prelude::*;

use crate::config::{CtcModelConfig, ParityConfig};
use crate::error::{ConversionError, Result};
use crate::export::normalizer::OutputNormalizer;
use crate::parity::battery::{Battery, TestCase};
use crate::parity::metrics::{argmax_agreement, classify, elementwise_diff};
use crate::parity::report::{
    BatterySummary, CaseOutcome, CaseReport, PrecisionReport, RepresentationCase,
    RepresentationOutcome, RepresentationReport, SweepOutcome, SweepPoint, SweepReport,
};
use crate::pipeline::traits::InferenceSession;
use crate::types::Verdict;

/// Callback fired after each battery case; must tolerate calls from worker threads.
pub type CaseObserver<'a> = &'a (dyn Fn(&CaseReport) + Sync);

pub struct ParityValidator {
    config: ParityConfig,
    device: Device,
}

impl ParityValidator {
    pub fn new(config: ParityConfig, device: Device) -> Self {
        Self { config, device }
    }

    pub fn config(&self) -> &ParityConfig {
        &self.config
    }

    /// Reference model against a session on the same input.
    pub fn cross_representation(
        &self,
        reference: &OutputNormalizer,
        session: &dyn InferenceSession,
        input: &Tensor,
    ) -> Result<RepresentationReport> {
        let expected = reference.emissions(input)?;
        let actual = session.emissions(input)?;
        let reference_frames = expected
            .dim(1)
            .map_err(|e| ConversionError::shape_contract("reference frames", e))?;
        let session_frames = actual
            .dim(1)
            .map_err(|e| ConversionError::shape_contract("session frames", e))?;
        if reference_frames != session_frames {
            return Err(ConversionError::shape_contract(
                "cross-representation parity",
                format!("reference produced {reference_frames} frames, session {session_frames}"),
            ));
        }
        let diff = elementwise_diff(&expected, &actual)?;
        let passed = diff.max_abs_diff < self.config.tolerance;
        if passed {
            tracing::info!(
                max_abs_diff = diff.max_abs_diff,
                mean_abs_diff = diff.mean_abs_diff,
                frames = session_frames,
                "reference parity within tolerance"
            );
        } else {
            tracing::warn!(
                max_abs_diff = diff.max_abs_diff,
                tolerance = self.config.tolerance,
                "reference parity exceeds tolerance"
            );
        }
        Ok(RepresentationReport {
            input_shape: input.dims().to_vec(),
            reference_frames,
            session_frames,
            diff,
            tolerance: self.config.tolerance,
            passed,
        })
    }

    /// [`Self::cross_representation`] over every battery case. A case that
    /// errors is recorded as failed and the rest still run.
    pub fn cross_representation_battery(
        &self,
        reference: &OutputNormalizer,
        session: &dyn InferenceSession,
        battery: &Battery,
    ) -> Vec<RepresentationCase> {
        let run = |case: &TestCase| {
            let outcome = match case
                .audio(&self.device)
                .and_then(|audio| self.cross_representation(reference, session, &audio))
            {
                Ok(report) => RepresentationOutcome::Compared(report),
                Err(err) => {
                    tracing::warn!(case = %case.name, error = %err, "reference parity case failed");
                    RepresentationOutcome::Failed {
                        error_kind: err.kind().to_string(),
                        message: err.to_string(),
                    }
                }
            };
            RepresentationCase {
                case: case.clone(),
                outcome,
            }
        };
        if self.config.parallel {
            battery.cases.par_iter().map(run).collect()
        } else {
            battery.cases.iter().map(run).collect()
        }
    }

    pub fn cross_precision(
        &self,
        left: &dyn InferenceSession,
        right: &dyn InferenceSession,
        battery: &Battery,
    ) -> PrecisionReport {
        self.cross_precision_observed(left, right, battery, &|_| {})
    }

    /// Runs every battery case on both sessions. Failing cases are recorded and
    /// the rest of the battery still runs.
    pub fn cross_precision_observed(
        &self,
        left: &dyn InferenceSession,
        right: &dyn InferenceSession,
        battery: &Battery,
        observer: CaseObserver<'_>,
    ) -> PrecisionReport {
        let run = |case: &TestCase| {
            let report = self.run_case(left, right, case);
            observer(&report);
            report
        };
        let cases: Vec<CaseReport> = if self.config.parallel {
            battery.cases.par_iter().map(run).collect()
        } else {
            battery.cases.iter().map(run).collect()
        };
        let summary = self.summarize(&cases);

        match summary.verdict {
            Verdict::Pass => tracing::info!(
                mean_agreement_rate = summary.mean_agreement_rate,
                cases = summary.cases_total,
                "cross-precision parity passed"
            ),
            Verdict::Warn | Verdict::Fail => tracing::warn!(
                verdict = summary.verdict.as_str(),
                mean_agreement_rate = summary.mean_agreement_rate,
                failed = summary.cases_failed,
                caveat = summary.caveat.as_deref(),
                "cross-precision parity below pass rate"
            ),
        }

        PrecisionReport {
            left: left.precision(),
            right: right.precision(),
            cases,
            summary,
        }
    }

    fn run_case(&self, left: &dyn InferenceSession, right: &dyn InferenceSession, case: &TestCase) -> CaseReport {
        let outcome = match self.compare_case(left, right, case) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(case = %case.name, error = %err, "parity case failed");
                CaseOutcome::Failed {
                    error_kind: err.kind().to_string(),
                    message: err.to_string(),
                }
            }
        };
        CaseReport {
            case: case.clone(),
            outcome,
        }
    }

    fn compare_case(
        &self,
        left: &dyn InferenceSession,
        right: &dyn InferenceSession,
        case: &TestCase,
    ) -> Result<CaseOutcome> {
        let audio = case.audio(&self.device)?;
        let a = left.emissions(&audio)?;
        let b = right.emissions(&audio)?;
        let diff = elementwise_diff(&a, &b)?;
        let agreement_rate = argmax_agreement(&a, &b)?;
        let frames = a
            .dim(1)
            .map_err(|e| ConversionError::shape_contract("case frames", e))?;
        let verdict = classify(agreement_rate, &self.config);
        tracing::debug!(
            case = %case.name,
            frames,
            max_abs_diff = diff.max_abs_diff,
            agreement_rate,
            verdict = verdict.as_str(),
            "parity case done"
        );
        Ok(CaseOutcome::Completed {
            frames,
            max_abs_diff: diff.max_abs_diff,
            mean_abs_diff: diff.mean_abs_diff,
            agreement_rate,
            verdict,
        })
    }

    pub fn summarize(&self, cases: &[CaseReport]) -> BatterySummary {
        let mut pass_count = 0;
        let mut warn_count = 0;
        let mut fail_count = 0;
        for case in cases {
            match case.verdict() {
                Verdict::Pass => pass_count += 1,
                Verdict::Warn => warn_count += 1,
                Verdict::Fail => fail_count += 1,
            }
        }

        let rates: Vec<f64> = cases.iter().filter_map(CaseReport::agreement_rate).collect();
        let completed: Vec<(f32, f32)> = cases
            .iter()
            .filter_map(|c| match c.outcome {
                CaseOutcome::Completed {
                    max_abs_diff,
                    mean_abs_diff,
                    ..
                } => Some((max_abs_diff, mean_abs_diff)),
                CaseOutcome::Failed { .. } => None,
            })
            .collect();
        let cases_failed = cases.iter().filter(|c| c.is_failed()).count();

        let mean_agreement_rate =
            (!rates.is_empty()).then(|| rates.iter().sum::<f64>() / rates.len() as f64);
        let worst_agreement_rate = rates.iter().copied().reduce(f64::min);
        let worst_max_abs_diff = completed.iter().map(|c| c.0).reduce(f32::max);
        let worst_mean_abs_diff = completed.iter().map(|c| c.1).reduce(f32::max);

        let (verdict, caveat) = match mean_agreement_rate {
            None => (
                Verdict::Fail,
                Some(format!("no case completed ({cases_failed} failed)")),
            ),
            Some(rate) => {
                let verdict = classify(rate, &self.config);
                let caveat = match verdict {
                    Verdict::Pass => None,
                    Verdict::Warn => Some(format!(
                        "mean top-1 agreement {:.2}% is below the {:.0}% pass rate; \
                         check boundary timing before shipping",
                        rate * 100.0,
                        self.config.pass_rate * 100.0
                    )),
                    Verdict::Fail => Some(format!(
                        "mean top-1 agreement {:.2}% is below the {:.0}% warn rate",
                        rate * 100.0,
                        self.config.warn_rate * 100.0
                    )),
                };
                (verdict, caveat)
            }
        };

        BatterySummary {
            cases_total: cases.len(),
            cases_failed,
            pass_count,
            warn_count,
            fail_count,
            mean_agreement_rate,
            worst_agreement_rate,
            worst_max_abs_diff,
            worst_mean_abs_diff,
            verdict,
            caveat,
        }
    }

    /// Frame count and frame rate of `session` across the configured
    /// durations. A duration the session cannot run is recorded as a failed
    /// point.
    pub fn frame_count_sweep(
        &self,
        session: &dyn InferenceSession,
        model_config: &CtcModelConfig,
    ) -> SweepReport {
        let points: Vec<SweepPoint> = self
            .config
            .sweep_durations_sec
            .iter()
            .enumerate()
            .map(|(i, &duration_sec)| {
                let case = TestCase::noise(
                    duration_sec,
                    self.config.sample_rate_hz,
                    self.config.noise_amplitude,
                    self.config.seed.wrapping_add(1000 + i as u64),
                );
                let expected_frames = model_config.expected_frame_count(case.num_samples);
                let outcome = match self.sweep_frames(session, &case) {
                    Ok(frames) => {
                        let frames_per_second = if duration_sec > 0.0 {
                            frames as f64 / duration_sec
                        } else {
                            0.0
                        };
                        tracing::debug!(
                            duration_sec,
                            frames,
                            expected_frames,
                            fps = frames_per_second,
                            "frame count sweep point"
                        );
                        SweepOutcome::Measured {
                            frames,
                            frames_per_second,
                        }
                    }
                    Err(err) => {
                        tracing::warn!(duration_sec, error = %err, "frame count sweep point failed");
                        SweepOutcome::Failed {
                            error_kind: err.kind().to_string(),
                            message: err.to_string(),
                        }
                    }
                };
                SweepPoint {
                    duration_sec,
                    num_samples: case.num_samples,
                    expected_frames,
                    outcome,
                }
            })
            .collect();

        let points_failed = points.iter().filter(|p| p.is_failed()).count();
        let all_match = points.iter().all(SweepPoint::matches);
        if !all_match {
            tracing::warn!(
                failed = points_failed,
                "frame counts deviate from the conv stride arithmetic"
            );
        }
        SweepReport {
            precision: session.precision(),
            points,
            points_failed,
            all_match,
        }
    }

    fn sweep_frames(&self, session: &dyn InferenceSession, case: &TestCase) -> Result<usize> {
        let emissions = session.emissions(&case.audio(&self.device)?)?;
        emissions
            .dim(1)
            .map_err(|e| ConversionError::shape_contract("sweep frames", e))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::export::normalizer::ModelOutput;
    use crate::export::tracer::{TracedValue, Tracer};
    use crate::model::synthetic::tiny_config;
    use crate::parity::battery::InputKind;
    use crate::pipeline::traits::TraceableModel;
    use crate::types::{NamedTensors, Precision};

    /// `[1, samples / divisor, 3]` logits; `flip` perturbs every `flip`-th
    /// frame so its argmax changes.
    fn fake_emissions(samples: usize, divisor: usize, flip: Option<usize>) -> Tensor {
        let frames = samples / divisor;
        let mut data: Vec<f32> = Vec::with_capacity(frames * 3);
        for f in 0..frames {
            let flipped = flip.is_some_and(|n| f % n == 0);
            data.extend_from_slice(if flipped { &[0.0, 2.0, 0.0] } else { &[2.0, 0.0, 0.0] });
        }
        Tensor::from_vec(data, (1, frames, 3), &Device::Cpu).unwrap()
    }

    struct FakeSession {
        precision: Precision,
        flip: Option<usize>,
        fail_above: Option<usize>,
    }

    impl InferenceSession for FakeSession {
        fn input_names(&self) -> Vec<String> {
            vec!["audio".into()]
        }

        fn output_names(&self) -> Vec<String> {
            vec!["emissions".into()]
        }

        fn precision(&self) -> Precision {
            self.precision
        }

        fn run(&self, inputs: &NamedTensors) -> Result<NamedTensors> {
            let samples = inputs["audio"].dim(1).unwrap();
            if self.fail_above.is_some_and(|limit| samples > limit) {
                return Err(ConversionError::inference("fake run", "input too long"));
            }
            let t = fake_emissions(samples, 4, self.flip);
            Ok(NamedTensors::from([("emissions".to_string(), t)]))
        }
    }

    /// Eager-only stand-in for the reference model.
    struct FakeModel {
        divisor: usize,
        fail_above: Option<usize>,
    }

    impl TraceableModel for FakeModel {
        fn forward_eager(&self, input: &Tensor) -> Result<ModelOutput<Tensor>> {
            let samples = input.dim(1).unwrap();
            if self.fail_above.is_some_and(|limit| samples > limit) {
                return Err(ConversionError::inference("fake reference", "input too long"));
            }
            Ok(ModelOutput::Tensor(fake_emissions(samples, self.divisor, None)))
        }

        fn forward_traced(
            &self,
            _tracer: &mut Tracer,
            _input: &TracedValue,
        ) -> Result<ModelOutput<TracedValue>> {
            Err(ConversionError::export("fake trace", "not traceable"))
        }
    }

    fn reference(divisor: usize, fail_above: Option<usize>) -> OutputNormalizer {
        OutputNormalizer::new(Arc::new(FakeModel { divisor, fail_above }))
    }

    fn session(flip: Option<usize>, fail_above: Option<usize>) -> FakeSession {
        FakeSession {
            precision: Precision::Int8Dynamic,
            flip,
            fail_above,
        }
    }

    fn validator() -> ParityValidator {
        ParityValidator::new(ParityConfig::default(), Device::Cpu)
    }

    fn small_battery() -> Battery {
        Battery {
            cases: vec![
                TestCase::silence(0.01, 16_000),
                TestCase::noise(0.02, 16_000, 0.1, 1),
                TestCase::noise(0.04, 16_000, 0.1, 2),
            ],
        }
    }

    #[test]
    fn identical_sessions_pass() {
        let report = validator().cross_precision(&session(None, None), &session(None, None), &small_battery());
        assert_eq!(report.summary.verdict, Verdict::Pass);
        assert_eq!(report.summary.mean_agreement_rate, Some(1.0));
        assert_eq!(report.summary.pass_count, 3);
        assert_eq!(report.cases[0].case.input, InputKind::Silence);
    }

    #[test]
    fn agreement_between_thresholds_warns() {
        // every 12th frame differs: ~92% agreement
        let report = validator().cross_precision(&session(None, None), &session(Some(12), None), &small_battery());
        let rate = report.summary.mean_agreement_rate.unwrap();
        assert!(rate > 0.90 && rate < 0.95, "rate {rate}");
        assert_eq!(report.summary.verdict, Verdict::Warn);
        assert!(report.summary.caveat.is_some());
    }

    #[test]
    fn failed_case_is_recorded_and_excluded() {
        let report = validator().cross_precision(&session(None, None), &session(None, Some(400)), &small_battery());
        assert_eq!(report.summary.cases_failed, 1);
        assert!(report.cases[2].is_failed());
        assert_eq!(report.summary.mean_agreement_rate, Some(1.0));
        assert_eq!(report.summary.fail_count, 1);
        assert_eq!(report.summary.verdict, Verdict::Pass);
    }

    #[test]
    fn no_completed_case_fails_the_run() {
        let report = validator().cross_precision(&session(None, None), &session(None, Some(0)), &small_battery());
        assert_eq!(report.summary.verdict, Verdict::Fail);
        assert_eq!(report.summary.mean_agreement_rate, None);
        assert_eq!(report.summary.cases_total, 3);
    }

    #[test]
    fn sequential_and_parallel_runs_agree() {
        let parallel = validator().cross_precision(&session(None, None), &session(Some(5), None), &small_battery());
        let sequential = ParityValidator::new(
            ParityConfig {
                parallel: false,
                ..ParityConfig::default()
            },
            Device::Cpu,
        )
        .cross_precision(&session(None, None), &session(Some(5), None), &small_battery());
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn reference_battery_records_failures_and_continues() {
        let cases = validator().cross_representation_battery(
            &reference(4, Some(400)),
            &session(None, None),
            &small_battery(),
        );
        assert_eq!(cases.len(), 3);
        assert!(cases[0].passed());
        assert_eq!(cases[1].report().unwrap().diff.max_abs_diff, 0.0);
        assert!(cases[2].is_failed());
        match &cases[2].outcome {
            RepresentationOutcome::Failed { error_kind, .. } => {
                assert_eq!(error_kind, "inference_run_error")
            }
            other => panic!("expected a failed case, got {other:?}"),
        }
    }

    #[test]
    fn reference_frame_mismatch_is_a_failed_case() {
        let cases = validator().cross_representation_battery(
            &reference(2, None),
            &session(None, None),
            &small_battery(),
        );
        assert!(cases.iter().all(RepresentationCase::is_failed));
        match &cases[1].outcome {
            RepresentationOutcome::Failed { error_kind, message } => {
                assert_eq!(error_kind, "shape_contract_violation");
                assert!(message.contains("frames"));
            }
            other => panic!("expected a failed case, got {other:?}"),
        }
    }

    #[test]
    fn sweep_matches_when_stride_arithmetic_agrees() {
        // one conv with kernel 4, stride 4: samples / 4 frames
        let cfg = CtcModelConfig {
            conv_dim: vec![8],
            conv_kernel: vec![4],
            conv_stride: vec![4],
            ..tiny_config()
        };
        let report = validator().frame_count_sweep(&session(None, None), &cfg);
        assert!(report.all_match);
        assert_eq!(report.points.len(), 4);
        assert_eq!(report.points[0].frames(), Some(2000));
        assert_eq!(report.points_failed, 0);
    }

    #[test]
    fn sweep_flags_frame_count_mismatch() {
        let report = validator().frame_count_sweep(&session(None, None), &tiny_config());
        assert!(!report.all_match);
        assert_eq!(report.points_failed, 0);
        let first = &report.points[0];
        assert_eq!(first.frames(), Some(2000));
        assert_ne!(first.expected_frames, 2000);
        assert!(!first.matches());
    }

    #[test]
    fn sweep_records_failing_duration() {
        let cfg = CtcModelConfig {
            conv_dim: vec![8],
            conv_kernel: vec![4],
            conv_stride: vec![4],
            ..tiny_config()
        };
        // 0.5 s and 1 s run, 2 s and 5 s fail
        let report = validator().frame_count_sweep(&session(None, Some(20_000)), &cfg);
        assert_eq!(report.points.len(), 4);
        assert_eq!(report.points_failed, 2);
        assert!(report.points[1].matches());
        assert!(report.points[2].is_failed());
        assert!(!report.all_match);
    }
}
