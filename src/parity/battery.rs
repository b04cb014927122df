use std::f32::consts::PI;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::ParityConfig;
use crate::error::{ConversionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputKind {
    Silence,
    GaussianNoise { amplitude: f32 },
}

/// One synthetic input of the parity battery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestCase {
    pub name: String,
    pub input: InputKind,
    pub duration_sec: f64,
    pub num_samples: usize,
    pub seed: u64,
}

impl TestCase {
    pub fn silence(duration_sec: f64, sample_rate_hz: u32) -> Self {
        Self {
            name: format!("silence_{}", duration_label(duration_sec)),
            input: InputKind::Silence,
            duration_sec,
            num_samples: samples_for(duration_sec, sample_rate_hz),
            seed: 0,
        }
    }

    pub fn noise(duration_sec: f64, sample_rate_hz: u32, amplitude: f32, seed: u64) -> Self {
        Self {
            name: format!("noise_{}", duration_label(duration_sec)),
            input: InputKind::GaussianNoise { amplitude },
            duration_sec,
            num_samples: samples_for(duration_sec, sample_rate_hz),
            seed,
        }
    }

    /// Deterministic samples for this case.
    pub fn samples(&self) -> Vec<f32> {
        match self.input {
            InputKind::Silence => vec![0.0; self.num_samples],
            InputKind::GaussianNoise { amplitude } => {
                gaussian_noise(self.num_samples, amplitude, self.seed)
            }
        }
    }

    /// `[1, num_samples]` audio tensor.
    pub fn audio(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_vec(self.samples(), (1, self.num_samples), device)
            .map_err(|e| ConversionError::invalid_input(format!("battery input {}: {e}", self.name)))
    }
}

fn samples_for(duration_sec: f64, sample_rate_hz: u32) -> usize {
    (duration_sec * f64::from(sample_rate_hz)).round() as usize
}

fn duration_label(duration_sec: f64) -> String {
    let ms = (duration_sec * 1000.0).round() as u64;
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

/// Zero-mean Gaussian samples with standard deviation `amplitude`.
pub fn gaussian_noise(len: usize, amplitude: f32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(len + 1);
    while out.len() < len {
        // (0, 1] keeps ln() finite.
        let u1: f32 = 1.0 - rng.gen::<f32>();
        let u2: f32 = rng.gen::<f32>();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * PI * u2;
        out.push(amplitude * r * theta.cos());
        out.push(amplitude * r * theta.sin());
    }
    out.truncate(len);
    out
}

/// Ordered set of parity inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Battery {
    pub cases: Vec<TestCase>,
}

impl Battery {
    /// Silence cases followed by seeded noise cases, per `config`.
    pub fn reference(config: &ParityConfig) -> Self {
        let silence = config
            .silence_durations_sec
            .iter()
            .map(|&d| TestCase::silence(d, config.sample_rate_hz));
        let noise = config
            .noise_durations_sec
            .iter()
            .enumerate()
            .map(|(i, &d)| {
                TestCase::noise(
                    d,
                    config.sample_rate_hz,
                    config.noise_amplitude,
                    config.seed.wrapping_add(i as u64),
                )
            });
        Self {
            cases: silence.chain(noise).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}
