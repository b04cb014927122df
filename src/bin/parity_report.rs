use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use claxon::FlacReader;
use ctc_export::model::synthetic_model;
use ctc_export::parity::report::CaseReport;
use ctc_export::pipeline::model_runtime::parse_device;
use ctc_export::{
    AlignmentProbe, CtcModelConfig, HarnessBuilder, HarnessConfig, HarnessReport, ParityConfig,
    Verdict,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "parity_report")]
#[command(about = "Export a CTC model, quantize it, and report f32/int8 parity")]
struct Args {
    /// Directory holding config.json, model.safetensors and labels.txt.
    #[arg(long, env = "CTC_EXPORT_MODEL_DIR", default_value = "models/ctc")]
    model_dir: PathBuf,
    /// Where the f32 and int8 graphs are written.
    #[arg(long, env = "CTC_EXPORT_ARTIFACT_DIR", default_value = "export")]
    artifact_dir: PathBuf,
    /// Report path; stdout when absent.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value = "cpu")]
    device: String,
    /// FLAC recording used for the word-boundary comparison.
    #[arg(long, requires = "transcript")]
    flac: Option<PathBuf>,
    #[arg(long)]
    transcript: Option<String>,
    /// Build the model from seeded weights instead of model.safetensors.
    #[arg(long)]
    synthetic_seed: Option<u64>,
    #[arg(long, default_value_t = ParityConfig::DEFAULT_SEED)]
    seed: u64,
    #[arg(long, default_value_t = ParityConfig::DEFAULT_TOLERANCE)]
    tolerance: f32,
    #[arg(long, default_value_t = ParityConfig::DEFAULT_PASS_RATE)]
    pass_rate: f64,
    #[arg(long, default_value_t = ParityConfig::DEFAULT_WARN_RATE)]
    warn_rate: f64,
    /// Run battery cases one at a time.
    #[arg(long)]
    sequential: bool,
}

#[derive(Serialize)]
struct ReportFile<'a> {
    generated_at: String,
    model_dir: String,
    f32_graph_path: String,
    int8_graph_path: String,
    #[serde(flatten)]
    report: &'a HarnessReport,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(Verdict::Fail) => std::process::exit(2),
        Ok(_) => {}
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<Verdict, String> {
    let args = Args::parse();
    let model_dir = &args.model_dir;
    let config = HarnessConfig {
        model_path: path_string(&model_dir.join("model.safetensors")),
        config_path: path_string(&model_dir.join("config.json")),
        labels_path: path_string(&model_dir.join("labels.txt")),
        device: args.device.clone(),
        ..HarnessConfig::default()
    };
    let parity = ParityConfig {
        tolerance: args.tolerance,
        pass_rate: args.pass_rate,
        warn_rate: args.warn_rate,
        seed: args.seed,
        parallel: !args.sequential,
        ..ParityConfig::default()
    };
    parity.validate().map_err(|e| e.to_string())?;

    let mut builder = HarnessBuilder::new(config.clone()).with_parity_config(parity);
    if let Some(seed) = args.synthetic_seed {
        let device = parse_device(&config.device).map_err(|e| e.to_string())?;
        let model_cfg =
            CtcModelConfig::load(Path::new(&config.config_path)).map_err(|e| e.to_string())?;
        let model = synthetic_model(&model_cfg, seed, &device).map_err(|e| e.to_string())?;
        builder = builder.with_model(Arc::new(model), model_cfg);
    }
    let harness = builder.build().map_err(|e| e.to_string())?;

    let probe = match (&args.flac, &args.transcript) {
        (Some(path), Some(transcript)) => {
            let (sample_rate_hz, samples) = read_flac_mono(path)?;
            AlignmentProbe::recording(&path_string(path), &samples, sample_rate_hz, transcript)
        }
        _ => AlignmentProbe::synthetic(harness.validator().config()),
    };

    let progress = ProgressBar::new(harness.battery().len() as u64);
    progress.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    progress.set_message("exporting...");
    let observer = |case: &CaseReport| {
        progress.set_message(case.case.name.clone());
        progress.inc(1);
    };
    let outcome = harness
        .run_observed(&probe, &observer)
        .map_err(|e| e.to_string())?;
    progress.finish_with_message("done");

    fs::create_dir_all(&args.artifact_dir).map_err(|err| {
        format!(
            "Failed to create artifact dir '{}': {err}",
            args.artifact_dir.display()
        )
    })?;
    let f32_path = args.artifact_dir.join("model.f32.json");
    let int8_path = args.artifact_dir.join("model.int8.json");
    outcome
        .f32_session
        .graph()
        .save(&f32_path)
        .map_err(|e| e.to_string())?;
    outcome
        .int8_session
        .graph()
        .save(&int8_path)
        .map_err(|e| e.to_string())?;
    harness
        .analyzer()
        .vocabulary()
        .save(&args.artifact_dir.join("labels.txt"))
        .map_err(|e| e.to_string())?;

    let file = ReportFile {
        generated_at: Utc::now().to_rfc3339(),
        model_dir: path_string(model_dir),
        f32_graph_path: path_string(&f32_path),
        int8_graph_path: path_string(&int8_path),
        report: &outcome.report,
    };
    let json = serde_json::to_string_pretty(&file)
        .map_err(|err| format!("Failed to serialize report: {err}"))?;
    match &args.out {
        Some(path) => {
            fs::write(path, json)
                .map_err(|err| format!("Failed to write report '{}': {err}", path.display()))?;
            eprintln!("Wrote report to {}", path.display());
        }
        None => println!("{json}"),
    }

    Ok(outcome.report.verdict)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn read_flac_mono(path: &Path) -> Result<(u32, Vec<f32>), String> {
    let mut reader = FlacReader::open(path)
        .map_err(|err| format!("Failed to decode FLAC '{}': {err}", path.display()))?;
    let streaminfo = reader.streaminfo();
    let channels = streaminfo.channels as usize;
    let bits_per_sample = streaminfo.bits_per_sample as i32;
    let scale = if bits_per_sample > 1 {
        ((1_i64 << (bits_per_sample - 1)) - 1) as f32
    } else {
        1.0
    };
    if channels == 0 {
        return Err(format!("FLAC has zero channels: {}", path.display()));
    }

    let mut mono = Vec::new();
    let mut frame = Vec::with_capacity(channels);
    for sample in reader.samples() {
        let sample = sample
            .map_err(|err| format!("Failed reading sample from '{}': {err}", path.display()))?;
        frame.push(sample as f32 / scale);
        if frame.len() == channels {
            mono.push(frame.iter().sum::<f32>() / channels as f32);
            frame.clear();
        }
    }
    Ok((streaminfo.sample_rate, mono))
}
