//! scan_video - offline person detection over a local video file
//!
//! Prints the video summary as JSON on stdout. Progress goes to stderr.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use person_sentry::{
    detect::load_configured, ui, DetectorHandle, FramePipeline, PipelineError, SentryConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "scan_video",
    about = "Detect persons in a video file and optionally write an annotated copy"
)]
struct Args {
    /// Input video path (or stub://name?frames=N for a synthetic clip)
    #[arg(value_name = "INPUT")]
    input: String,

    /// Write the annotated video here
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Detector backend (tract|null)
    #[arg(long, env = "SENTRY_BACKEND")]
    backend: Option<String>,

    /// ONNX model path
    #[arg(long, value_name = "PATH")]
    model: Option<PathBuf>,

    /// Output video codec
    #[arg(long)]
    codec: Option<String>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let ui = ui::Ui::from_flag(Some(&args.ui), is_tty);

    let mut config = SentryConfig::load()?;
    if let Some(backend) = args.backend {
        config.model.backend = backend;
    }
    if let Some(model) = args.model {
        config.model.path = model;
    }
    if let Some(codec) = args.codec {
        config.video.codec = codec;
    }

    let backend = load_configured(&config.model).with_context(|| {
        format!(
            "load '{}' detector from {}",
            config.model.backend,
            config.model.path.display()
        )
    })?;
    let pipeline = FramePipeline::new(DetectorHandle::with_shared(backend), config.video.clone());

    let summary = {
        // Sized from the container's frame count on the first update.
        let mut progress = ui.frames(&format!("Scan {}", args.input), 0);
        pipeline.process_with_progress(&args.input, args.output.as_deref(), |done, hint| {
            progress.update(done, hint)
        })?
    };

    if let Some(output) = &args.output {
        match summary.require_output() {
            Ok(path) => log::info!("annotated video written to {}", path.display()),
            Err(err @ PipelineError::OutputTooSmall { .. }) => {
                return Err(anyhow!("{err}; the encoder ({}) likely failed", config.video.codec))
            }
            Err(err) => return Err(anyhow!("{}: {err}", output.display())),
        }
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
