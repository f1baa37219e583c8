mod ai;
mod capture;
mod credentials;
mod error;
mod ocr;
mod pipeline;
mod ratelimit;
mod rename;
mod retry;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::ai::OpenAiSynthesizer;
use crate::capture::VideoSampler;
use crate::ocr::VisionOcr;
use crate::pipeline::{CancelFlag, Pipeline, VideoTask};
use crate::ratelimit::RateGate;
use crate::retry::RetryPolicy;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mkv", "mov", "wmv", "flv"];

#[derive(Parser)]
#[command(name = "renamai")]
#[command(about = "Rename inspection videos from their on-screen text using OCR and GPT-4o", long_about = None)]
struct Cli {
    /// Directory holding the videos to rename (non-recursive)
    video_dir: PathBuf,
    /// Google Vision service-account key file
    #[arg(long, default_value = "vision-api-key/service-account.json")]
    vision_key: PathBuf,
    /// OpenAI API key file
    #[arg(long, default_value = "chatgpt-api-key/api_key.txt")]
    openai_key: PathBuf,
    /// Instruction template sent with every synthesis request
    #[arg(long, default_value = "prompt.txt")]
    prompt: PathBuf,
    /// Frames sampled per video, evenly spaced across the duration
    #[arg(long, default_value_t = 5)]
    max_frames: usize,
    /// Videos processed in parallel; outbound calls stay paced regardless
    #[arg(long, default_value_t = 2)]
    concurrency: usize,
    /// Minimum spacing between any two outbound service calls
    #[arg(long, default_value_t = 1000)]
    min_call_interval_ms: u64,
    /// Attempts per service call before the video is marked failed
    #[arg(long, default_value_t = 3)]
    retries: u32,
    /// Delay before the first retry; doubles on each further retry
    #[arg(long, default_value_t = 1000)]
    retry_backoff_ms: u64,
    /// Per-request timeout for both services
    #[arg(long, default_value_t = 60)]
    request_timeout_secs: u64,
}

fn collect_tasks(dir: &Path) -> anyhow::Result<Vec<VideoTask>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("cannot read video directory {}", dir.display()))?;

    let mut tasks = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            continue;
        };
        if !VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            continue;
        }
        let size = entry.metadata()?.len();
        tasks.push(VideoTask { path, size });
    }
    tasks.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(tasks)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Both credentials and the template are required up front; the batch
    // never starts without them.
    let creds = credentials::load(&cli.vision_key, &cli.openai_key)?;
    let template = credentials::load_instruction_template(&cli.prompt)?;

    let tasks = collect_tasks(&cli.video_dir)?;
    if tasks.is_empty() {
        warn!("no video files found in {}", cli.video_dir.display());
        return Ok(());
    }
    let total_bytes: u64 = tasks.iter().map(|task| task.size).sum();
    info!(
        "{} video(s) queued from {} ({total_bytes} bytes)",
        tasks.len(),
        cli.video_dir.display()
    );

    let gate = Arc::new(RateGate::new(Duration::from_millis(cli.min_call_interval_ms)));
    let retry = RetryPolicy::new(cli.retries, Duration::from_millis(cli.retry_backoff_ms));
    let request_timeout = Duration::from_secs(cli.request_timeout_secs);

    let ocr = Arc::new(VisionOcr::new(
        creds.vision,
        gate.clone(),
        retry,
        request_timeout,
    ));
    let synthesizer = Arc::new(OpenAiSynthesizer::new(
        &creds.openai_api_key,
        template,
        gate,
        retry,
        request_timeout,
    ));

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    let pipeline = Pipeline::new(
        Arc::new(VideoSampler),
        ocr,
        synthesizer,
        cli.max_frames,
        cli.concurrency,
        cancel,
    );
    let reports = pipeline.run_batch(tasks).await;

    println!("\nBatch report");
    for (index, report) in reports.iter().enumerate() {
        let name = report
            .task
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| report.task.path.display().to_string());
        println!("{:>3}. {name}: {}", index + 1, report.outcome);
    }
    let failures = reports
        .iter()
        .filter(|report| report.outcome.is_failure())
        .count();
    println!("{} processed, {failures} failed", reports.len());

    Ok(())
}
