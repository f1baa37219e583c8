//! Batch orchestration: drives each video through sampling → extraction →
//! synthesis → rename, recording one terminal outcome per input and
//! continuing past individual failures.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::capture::SampledFrame;
use crate::error::TaskError;
use crate::rename;

/// One unit of batch work: a single input video.
#[derive(Debug, Clone)]
pub struct VideoTask {
    pub path: PathBuf,
    pub size: u64,
}

/// One recognized text block and the frame offset it came from.
#[derive(Debug, Clone)]
pub struct TextFragment {
    pub timestamp_ms: i64,
    pub text: String,
}

/// Ordered OCR output for one video; fragment order follows frame order,
/// monotonic by timestamp. May be empty, which is not an error.
#[derive(Debug, Clone, Default)]
pub struct ExtractedText {
    pub fragments: Vec<TextFragment>,
}

impl ExtractedText {
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn joined(&self) -> String {
        self.fragments
            .iter()
            .map(|fragment| fragment.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// The validated filename candidate plus the raw model reply it was
/// derived from, kept for auditability.
#[derive(Debug, Clone)]
pub struct NamingResult {
    pub candidate: String,
    pub raw_response: String,
}

/// Terminal per-video result. Appended to the batch report, never mutated.
#[derive(Debug)]
pub enum PipelineOutcome {
    Renamed { original: PathBuf, renamed: PathBuf },
    SkippedNoText,
    FailedExtraction(String),
    FailedSynthesis(String),
    FailedRename(String),
}

impl PipelineOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::FailedExtraction(_) | Self::FailedSynthesis(_) | Self::FailedRename(_)
        )
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Renamed { renamed, .. } => {
                write!(f, "renamed to {}", renamed.display())
            }
            Self::SkippedNoText => write!(f, "skipped: no text in sampled frames"),
            Self::FailedExtraction(reason) => write!(f, "extraction failed: {reason}"),
            Self::FailedSynthesis(reason) => write!(f, "synthesis failed: {reason}"),
            Self::FailedRename(reason) => write!(f, "rename failed: {reason}"),
        }
    }
}

/// One line of the batch report.
#[derive(Debug)]
pub struct TaskReport {
    pub task: VideoTask,
    pub outcome: PipelineOutcome,
}

pub trait FrameSampler: Send + Sync + 'static {
    fn sample(&self, path: &Path, max_frames: usize) -> Result<Vec<SampledFrame>, TaskError>;
}

#[async_trait]
pub trait TextExtractor: Send + Sync + 'static {
    async fn extract(&self, frames: &[SampledFrame]) -> Result<ExtractedText, TaskError>;
}

#[async_trait]
pub trait NameSynthesizer: Send + Sync + 'static {
    async fn synthesize(&self, extracted: &ExtractedText) -> Result<NamingResult, TaskError>;
}

/// Cooperative batch-abort flag. Honored between pipeline stages; an
/// in-flight service call finishes or times out first.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives a batch of videos through the pipeline with a bounded worker
/// pool. All outbound calls inside the extractor and synthesizer go
/// through the one shared rate gate, so aggregate pacing is independent of
/// the pool size.
pub struct Pipeline {
    sampler: Arc<dyn FrameSampler>,
    extractor: Arc<dyn TextExtractor>,
    synthesizer: Arc<dyn NameSynthesizer>,
    max_frames: usize,
    concurrency: usize,
    cancel: CancelFlag,
}

impl Pipeline {
    pub fn new(
        sampler: Arc<dyn FrameSampler>,
        extractor: Arc<dyn TextExtractor>,
        synthesizer: Arc<dyn NameSynthesizer>,
        max_frames: usize,
        concurrency: usize,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            sampler,
            extractor,
            synthesizer,
            max_frames,
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    /// Processes every task, one outcome per started task, in input order.
    /// A single task's failure never aborts the batch; cancellation stops
    /// new work between stages and leaves finished outcomes intact.
    pub async fn run_batch(&self, tasks: Vec<VideoTask>) -> Vec<TaskReport> {
        let total = tasks.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();

        for (index, task) in tasks.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let sampler = self.sampler.clone();
            let extractor = self.extractor.clone();
            let synthesizer = self.synthesizer.clone();
            let cancel = self.cancel.clone();
            let max_frames = self.max_frames;

            workers.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                if cancel.is_cancelled() {
                    return (index, None);
                }
                info!("[{}/{}] processing {}", index + 1, total, task.path.display());
                let outcome =
                    run_task(&task, sampler, extractor, synthesizer, max_frames, &cancel).await;
                if let Some(outcome) = &outcome {
                    info!("[{}/{}] {}: {outcome}", index + 1, total, task.path.display());
                }
                (index, outcome.map(|outcome| TaskReport { task, outcome }))
            });
        }

        let mut reports: Vec<Option<TaskReport>> = (0..total).map(|_| None).collect();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, report)) => reports[index] = report,
                Err(err) => warn!("pipeline worker panicked: {err}"),
            }
        }
        reports.into_iter().flatten().collect()
    }
}

/// Pending → Sampling → Extracting → Synthesizing → Renaming → Done/Failed.
/// Returns `None` only when cancellation interrupted the task between
/// stages.
async fn run_task(
    task: &VideoTask,
    sampler: Arc<dyn FrameSampler>,
    extractor: Arc<dyn TextExtractor>,
    synthesizer: Arc<dyn NameSynthesizer>,
    max_frames: usize,
    cancel: &CancelFlag,
) -> Option<PipelineOutcome> {
    debug!(path = %task.path.display(), "sampling");
    let frames = {
        let sampler = sampler.clone();
        let path = task.path.clone();
        match tokio::task::spawn_blocking(move || sampler.sample(&path, max_frames)).await {
            Ok(Ok(frames)) => frames,
            Ok(Err(err)) => return Some(PipelineOutcome::FailedExtraction(err.to_string())),
            Err(err) => {
                return Some(PipelineOutcome::FailedExtraction(format!(
                    "frame sampling panicked: {err}"
                )))
            }
        }
    };
    if cancel.is_cancelled() {
        return None;
    }

    debug!(path = %task.path.display(), frames = frames.len(), "extracting");
    let extracted = match extractor.extract(&frames).await {
        Ok(extracted) => extracted,
        Err(err) => return Some(PipelineOutcome::FailedExtraction(err.to_string())),
    };
    drop(frames);
    debug!(
        path = %task.path.display(),
        fragments = extracted.fragments.len(),
        last_frame_ms = extracted.fragments.last().map(|f| f.timestamp_ms).unwrap_or(0),
        "extracted text"
    );
    if extracted.is_empty() {
        return Some(PipelineOutcome::SkippedNoText);
    }
    if cancel.is_cancelled() {
        return None;
    }

    debug!(path = %task.path.display(), "synthesizing");
    let naming = match synthesizer.synthesize(&extracted).await {
        Ok(naming) => naming,
        Err(err) => return Some(PipelineOutcome::FailedSynthesis(err.to_string())),
    };
    debug!(
        candidate = %naming.candidate,
        raw = %naming.raw_response,
        "synthesized candidate"
    );
    if cancel.is_cancelled() {
        return None;
    }

    debug!(path = %task.path.display(), "renaming");
    match rename::rename(&task.path, &naming.candidate) {
        Ok(renamed) => Some(PipelineOutcome::Renamed {
            original: task.path.clone(),
            renamed,
        }),
        Err(err) => Some(PipelineOutcome::FailedRename(err.to_string())),
    }
}
