//! Pipeline runner contract.
//!
//! The scheduler treats the actual multi-stage processing (acquisition,
//! transcription, translation, speaker profiling, synthesis) as an opaque
//! async operation. A runner reports progress through [`RunHandle`] and
//! returns a structured result map, or an error that fails the job.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::scheduler::job::{PipelineStep, ResultMap, StepEvent, StepStatus};
use crate::{Error, Result};

/// Parameters of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    /// Source media URL (e.g. a video page) to acquire audio from.
    pub source_url: Option<String>,
    /// Direct audio URL.
    pub audio_url: Option<String>,
    /// Local audio file path.
    pub audio_path: Option<String>,
    /// Transcription/translation provider name.
    pub provider: Option<String>,
    pub model_name: Option<String>,
    pub language: Option<String>,
    /// Transcription chunk length in seconds.
    pub chunk_length: Option<u32>,
    /// Synthesis speed multiplier.
    pub speed: Option<f64>,
    /// Pause the run and wait for externally supplied speaker configs.
    pub manual_speakers: bool,
    /// Provider secret resolved from the submitting user's settings.
    pub provider_api_key: Option<String>,
}

impl PipelineRequest {
    /// The primary source reference, if any (used to annotate the job note
    /// on completion).
    pub fn source(&self) -> Option<&str> {
        self.source_url
            .as_deref()
            .or(self.audio_url.as_deref())
    }
}

/// Handle given to a runner for progress reporting and the manual
/// speaker-input gate.
pub struct RunHandle {
    progress_tx: mpsc::UnboundedSender<StepEvent>,
    speaker_rx: tokio::sync::Mutex<Option<oneshot::Receiver<serde_json::Value>>>,
    speaker_timeout: Option<Duration>,
}

impl RunHandle {
    pub(crate) fn new(
        progress_tx: mpsc::UnboundedSender<StepEvent>,
        speaker_rx: Option<oneshot::Receiver<serde_json::Value>>,
        speaker_timeout: Option<Duration>,
    ) -> Self {
        Self {
            progress_tx,
            speaker_rx: tokio::sync::Mutex::new(speaker_rx),
            speaker_timeout,
        }
    }

    /// Report a step event. May be called any number of times; events are
    /// relayed into the job's step log and to live subscribers.
    pub fn progress(
        &self,
        step: PipelineStep,
        status: StepStatus,
        message: impl Into<String>,
        detail: Option<String>,
    ) {
        let _ = self
            .progress_tx
            .send(StepEvent::new(step, status, message, detail));
    }

    /// Wait for the manual speaker payload.
    ///
    /// Resolves exactly once; a second call, or a call on a job submitted
    /// without `manual_speakers`, is an error. Waits indefinitely unless a
    /// timeout was configured.
    pub async fn await_speaker_input(&self) -> Result<serde_json::Value> {
        let rx = self
            .speaker_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::validation("no pending manual speaker input for this run"))?;

        let received = match self.speaker_timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| Error::runner("timed out waiting for manual speaker input"))?,
            None => rx.await,
        };
        received.map_err(|_| Error::runner("manual speaker input channel closed"))
    }
}

/// The multi-stage processing function the scheduler invokes per job.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    /// Execute the pipeline for one job. Progress callbacks go through
    /// `handle`; the returned map holds produced artifact locations. Any
    /// error description is surfaced verbatim as the job's `error`.
    async fn run(&self, request: &PipelineRequest, handle: &RunHandle) -> Result<ResultMap>;
}
