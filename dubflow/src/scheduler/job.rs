//! Job domain model: lifecycle state, step log, and per-user settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Structured result map of produced artifact locations and metadata.
pub type ResultMap = serde_json::Map<String, serde_json::Value>;

/// Job lifecycle status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a free execution slot.
    Queued,
    /// Pipeline run in progress.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Pipeline stage identifiers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PipelineStep {
    /// Audio acquisition (download or local file).
    Acquire,
    /// Speech-to-text transcription.
    Transcribe,
    /// Text translation.
    Translate,
    /// Summary generation.
    Summarize,
    /// Speaker profiling and clip selection.
    Speakers,
    /// Voice synthesis.
    Synthesize,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::Transcribe => "transcribe",
            Self::Translate => "translate",
            Self::Summarize => "summarize",
            Self::Speakers => "speakers",
            Self::Synthesize => "synthesize",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "acquire" => Some(Self::Acquire),
            "transcribe" => Some(Self::Transcribe),
            "translate" => Some(Self::Translate),
            "summarize" => Some(Self::Summarize),
            "speakers" => Some(Self::Speakers),
            "synthesize" => Some(Self::Synthesize),
            _ => None,
        }
    }
}

/// Progress status of a single step event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    /// Paused for external input (manual speaker configuration).
    Waiting,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Waiting => "waiting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "waiting" => Some(Self::Waiting),
            _ => None,
        }
    }
}

/// An immutable, append-only step log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub step: PipelineStep,
    pub status: StepStatus,
    pub message: String,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StepEvent {
    /// Create a new step event with the current timestamp.
    pub fn new(
        step: PipelineStep,
        status: StepStatus,
        message: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            step,
            status,
            message: message.into(),
            detail,
            timestamp: Utc::now(),
        }
    }
}

/// One user-submitted run of the multi-stage dubbing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID, assigned at submission.
    pub id: String,
    /// Owning user; admission control and ordering are scoped per user.
    pub user_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Set exactly once on the transition into `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly once on the terminal transition.
    pub finished_at: Option<DateTime<Utc>>,
    /// Present iff the job failed.
    pub error: Option<String>,
    /// Append-only step log, never truncated or reordered.
    pub steps: Vec<StepEvent>,
    /// Artifact locations, populated on success.
    pub result: Option<ResultMap>,
    /// The pipeline run will pause for externally supplied speaker configs.
    pub speaker_required: bool,
    /// Manual speaker input has been delivered (at most once).
    pub speaker_submitted: bool,
    pub note: Option<String>,
    pub custom_name: Option<String>,
    pub tags: Vec<String>,
    pub published: bool,
}

impl Job {
    /// Create a new queued job.
    pub fn new(user_id: impl Into<String>, speaker_required: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            steps: Vec::new(),
            result: None,
            speaker_required,
            speaker_submitted: false,
            note: None,
            custom_name: None,
            tags: Vec::new(),
            published: false,
        }
    }

    /// Build a listing summary with the job's current queue position.
    pub fn summary(&self, queue_position: Option<usize>) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
            result: self.result.clone(),
            speaker_required: self.speaker_required,
            speaker_submitted: self.speaker_submitted,
            queue_position,
            note: self.note.clone(),
            custom_name: self.custom_name.clone(),
            tags: self.tags.clone(),
            published: self.published,
        }
    }
}

/// Read-only job listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<ResultMap>,
    pub speaker_required: bool,
    pub speaker_submitted: bool,
    /// Index within the user's queue order, `None` once running or terminal.
    pub queue_position: Option<usize>,
    pub note: Option<String>,
    pub custom_name: Option<String>,
    pub tags: Vec<String>,
    pub published: bool,
}

/// Lower bound of the per-user concurrency clamp.
pub const MIN_CONCURRENT: u32 = 1;

/// Upper bound of the per-user concurrency clamp.
pub const MAX_CONCURRENT: u32 = 5;

/// Per-user scheduler settings, created lazily on first access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    /// When false, capacity collapses to 1 regardless of `max_concurrent`.
    pub parallel_enabled: bool,
    /// Concurrency slots, clamped to `[1, 5]`.
    pub max_concurrent: u32,
    /// Tag vocabulary; when non-empty, job tags are filtered against it.
    pub tags: Vec<String>,
    /// Provider name -> API secret.
    pub api_keys: HashMap<String, String>,
    /// Asset type -> selection id.
    pub asset_selections: HashMap<String, String>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            parallel_enabled: false,
            max_concurrent: MIN_CONCURRENT,
            tags: Vec::new(),
            api_keys: HashMap::new(),
            asset_selections: HashMap::new(),
        }
    }
}

impl UserSettings {
    /// Effective concurrency slots for admission control.
    pub fn slot_cap(&self) -> usize {
        if self.parallel_enabled {
            self.max_concurrent.clamp(MIN_CONCURRENT, MAX_CONCURRENT) as usize
        } else {
            1
        }
    }

    /// Look up the API secret for a provider.
    pub fn api_key(&self, provider: &str) -> Option<&str> {
        self.api_keys.get(provider).map(String::as_str)
    }

    fn set_tags(&mut self, tags: Vec<String>) {
        let mut normalized: Vec<String> = Vec::new();
        for tag in tags {
            let label = tag.trim();
            if label.is_empty() {
                continue;
            }
            if !normalized.iter().any(|t| t == label) {
                normalized.push(label.to_string());
            }
        }
        self.tags = normalized;
    }

    fn set_api_keys(&mut self, api_keys: HashMap<String, String>) {
        self.api_keys = normalize_map(api_keys);
    }

    fn set_asset_selections(&mut self, asset_selections: HashMap<String, String>) {
        self.asset_selections = normalize_map(asset_selections);
    }

    /// Apply a partial update, normalizing and clamping as needed.
    pub fn apply(&mut self, update: UserSettingsUpdate) {
        if let Some(parallel_enabled) = update.parallel_enabled {
            self.parallel_enabled = parallel_enabled;
        }
        if let Some(max_concurrent) = update.max_concurrent {
            self.max_concurrent = max_concurrent.clamp(MIN_CONCURRENT, MAX_CONCURRENT);
        }
        if let Some(tags) = update.tags {
            self.set_tags(tags);
        }
        if let Some(api_keys) = update.api_keys {
            self.set_api_keys(api_keys);
        }
        if let Some(asset_selections) = update.asset_selections {
            self.set_asset_selections(asset_selections);
        }
    }
}

fn normalize_map(map: HashMap<String, String>) -> HashMap<String, String> {
    map.into_iter()
        .filter_map(|(key, value)| {
            let key = key.trim().to_string();
            let value = value.trim().to_string();
            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key, value))
            }
        })
        .collect()
}

/// Partial update of [`UserSettings`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSettingsUpdate {
    pub parallel_enabled: Option<bool>,
    pub max_concurrent: Option<u32>,
    pub tags: Option<Vec<String>>,
    pub api_keys: Option<HashMap<String, String>>,
    pub asset_selections: Option<HashMap<String, String>>,
}

/// Partial update of a job's user-editable metadata. Mutation does not
/// affect scheduling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMetaUpdate {
    pub note: Option<String>,
    pub custom_name: Option<String>,
    pub tags: Option<Vec<String>>,
    pub published: Option<bool>,
}
