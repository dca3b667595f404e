//! Job database models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::scheduler::job::{Job, JobStatus, PipelineStep, StepEvent, StepStatus};
use crate::{Error, Result};

/// Job database model. Step events live in the `job_step` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub user_id: String,
    /// Status: queued, running, completed, failed
    pub status: String,
    /// RFC 3339 timestamp when the job was submitted
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
    /// JSON map of produced artifact locations
    pub result: Option<String>,
    pub speaker_required: bool,
    pub speaker_submitted: bool,
    pub note: Option<String>,
    pub custom_name: Option<String>,
    /// JSON array of tag labels
    pub tags: String,
    pub published: bool,
}

impl JobDbModel {
    pub fn from_domain(job: &Job) -> Result<Self> {
        Ok(Self {
            id: job.id.clone(),
            user_id: job.user_id.clone(),
            status: job.status.as_str().to_string(),
            created_at: job.created_at.to_rfc3339(),
            started_at: job.started_at.map(|t| t.to_rfc3339()),
            finished_at: job.finished_at.map(|t| t.to_rfc3339()),
            error: job.error.clone(),
            result: job
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            speaker_required: job.speaker_required,
            speaker_submitted: job.speaker_submitted,
            note: job.note.clone(),
            custom_name: job.custom_name.clone(),
            tags: serde_json::to_string(&job.tags)?,
            published: job.published,
        })
    }

    pub fn into_domain(self, steps: Vec<JobStepDbModel>) -> Result<Job> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| Error::validation(format!("unknown job status '{}'", self.status)))?;
        let steps = steps
            .into_iter()
            .map(JobStepDbModel::into_domain)
            .collect::<Result<Vec<StepEvent>>>()?;
        Ok(Job {
            id: self.id,
            user_id: self.user_id,
            status,
            created_at: parse_timestamp(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            finished_at: self
                .finished_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            error: self.error,
            steps,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            speaker_required: self.speaker_required,
            speaker_submitted: self.speaker_submitted,
            note: self.note,
            custom_name: self.custom_name,
            tags: serde_json::from_str(&self.tags)?,
            published: self.published,
        })
    }
}

/// Step-event database model, one row per emitted event.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobStepDbModel {
    pub job_id: String,
    /// Position within the job's append-only log.
    pub seq: i64,
    pub step: String,
    pub status: String,
    pub message: String,
    pub detail: Option<String>,
    pub created_at: String,
}

impl JobStepDbModel {
    pub fn from_domain(job_id: &str, seq: i64, event: &StepEvent) -> Self {
        Self {
            job_id: job_id.to_string(),
            seq,
            step: event.step.as_str().to_string(),
            status: event.status.as_str().to_string(),
            message: event.message.clone(),
            detail: event.detail.clone(),
            created_at: event.timestamp.to_rfc3339(),
        }
    }

    pub fn into_domain(self) -> Result<StepEvent> {
        let step = PipelineStep::parse(&self.step)
            .ok_or_else(|| Error::validation(format!("unknown pipeline step '{}'", self.step)))?;
        let status = StepStatus::parse(&self.status)
            .ok_or_else(|| Error::validation(format!("unknown step status '{}'", self.status)))?;
        Ok(StepEvent {
            step,
            status,
            message: self.message,
            detail: self.detail,
            timestamp: parse_timestamp(&self.created_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::validation(format!("invalid timestamp '{raw}': {e}")))
}
