//! Pipeline scheduling: job domain model, runner contract, and the
//! scheduler service.

pub mod job;
pub mod runner;
pub mod service;

pub use job::{
    Job, JobMetaUpdate, JobStatus, JobSummary, PipelineStep, ResultMap, StepEvent, StepStatus,
    UserSettings, UserSettingsUpdate,
};
pub use runner::{PipelineRequest, PipelineRunner, RunHandle};
pub use service::{JobEvent, JobEventStream, Scheduler};
