//! Database models for dubflow.

pub mod job;
pub mod settings;

pub use job::{JobDbModel, JobStepDbModel};
pub use settings::{QueueOrderDbModel, UserSettingsDbModel};
