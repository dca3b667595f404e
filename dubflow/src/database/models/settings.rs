//! User settings and queue-order database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::Result;
use crate::scheduler::job::{MAX_CONCURRENT, MIN_CONCURRENT, UserSettings};

/// Per-user settings database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserSettingsDbModel {
    pub user_id: String,
    pub parallel_enabled: bool,
    pub max_concurrent: i64,
    /// JSON array of tag labels
    pub tags: String,
    /// JSON map of provider -> secret
    pub api_keys: String,
    /// JSON map of asset type -> selection id
    pub asset_selections: String,
}

impl UserSettingsDbModel {
    pub fn from_domain(user_id: &str, settings: &UserSettings) -> Result<Self> {
        Ok(Self {
            user_id: user_id.to_string(),
            parallel_enabled: settings.parallel_enabled,
            max_concurrent: settings.max_concurrent as i64,
            tags: serde_json::to_string(&settings.tags)?,
            api_keys: serde_json::to_string(&settings.api_keys)?,
            asset_selections: serde_json::to_string(&settings.asset_selections)?,
        })
    }

    pub fn into_domain(self) -> Result<UserSettings> {
        Ok(UserSettings {
            parallel_enabled: self.parallel_enabled,
            max_concurrent: (self.max_concurrent.max(0) as u32)
                .clamp(MIN_CONCURRENT, MAX_CONCURRENT),
            tags: serde_json::from_str(&self.tags)?,
            api_keys: serde_json::from_str(&self.api_keys)?,
            asset_selections: serde_json::from_str(&self.asset_selections)?,
        })
    }
}

/// Per-user dispatch order, stored as one JSON array row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueOrderDbModel {
    pub user_id: String,
    /// JSON array of job ids
    pub job_ids: String,
}

impl QueueOrderDbModel {
    pub fn from_domain(user_id: &str, job_ids: &[String]) -> Result<Self> {
        Ok(Self {
            user_id: user_id.to_string(),
            job_ids: serde_json::to_string(job_ids)?,
        })
    }

    pub fn into_domain(self) -> Result<Vec<String>> {
        Ok(serde_json::from_str(&self.job_ids)?)
    }
}
