//! State store: the durable mirror of scheduler state.
//!
//! The scheduler is the only writer. Writes are atomic per record: a job row
//! and its step-log tail go out in one transaction, and the step log is
//! append-only so the upserter only inserts rows beyond the persisted
//! sequence.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{
    JobDbModel, JobStepDbModel, QueueOrderDbModel, UserSettingsDbModel,
};
use crate::scheduler::job::{Job, UserSettings};
use crate::{Error, Result};

/// Durable representation of all jobs, per-user settings, and per-user
/// queue ordering.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or update a job record together with its full step log.
    async fn upsert_job(&self, job: &Job) -> Result<()>;
    /// Load every persisted job, step logs included, in emission order.
    async fn load_jobs(&self) -> Result<Vec<Job>>;
    /// Delete a job by id, cascading to its step log.
    async fn delete_job(&self, job_id: &str) -> Result<()>;

    async fn upsert_settings(&self, user_id: &str, settings: &UserSettings) -> Result<()>;
    async fn load_settings(&self) -> Result<HashMap<String, UserSettings>>;

    async fn upsert_queue_order(&self, user_id: &str, job_ids: &[String]) -> Result<()>;
    async fn load_queue_orders(&self) -> Result<HashMap<String, Vec<String>>>;
}

/// SQLx implementation of [`StateStore`].
pub struct SqlxStateStore {
    pool: SqlitePool,
}

impl SqlxStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for SqlxStateStore {
    async fn upsert_job(&self, job: &Job) -> Result<()> {
        let model = JobDbModel::from_domain(job)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO job (
                id, user_id, status, created_at, started_at, finished_at,
                error, result, speaker_required, speaker_submitted,
                note, custom_name, tags, published
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                error = excluded.error,
                result = excluded.result,
                speaker_required = excluded.speaker_required,
                speaker_submitted = excluded.speaker_submitted,
                note = excluded.note,
                custom_name = excluded.custom_name,
                tags = excluded.tags,
                published = excluded.published
            "#,
        )
        .bind(&model.id)
        .bind(&model.user_id)
        .bind(&model.status)
        .bind(&model.created_at)
        .bind(&model.started_at)
        .bind(&model.finished_at)
        .bind(&model.error)
        .bind(&model.result)
        .bind(model.speaker_required)
        .bind(model.speaker_submitted)
        .bind(&model.note)
        .bind(&model.custom_name)
        .bind(&model.tags)
        .bind(model.published)
        .execute(&mut *tx)
        .await?;

        // The step log is append-only: only rows past the persisted tail are
        // inserted.
        let (persisted,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM job_step WHERE job_id = ?")
                .bind(&model.id)
                .fetch_one(&mut *tx)
                .await?;
        let persisted = persisted.max(0) as usize;
        for (offset, event) in job.steps.iter().enumerate().skip(persisted) {
            let step = JobStepDbModel::from_domain(&job.id, offset as i64, event);
            sqlx::query(
                r#"
                INSERT INTO job_step (job_id, seq, step, status, message, detail, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&step.job_id)
            .bind(step.seq)
            .bind(&step.step)
            .bind(&step.status)
            .bind(&step.message)
            .bind(&step.detail)
            .bind(&step.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobDbModel>("SELECT * FROM job ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        let step_rows = sqlx::query_as::<_, JobStepDbModel>(
            "SELECT * FROM job_step ORDER BY job_id, seq",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut steps_by_job: HashMap<String, Vec<JobStepDbModel>> = HashMap::new();
        for step in step_rows {
            steps_by_job.entry(step.job_id.clone()).or_default().push(step);
        }

        rows.into_iter()
            .map(|row| {
                let steps = steps_by_job.remove(&row.id).unwrap_or_default();
                row.into_domain(steps)
            })
            .collect()
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        let affected = sqlx::query("DELETE FROM job WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(Error::not_found("Job", job_id));
        }
        Ok(())
    }

    async fn upsert_settings(&self, user_id: &str, settings: &UserSettings) -> Result<()> {
        let model = UserSettingsDbModel::from_domain(user_id, settings)?;
        sqlx::query(
            r#"
            INSERT INTO user_settings (
                user_id, parallel_enabled, max_concurrent, tags, api_keys, asset_selections
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                parallel_enabled = excluded.parallel_enabled,
                max_concurrent = excluded.max_concurrent,
                tags = excluded.tags,
                api_keys = excluded.api_keys,
                asset_selections = excluded.asset_selections
            "#,
        )
        .bind(&model.user_id)
        .bind(model.parallel_enabled)
        .bind(model.max_concurrent)
        .bind(&model.tags)
        .bind(&model.api_keys)
        .bind(&model.asset_selections)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_settings(&self) -> Result<HashMap<String, UserSettings>> {
        let rows = sqlx::query_as::<_, UserSettingsDbModel>("SELECT * FROM user_settings")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let user_id = row.user_id.clone();
                row.into_domain().map(|settings| (user_id, settings))
            })
            .collect()
    }

    async fn upsert_queue_order(&self, user_id: &str, job_ids: &[String]) -> Result<()> {
        let model = QueueOrderDbModel::from_domain(user_id, job_ids)?;
        sqlx::query(
            r#"
            INSERT INTO queue_order (user_id, job_ids)
            VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET job_ids = excluded.job_ids
            "#,
        )
        .bind(&model.user_id)
        .bind(&model.job_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_queue_orders(&self) -> Result<HashMap<String, Vec<String>>> {
        let rows = sqlx::query_as::<_, QueueOrderDbModel>("SELECT * FROM queue_order")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let user_id = row.user_id.clone();
                row.into_domain().map(|order| (user_id, order))
            })
            .collect()
    }
}
