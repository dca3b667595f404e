//! Integration tests for the dubflow persistence layer.
//!
//! These run against a real SQLite database on disk to verify the state
//! store honors its contract: atomic per-record writes, append-only step
//! logs, and cascading deletes.

use std::collections::HashMap;

use dubflow::database::{self, SqlxStateStore, StateStore};
use dubflow::scheduler::{
    Job, JobStatus, PipelineStep, StepEvent, StepStatus, UserSettings,
};
use dubflow::Error;

async fn setup_store() -> (SqlxStateStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!(
        "sqlite:{}?mode=rwc",
        dir.path().join("test.db").display()
    );
    let pool = database::init_pool(&url)
        .await
        .expect("Failed to create test pool");
    database::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    (SqlxStateStore::new(pool.clone()), dir)
}

fn sample_job(user_id: &str) -> Job {
    let mut job = Job::new(user_id, false);
    job.steps.push(StepEvent::new(
        PipelineStep::Acquire,
        StepStatus::Running,
        "downloading audio",
        None,
    ));
    job.steps.push(StepEvent::new(
        PipelineStep::Acquire,
        StepStatus::Completed,
        "audio ready",
        Some("file: audio.wav".to_string()),
    ));
    job.tags = vec!["news".to_string()];
    job
}

#[tokio::test]
async fn migrations_create_expected_tables() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("test.db").display());
    let pool = database::init_pool(&url).await.unwrap();
    database::run_migrations(&pool).await.unwrap();

    let tables: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(&pool)
            .await
            .unwrap();
    let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
    assert!(names.contains(&"job"), "job table missing");
    assert!(names.contains(&"job_step"), "job_step table missing");
    assert!(names.contains(&"user_settings"), "user_settings table missing");
    assert!(names.contains(&"queue_order"), "queue_order table missing");
}

#[tokio::test]
async fn job_round_trips_with_ordered_steps() {
    let (store, _dir) = setup_store().await;
    let mut job = sample_job("alice");
    job.status = JobStatus::Completed;
    job.result = Some(
        serde_json::from_str(r#"{"audio_path": "out/audio.wav"}"#).unwrap(),
    );

    store.upsert_job(&job).await.unwrap();
    let loaded = store.load_jobs().await.unwrap();
    assert_eq!(loaded.len(), 1);
    let restored = &loaded[0];
    assert_eq!(restored.id, job.id);
    assert_eq!(restored.status, job.status);
    assert_eq!(restored.steps, job.steps);
    assert_eq!(restored.result, job.result);
    assert_eq!(restored.tags, job.tags);
}

#[tokio::test]
async fn upsert_appends_only_new_steps() {
    let (store, _dir) = setup_store().await;
    let mut job = sample_job("alice");
    store.upsert_job(&job).await.unwrap();

    job.steps.push(StepEvent::new(
        PipelineStep::Synthesize,
        StepStatus::Completed,
        "audio rendered",
        None,
    ));
    store.upsert_job(&job).await.unwrap();
    // Re-writing an unchanged log must not duplicate rows either.
    store.upsert_job(&job).await.unwrap();

    let loaded = store.load_jobs().await.unwrap();
    assert_eq!(loaded[0].steps.len(), 3);
    assert_eq!(loaded[0].steps, job.steps);
}

#[tokio::test]
async fn delete_cascades_to_step_log() {
    let (store, _dir) = setup_store().await;
    let job = sample_job("alice");
    store.upsert_job(&job).await.unwrap();

    store.delete_job(&job.id).await.unwrap();
    assert!(store.load_jobs().await.unwrap().is_empty());

    match store.delete_job(&job.id).await {
        Err(Error::NotFound { .. }) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn settings_round_trip() {
    let (store, _dir) = setup_store().await;
    let mut settings = UserSettings::default();
    settings.parallel_enabled = true;
    settings.max_concurrent = 3;
    settings.tags = vec!["tech".to_string(), "news".to_string()];
    settings.api_keys = HashMap::from([("openai".to_string(), "sk-1".to_string())]);
    settings.asset_selections =
        HashMap::from([("background".to_string(), "bg-2".to_string())]);

    store.upsert_settings("alice", &settings).await.unwrap();
    settings.max_concurrent = 2;
    store.upsert_settings("alice", &settings).await.unwrap();

    let loaded = store.load_settings().await.unwrap();
    assert_eq!(loaded.len(), 1);
    let restored = &loaded["alice"];
    assert!(restored.parallel_enabled);
    assert_eq!(restored.max_concurrent, 2);
    assert_eq!(restored.tags, settings.tags);
    assert_eq!(restored.api_keys, settings.api_keys);
    assert_eq!(restored.asset_selections, settings.asset_selections);
}

#[tokio::test]
async fn queue_order_round_trip() {
    let (store, _dir) = setup_store().await;
    let order = vec!["j1".to_string(), "j2".to_string(), "j3".to_string()];
    store.upsert_queue_order("alice", &order).await.unwrap();
    store
        .upsert_queue_order("bob", &["j9".to_string()])
        .await
        .unwrap();

    let reordered = vec!["j3".to_string(), "j1".to_string(), "j2".to_string()];
    store.upsert_queue_order("alice", &reordered).await.unwrap();

    let loaded = store.load_queue_orders().await.unwrap();
    assert_eq!(loaded["alice"], reordered);
    assert_eq!(loaded["bob"], vec!["j9".to_string()]);
}
