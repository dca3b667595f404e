//! The pipeline scheduler.
//!
//! Owns all mutable job state behind a single lock: per-user admission
//! control over bounded concurrency slots, queue-order dispatch, crash
//! recovery on load, coalesced asynchronous persistence, and per-job
//! progress fan-out.
//!
//! One task is spawned per submitted job. The task waits for a free slot
//! (notify-on-release with a bounded re-check interval), invokes the
//! pipeline runner, relays every progress callback into the job's step log
//! and live event channel, and finalizes the job when the runner returns.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clip_select::{ClipCandidate, ClipSelection};
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::scheduler::job::{
    Job, JobMetaUpdate, JobStatus, JobSummary, ResultMap, StepEvent, UserSettings,
    UserSettingsUpdate,
};
use crate::scheduler::runner::{PipelineRequest, PipelineRunner, RunHandle};
use crate::{Error, Result, database::StateStore};

/// Result-map key holding the per-speaker candidate lists.
const RESULT_KEY_CLIP_CANDIDATES: &str = "speaker_clip_candidates";

/// Result-map key holding the per-speaker selected candidate index.
const RESULT_KEY_CLIP_SELECTED: &str = "speaker_clip_selected";

/// Synthetic error recorded for jobs found non-terminal at load time.
const RESTART_ERROR: &str = "interrupted by restart";

/// Delay before the writer retries a failed persistence cycle.
const FLUSH_RETRY_DELAY: Duration = Duration::from_millis(200);

/// A live event delivered to job subscribers.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A new step-log entry.
    Step(StepEvent),
    /// End-of-stream sentinel: the job reached a terminal state.
    Closed,
}

struct JobEntry {
    job: Job,
    /// Live fan-out channel; send errors (no subscribers) are ignored.
    events: broadcast::Sender<JobEvent>,
    /// One-shot manual speaker-input gate, taken on fulfillment.
    speaker_tx: Option<oneshot::Sender<serde_json::Value>>,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<String, JobEntry>,
    /// Per-user dispatch order of still-queued job ids.
    queue_order: HashMap<String, Vec<String>>,
    /// Per-user set of currently running job ids.
    running: HashMap<String, HashSet<String>>,
    settings: HashMap<String, UserSettings>,
}

impl SchedulerState {
    fn queue_position(&self, user_id: &str, job_id: &str) -> Option<usize> {
        self.queue_order
            .get(user_id)?
            .iter()
            .position(|id| id == job_id)
    }

    fn settings_for(&self, user_id: &str) -> UserSettings {
        self.settings.get(user_id).cloned().unwrap_or_default()
    }

    fn active_count(&self, user_id: &str) -> usize {
        self.jobs
            .values()
            .filter(|e| e.job.user_id == user_id && !e.job.status.is_terminal())
            .count()
    }
}

/// Dirty-record bookkeeping for the single-flight coalesced writer.
#[derive(Default)]
struct DirtyState {
    jobs: HashSet<String>,
    queues: HashSet<String>,
    settings: HashSet<String>,
    /// Ids deleted while a write may be in flight; the writer re-deletes any
    /// of these it has just upserted. Cleared when the writer goes idle.
    deleted: HashSet<String>,
    flush_in_flight: bool,
    flush_pending: bool,
}

impl DirtyState {
    fn is_clean(&self) -> bool {
        self.jobs.is_empty() && self.queues.is_empty() && self.settings.is_empty()
    }
}

struct SchedulerInner {
    config: SchedulerConfig,
    runner: Arc<dyn PipelineRunner>,
    store: Option<Arc<dyn StateStore>>,
    state: Mutex<SchedulerState>,
    dirty: Mutex<DirtyState>,
    /// Signalled whenever a slot frees up or capacity may have grown.
    slots_released: Notify,
}

/// The job scheduler. Cheap to clone; all clones share one state registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler without durable persistence.
    pub fn new(runner: Arc<dyn PipelineRunner>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                runner,
                store: None,
                state: Mutex::new(SchedulerState::default()),
                dirty: Mutex::new(DirtyState::default()),
                slots_released: Notify::new(),
            }),
        }
    }

    /// Create a scheduler backed by a state store, loading persisted state
    /// and applying crash recovery: any job found `queued` or `running` is
    /// failed with a synthetic error, and per-user queue orders are rebuilt
    /// from jobs still legitimately queued.
    pub async fn with_store(
        runner: Arc<dyn PipelineRunner>,
        store: Arc<dyn StateStore>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let jobs = store.load_jobs().await?;
        let settings = store.load_settings().await?;
        let persisted_orders = store.load_queue_orders().await?;

        let mut state = SchedulerState {
            settings,
            ..Default::default()
        };
        let mut corrected: Vec<String> = Vec::new();

        for mut job in jobs {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.error.get_or_insert_with(|| RESTART_ERROR.to_string());
                job.finished_at.get_or_insert_with(Utc::now);
                corrected.push(job.id.clone());
                warn!(job_id = %job.id, "job failed during recovery: {RESTART_ERROR}");
            }
            let (events, _) = broadcast::channel(config.event_capacity);
            state.jobs.insert(
                job.id.clone(),
                JobEntry {
                    job,
                    events,
                    speaker_tx: None,
                },
            );
        }

        // Rebuild dispatch order per user: persisted order filtered to jobs
        // still queued, falling back to creation order.
        let mut users: HashSet<String> = state
            .jobs
            .values()
            .map(|e| e.job.user_id.clone())
            .collect();
        users.extend(persisted_orders.keys().cloned());
        let mut rebuilt_orders: HashSet<String> = HashSet::new();
        for user_id in users {
            let mut queued: Vec<&Job> = state
                .jobs
                .values()
                .map(|e| &e.job)
                .filter(|j| j.user_id == user_id && j.status == JobStatus::Queued)
                .collect();
            let order: Vec<String> = match persisted_orders.get(&user_id) {
                Some(persisted) if !persisted.is_empty() => persisted
                    .iter()
                    .filter(|id| queued.iter().any(|j| &j.id == *id))
                    .cloned()
                    .collect(),
                _ => {
                    queued.sort_by_key(|j| j.created_at);
                    queued.iter().map(|j| j.id.clone()).collect()
                }
            };
            if persisted_orders.get(&user_id) != Some(&order) {
                rebuilt_orders.insert(user_id.clone());
            }
            state.queue_order.insert(user_id, order);
        }

        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                config,
                runner,
                store: Some(store),
                state: Mutex::new(state),
                dirty: Mutex::new(DirtyState::default()),
                slots_released: Notify::new(),
            }),
        };

        if !corrected.is_empty() || !rebuilt_orders.is_empty() {
            let mut dirty = scheduler.inner.dirty.lock();
            dirty.jobs.extend(corrected);
            dirty.queues.extend(rebuilt_orders);
            drop(dirty);
            scheduler.inner.schedule_flush();
        }

        info!(
            jobs = scheduler.inner.state.lock().jobs.len(),
            "scheduler state loaded"
        );
        Ok(scheduler)
    }

    /// Submit a new job. Rejects when the user already has the configured
    /// maximum of queued-or-running jobs. Returns immediately; execution
    /// proceeds in a background task.
    pub fn submit(&self, mut request: PipelineRequest, user_id: &str) -> Result<Job> {
        let (job, speaker_rx) = {
            let mut state = self.inner.state.lock();
            if state.active_count(user_id) >= self.inner.config.max_queued {
                return Err(Error::QueueFull {
                    limit: self.inner.config.max_queued,
                });
            }

            if request.provider_api_key.is_none()
                && let Some(provider) = request.provider.as_deref()
            {
                request.provider_api_key = state
                    .settings_for(user_id)
                    .api_key(provider)
                    .map(str::to_string);
            }

            let job = Job::new(user_id, request.manual_speakers);
            let (events, _) = broadcast::channel(self.inner.config.event_capacity);
            let (speaker_tx, speaker_rx) = if request.manual_speakers {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
            state.jobs.insert(
                job.id.clone(),
                JobEntry {
                    job: job.clone(),
                    events,
                    speaker_tx,
                },
            );
            state
                .queue_order
                .entry(user_id.to_string())
                .or_default()
                .push(job.id.clone());
            (job, speaker_rx)
        };

        self.inner.mark_job_dirty(&job.id);
        self.inner.mark_queue_dirty(user_id);
        self.inner.schedule_flush();

        info!(
            job_id = %job.id,
            user_id = %user_id,
            manual_speakers = request.manual_speakers,
            "job enqueued"
        );

        let inner = self.inner.clone();
        let job_id = job.id.clone();
        let owner = user_id.to_string();
        tokio::spawn(async move {
            SchedulerInner::run_job(inner, job_id, owner, request, speaker_rx).await;
        });

        Ok(job)
    }

    /// Fetch a job's full current state, step log included.
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.inner
            .state
            .lock()
            .jobs
            .get(job_id)
            .map(|e| e.job.clone())
    }

    /// List a user's jobs: queued first in dispatch order, then running by
    /// start time, then terminal jobs newest first.
    pub fn list(&self, user_id: &str) -> Vec<JobSummary> {
        let state = self.inner.state.lock();
        let mut ordered: Vec<String> = Vec::new();

        if let Some(order) = state.queue_order.get(user_id) {
            ordered.extend(order.iter().filter(|id| state.jobs.contains_key(*id)).cloned());
        }

        let mut running: Vec<&Job> = state
            .jobs
            .values()
            .map(|e| &e.job)
            .filter(|j| {
                j.user_id == user_id
                    && j.status == JobStatus::Running
                    && !ordered.contains(&j.id)
            })
            .collect();
        running.sort_by_key(|j| j.started_at.unwrap_or(j.created_at));
        ordered.extend(running.iter().map(|j| j.id.clone()));

        let mut remaining: Vec<&Job> = state
            .jobs
            .values()
            .map(|e| &e.job)
            .filter(|j| j.user_id == user_id && !ordered.contains(&j.id))
            .collect();
        remaining.sort_by_key(|j| std::cmp::Reverse(j.finished_at.unwrap_or(j.created_at)));
        ordered.extend(remaining.iter().map(|j| j.id.clone()));

        ordered
            .iter()
            .filter_map(|id| {
                let entry = state.jobs.get(id)?;
                Some(entry.job.summary(state.queue_position(user_id, id)))
            })
            .collect()
    }

    /// A queued job's current position in its user's dispatch order.
    pub fn queue_position(&self, job_id: &str) -> Option<usize> {
        let state = self.inner.state.lock();
        let user_id = state.jobs.get(job_id)?.job.user_id.clone();
        state.queue_position(&user_id, job_id)
    }

    /// Reinterpret a user's queue order. Known queued ids keep the requested
    /// sequence; queued jobs not mentioned are appended in their previous
    /// order, so nothing is dropped silently. Idempotent.
    pub fn reorder(&self, user_id: &str, desired: &[String]) -> Vec<String> {
        let reordered = {
            let mut state = self.inner.state.lock();
            let current: Vec<String> = state
                .queue_order
                .get(user_id)
                .map(|order| {
                    order
                        .iter()
                        .filter(|id| state.jobs.contains_key(*id))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            let wanted: Vec<String> = desired
                .iter()
                .filter(|id| current.contains(id))
                .cloned()
                .collect();
            let remaining: Vec<String> = current
                .into_iter()
                .filter(|id| !wanted.contains(id))
                .collect();
            let reordered: Vec<String> = wanted.into_iter().chain(remaining).collect();
            state
                .queue_order
                .insert(user_id.to_string(), reordered.clone());
            reordered
        };
        self.inner.mark_queue_dirty(user_id);
        self.inner.schedule_flush();
        reordered
    }

    /// Deliver the manual speaker payload for a paused job. Fulfills the
    /// one-shot gate exactly once.
    pub fn submit_speaker_input(
        &self,
        job_id: &str,
        payload: serde_json::Value,
    ) -> Result<Job> {
        if !payload.is_array() {
            return Err(Error::validation(
                "speaker payload must be a JSON array of speaker configs",
            ));
        }
        let job = {
            let mut state = self.inner.state.lock();
            let entry = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::not_found("Job", job_id))?;
            if !entry.job.speaker_required {
                return Err(Error::validation(
                    "manual speaker input not required for this job",
                ));
            }
            if entry.job.speaker_submitted {
                return Err(Error::validation("speaker input already submitted"));
            }
            let tx = entry
                .speaker_tx
                .take()
                .ok_or_else(|| Error::validation("speaker input not pending for this job"))?;
            if tx.send(payload).is_err() {
                return Err(Error::validation(
                    "job is no longer waiting for speaker input",
                ));
            }
            entry.job.speaker_submitted = true;
            entry.job.clone()
        };
        self.inner.mark_job_dirty(job_id);
        self.inner.schedule_flush();
        info!(job_id = %job_id, "manual speaker input submitted");
        Ok(job)
    }

    /// Merge fields into a job's result map. Supports post-completion
    /// enrichment, e.g. attaching a later-generated artifact.
    pub fn update_result(&self, job_id: &str, updates: ResultMap) -> Result<Job> {
        let job = {
            let mut state = self.inner.state.lock();
            let entry = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::not_found("Job", job_id))?;
            let result = entry.job.result.get_or_insert_with(ResultMap::new);
            for (key, value) in updates {
                result.insert(key, value);
            }
            entry.job.clone()
        };
        self.inner.mark_job_dirty(job_id);
        self.inner.schedule_flush();
        Ok(job)
    }

    /// Update a job's user-editable metadata. Tags are filtered against the
    /// user's configured vocabulary when one exists.
    pub fn update_meta(&self, job_id: &str, update: JobMetaUpdate) -> Result<Job> {
        let job = {
            let mut state = self.inner.state.lock();
            let vocabulary = state
                .jobs
                .get(job_id)
                .map(|e| state.settings_for(&e.job.user_id).tags)
                .ok_or_else(|| Error::not_found("Job", job_id))?;
            let entry = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::not_found("Job", job_id))?;
            if let Some(note) = update.note {
                let note = note.trim();
                entry.job.note = (!note.is_empty()).then(|| note.to_string());
            }
            if let Some(custom_name) = update.custom_name {
                let custom_name = custom_name.trim();
                entry.job.custom_name = (!custom_name.is_empty()).then(|| custom_name.to_string());
            }
            if let Some(tags) = update.tags {
                entry.job.tags = tags
                    .into_iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .filter(|t| vocabulary.is_empty() || vocabulary.contains(t))
                    .collect();
            }
            if let Some(published) = update.published {
                entry.job.published = published;
            }
            entry.job.clone()
        };
        self.inner.mark_job_dirty(job_id);
        self.inner.schedule_flush();
        Ok(job)
    }

    /// Remove a job from memory, persistence, and queue order. A running
    /// task is not cancelled; it finalizes into nothing.
    pub async fn delete(&self, job_id: &str) -> Result<()> {
        let user_id = {
            let mut state = self.inner.state.lock();
            let entry = state
                .jobs
                .remove(job_id)
                .ok_or_else(|| Error::not_found("Job", job_id))?;
            let user_id = entry.job.user_id;
            if let Some(order) = state.queue_order.get_mut(&user_id) {
                order.retain(|id| id != job_id);
            }
            if let Some(running) = state.running.get_mut(&user_id) {
                running.remove(job_id);
            }
            user_id
        };
        {
            let mut dirty = self.inner.dirty.lock();
            dirty.jobs.remove(job_id);
            // Tombstone the id so an upsert already in flight cannot
            // re-insert the row after our delete below.
            if self.inner.store.is_some() {
                dirty.deleted.insert(job_id.to_string());
            }
        }
        self.inner.mark_queue_dirty(&user_id);
        self.inner.schedule_flush();
        self.inner.slots_released.notify_waiters();

        if let Some(store) = &self.inner.store
            && let Err(e) = store.delete_job(job_id).await
            && !matches!(e, Error::NotFound { .. })
        {
            warn!(job_id = %job_id, "failed to delete persisted job: {e}");
        }
        info!(job_id = %job_id, user_id = %user_id, "job deleted");
        Ok(())
    }

    /// Subscribe to a job's step events: replays the full history first,
    /// then tails live events until the terminal sentinel.
    pub fn subscribe(&self, job_id: &str) -> Result<JobEventStream> {
        let state = self.inner.state.lock();
        let entry = state
            .jobs
            .get(job_id)
            .ok_or_else(|| Error::not_found("Job", job_id))?;
        // History snapshot and receiver are taken under the same lock, so a
        // late subscriber neither misses nor duplicates events.
        Ok(JobEventStream {
            history: entry.job.steps.clone().into(),
            rx: entry.events.subscribe(),
            done: entry.job.status.is_terminal(),
        })
    }

    /// A user's settings, created lazily on first access.
    pub fn settings(&self, user_id: &str) -> UserSettings {
        let mut state = self.inner.state.lock();
        state
            .settings
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// Apply a partial settings update and persist it. Raising capacity
    /// wakes waiting jobs.
    pub fn update_settings(&self, user_id: &str, update: UserSettingsUpdate) -> UserSettings {
        let settings = {
            let mut state = self.inner.state.lock();
            let settings = state.settings.entry(user_id.to_string()).or_default();
            settings.apply(update);
            settings.clone()
        };
        self.inner.mark_settings_dirty(user_id);
        self.inner.schedule_flush();
        self.inner.slots_released.notify_waiters();
        settings
    }

    /// Advance the round-robin speaker-clip pick recorded in a completed
    /// job's result and persist the new selection. Deterministic and
    /// resumable: both candidates and pointer live in the result map.
    pub fn repick_speaker_clip(&self, job_id: &str, speaker: &str) -> Result<ClipCandidate> {
        let picked = {
            let mut state = self.inner.state.lock();
            let entry = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::not_found("Job", job_id))?;
            let result = entry
                .job
                .result
                .as_mut()
                .ok_or_else(|| Error::validation("job has no recorded result"))?;
            let candidates = result
                .get(RESULT_KEY_CLIP_CANDIDATES)
                .cloned()
                .ok_or_else(|| Error::validation("job has no speaker clip candidates"))?;
            let selected = result
                .get(RESULT_KEY_CLIP_SELECTED)
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            let mut selection = ClipSelection {
                candidates: serde_json::from_value(candidates)?,
                selected: serde_json::from_value(selected)?,
            };
            let picked = selection
                .advance(speaker)
                .cloned()
                .ok_or_else(|| Error::validation(format!("no clip candidates for {speaker}")))?;
            result.insert(
                RESULT_KEY_CLIP_SELECTED.to_string(),
                serde_json::to_value(&selection.selected)?,
            );
            picked
        };
        self.inner.mark_job_dirty(job_id);
        self.inner.schedule_flush();
        debug!(job_id = %job_id, speaker = %speaker, "speaker clip re-picked");
        Ok(picked)
    }

    /// Write every dirty record out, waiting for any in-flight writer first.
    /// Persistence failures are logged and retried by the writer before it
    /// goes idle.
    pub async fn flush(&self) {
        let Some(store) = self.inner.store.clone() else {
            return;
        };
        loop {
            {
                let mut dirty = self.inner.dirty.lock();
                if !dirty.flush_in_flight {
                    if dirty.is_clean() {
                        return;
                    }
                    dirty.flush_in_flight = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.inner.run_flush(&store).await;
    }
}

impl SchedulerInner {
    fn mark_job_dirty(&self, job_id: &str) {
        self.dirty.lock().jobs.insert(job_id.to_string());
    }

    fn mark_queue_dirty(&self, user_id: &str) {
        self.dirty.lock().queues.insert(user_id.to_string());
    }

    fn mark_settings_dirty(&self, user_id: &str) {
        self.dirty.lock().settings.insert(user_id.to_string());
    }

    /// Kick the single-flight writer. If a flush is already in flight, the
    /// accumulated changes ride along in exactly one follow-up write.
    fn schedule_flush(self: &Arc<Self>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        {
            let mut dirty = self.dirty.lock();
            if dirty.flush_in_flight {
                dirty.flush_pending = true;
                return;
            }
            dirty.flush_in_flight = true;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            inner.run_flush(&store).await;
        });
    }

    async fn run_flush(&self, store: &Arc<dyn StateStore>) {
        loop {
            let (jobs, queues, settings) = {
                let mut dirty = self.dirty.lock();
                (
                    mem::take(&mut dirty.jobs),
                    mem::take(&mut dirty.queues),
                    mem::take(&mut dirty.settings),
                )
            };
            let mut failed = false;

            for job_id in jobs {
                let snapshot = self.state.lock().jobs.get(&job_id).map(|e| e.job.clone());
                if let Some(job) = snapshot
                    && let Err(e) = store.upsert_job(&job).await
                {
                    warn!(job_id = %job_id, "job persistence failed, will retry: {e}");
                    self.dirty.lock().jobs.insert(job_id.clone());
                    failed = true;
                }
                // A delete that landed while the upsert was in flight wins:
                // remove whatever the write just put back.
                let tombstoned = self.dirty.lock().deleted.contains(&job_id);
                if tombstoned
                    && let Err(e) = store.delete_job(&job_id).await
                    && !matches!(e, Error::NotFound { .. })
                {
                    warn!(job_id = %job_id, "job re-delete failed, will retry: {e}");
                    self.dirty.lock().jobs.insert(job_id.clone());
                    failed = true;
                }
            }
            for user_id in queues {
                let order = self
                    .state
                    .lock()
                    .queue_order
                    .get(&user_id)
                    .cloned()
                    .unwrap_or_default();
                if let Err(e) = store.upsert_queue_order(&user_id, &order).await {
                    warn!(user_id = %user_id, "queue-order persistence failed, will retry: {e}");
                    self.dirty.lock().queues.insert(user_id);
                    failed = true;
                }
            }
            for user_id in settings {
                let snapshot = self.state.lock().settings.get(&user_id).cloned();
                let Some(settings) = snapshot else {
                    continue;
                };
                if let Err(e) = store.upsert_settings(&user_id, &settings).await {
                    warn!(user_id = %user_id, "settings persistence failed, will retry: {e}");
                    self.dirty.lock().settings.insert(user_id);
                    failed = true;
                }
            }

            // Failed records were re-marked above; retry before going idle so
            // a failure on the last event (e.g. terminal finalization) still
            // reaches the store.
            if failed {
                tokio::time::sleep(FLUSH_RETRY_DELAY).await;
                continue;
            }

            let mut dirty = self.dirty.lock();
            if dirty.flush_pending {
                dirty.flush_pending = false;
                continue;
            }
            dirty.flush_in_flight = false;
            dirty.deleted.clear();
            return;
        }
    }

    /// A queued job may start only when its user has a free slot and the job
    /// is within the first `free` entries of the dispatch order (first entry
    /// in serial mode). Jobs absent from the order are immediately
    /// dispatchable.
    fn can_start(&self, state: &SchedulerState, user_id: &str, job_id: &str) -> bool {
        let settings = state.settings_for(user_id);
        let cap = settings.slot_cap();
        let running = state.running.get(user_id).map_or(0, HashSet::len);
        let free = cap.saturating_sub(running);
        if free == 0 {
            return false;
        }
        match state.queue_position(user_id, job_id) {
            None => true,
            Some(position) => {
                position < if settings.parallel_enabled { free } else { 1 }
            }
        }
    }

    async fn run_job(
        inner: Arc<Self>,
        job_id: String,
        user_id: String,
        request: PipelineRequest,
        speaker_rx: Option<oneshot::Receiver<serde_json::Value>>,
    ) {
        // Admission: wait for a free slot while holding our place in the
        // user's dispatch order.
        loop {
            {
                let mut state = inner.state.lock();
                if !state.jobs.contains_key(&job_id) {
                    return; // deleted while queued
                }
                if inner.can_start(&state, &user_id, &job_id) {
                    if let Some(order) = state.queue_order.get_mut(&user_id) {
                        order.retain(|id| id != &job_id);
                    }
                    state
                        .running
                        .entry(user_id.clone())
                        .or_default()
                        .insert(job_id.clone());
                    if let Some(entry) = state.jobs.get_mut(&job_id) {
                        entry.job.status = JobStatus::Running;
                        entry.job.started_at = Some(Utc::now());
                    }
                    break;
                }
            }
            tokio::select! {
                _ = inner.slots_released.notified() => {}
                _ = tokio::time::sleep(inner.config.admission_poll_interval) => {}
            }
        }
        inner.mark_job_dirty(&job_id);
        inner.mark_queue_dirty(&user_id);
        inner.schedule_flush();
        info!(job_id = %job_id, user_id = %user_id, "job started");

        // Relay runner progress into the step log and live channel. The
        // relay drains after the runner returns, keeping event order intact.
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<StepEvent>();
        let relay = {
            let inner = inner.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move {
                while let Some(event) = progress_rx.recv().await {
                    inner.record_step(&job_id, event);
                }
            })
        };

        let handle = RunHandle::new(
            progress_tx,
            speaker_rx,
            inner.config.speaker_input_timeout,
        );
        let run_result = inner.runner.run(&request, &handle).await;
        drop(handle);
        let _ = relay.await;

        {
            let mut state = inner.state.lock();
            if let Some(entry) = state.jobs.get_mut(&job_id) {
                match run_result {
                    Ok(result) => {
                        entry.job.status = JobStatus::Completed;
                        match entry.job.result.as_mut() {
                            Some(existing) => existing.extend(result),
                            None => entry.job.result = Some(result),
                        }
                        // Fold the source reference into the note for later
                        // lookup.
                        if let Some(source) = request.source()
                            && entry.job.note.as_deref() != Some(source)
                        {
                            entry.job.note = Some(match entry.job.note.take() {
                                Some(note) if !note.contains(source) => {
                                    format!("{note}\n{source}")
                                }
                                Some(note) => note,
                                None => source.to_string(),
                            });
                        }
                        info!(job_id = %job_id, "job completed");
                    }
                    Err(e) => {
                        entry.job.status = JobStatus::Failed;
                        entry.job.error = Some(e.to_string());
                        error!(job_id = %job_id, "job failed: {e}");
                    }
                }
                entry.job.finished_at = Some(Utc::now());
                entry.speaker_tx = None;
                let _ = entry.events.send(JobEvent::Closed);
            }
            if let Some(running) = state.running.get_mut(&user_id) {
                running.remove(&job_id);
            }
            if let Some(order) = state.queue_order.get_mut(&user_id) {
                order.retain(|id| id != &job_id);
            }
        }
        inner.mark_job_dirty(&job_id);
        inner.mark_queue_dirty(&user_id);
        inner.schedule_flush();
        inner.slots_released.notify_waiters();
    }

    fn record_step(self: &Arc<Self>, job_id: &str, event: StepEvent) {
        {
            let mut state = self.state.lock();
            let Some(entry) = state.jobs.get_mut(job_id) else {
                return;
            };
            entry.job.steps.push(event.clone());
            let _ = entry.events.send(JobEvent::Step(event.clone()));
        }
        debug!(
            job_id = %job_id,
            step = %event.step,
            status = %event.status,
            message = %event.message,
            "pipeline step"
        );
        self.mark_job_dirty(job_id);
        self.schedule_flush();
    }
}

/// A subscriber's view of a job's step events: buffered history first, then
/// live tailing until the job reaches a terminal state.
pub struct JobEventStream {
    history: std::collections::VecDeque<StepEvent>,
    rx: broadcast::Receiver<JobEvent>,
    done: bool,
}

impl JobEventStream {
    /// Next step event, or `None` once the terminal sentinel has been
    /// observed.
    pub async fn next(&mut self) -> Option<StepEvent> {
        if let Some(event) = self.history.pop_front() {
            return Some(event);
        }
        if self.done {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(JobEvent::Step(event)) => return Some(event),
                Ok(JobEvent::Closed) => {
                    self.done = true;
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
                // A slow subscriber may drop intermediate events; history
                // is still intact in the job record.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }
}
