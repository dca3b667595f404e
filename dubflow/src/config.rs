//! Runtime configuration loaded from the environment.

use std::time::Duration;

use crate::{Error, Result};

/// Default SQLite database URL.
const DEFAULT_DATABASE_URL: &str = "sqlite:dubflow.db?mode=rwc";

/// Default admission re-check interval in milliseconds.
const DEFAULT_ADMISSION_POLL_MS: u64 = 500;

/// Default capacity of a job's live event channel.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Per-user cap on jobs in `queued` or `running` state.
    pub max_queued: usize,
    /// Bounded re-check interval for the admission wait loop.
    pub admission_poll_interval: Duration,
    /// Optional timeout for the manual speaker-input wait. `None` preserves
    /// the indefinite wait; crash recovery still fails the job on restart.
    pub speaker_input_timeout: Option<Duration>,
    /// Capacity of the per-job live event channel.
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queued: 10,
            admission_poll_interval: Duration::from_millis(DEFAULT_ADMISSION_POLL_MS),
            speaker_input_timeout: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite connection URL.
    pub database_url: String,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset. Malformed values are an error rather
    /// than a silent fallback.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url =
            get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let mut scheduler = SchedulerConfig::default();
        if let Some(raw) = get("DUBFLOW_MAX_QUEUED") {
            scheduler.max_queued = parse_positive("DUBFLOW_MAX_QUEUED", &raw)? as usize;
        }
        if let Some(raw) = get("DUBFLOW_ADMISSION_POLL_MS") {
            scheduler.admission_poll_interval =
                Duration::from_millis(parse_positive("DUBFLOW_ADMISSION_POLL_MS", &raw)?);
        }
        if let Some(raw) = get("DUBFLOW_SPEAKER_TIMEOUT_SECS") {
            scheduler.speaker_input_timeout =
                Some(Duration::from_secs(parse_positive("DUBFLOW_SPEAKER_TIMEOUT_SECS", &raw)?));
        }

        Ok(Self {
            database_url,
            scheduler,
        })
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(Error::config(format!(
            "{key} must be a positive integer, got '{raw}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.scheduler.max_queued, 10);
        assert_eq!(
            config.scheduler.admission_poll_interval,
            Duration::from_millis(DEFAULT_ADMISSION_POLL_MS)
        );
        assert!(config.scheduler.speaker_input_timeout.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite:other.db?mode=rwc"),
            ("DUBFLOW_MAX_QUEUED", "4"),
            ("DUBFLOW_ADMISSION_POLL_MS", "50"),
            ("DUBFLOW_SPEAKER_TIMEOUT_SECS", "600"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "sqlite:other.db?mode=rwc");
        assert_eq!(config.scheduler.max_queued, 4);
        assert_eq!(
            config.scheduler.admission_poll_interval,
            Duration::from_millis(50)
        );
        assert_eq!(
            config.scheduler.speaker_input_timeout,
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn malformed_values_are_rejected() {
        let result = AppConfig::from_lookup(lookup(&[("DUBFLOW_MAX_QUEUED", "lots")]));
        assert!(matches!(result, Err(Error::Configuration(_))));

        let result = AppConfig::from_lookup(lookup(&[("DUBFLOW_ADMISSION_POLL_MS", "0")]));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
