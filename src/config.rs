//! Engine configuration
//!
//! Defaults are tuned for a server process; every value can be overridden
//! from `ONTOLOGY_*` environment variables.

use std::time::Duration;

/// Tunables shared by the driver loop, lease manager, scheduler and tasks
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sleep between driver iterations when nothing is ready
    pub poll_interval: Duration,
    /// A lease is live while `now - heartbeat < lease_timeout`
    pub lease_timeout: Duration,
    /// Heartbeat renewal period; must be well under `lease_timeout`
    pub heartbeat_interval: Duration,
    /// Maximum tasks the scheduler runs at once
    pub max_concurrency: usize,
    /// Distinct values sampled per column during a table scan
    pub table_sample_limit: usize,
    /// Rows sampled by the value-overlap check during a column scan
    pub scan_sample_limit: usize,
    /// Rows sampled by the value-overlap check during a join test
    pub join_sample_limit: usize,
    /// Join tests at or above this confidence are accepted automatically
    pub auto_accept_threshold: f64,
    /// Join tests below this confidence are rejected automatically
    pub auto_reject_threshold: f64,
    /// Attempts per task beyond the first before the entity is failed
    pub task_max_retries: u32,
    /// Delay before a task retries a failed collaborator call
    pub task_retry_backoff: Duration,
    /// Bounded wait when stopping a background worker
    pub worker_stop_timeout: Duration,
    /// Minimum gap between task-queue snapshot writes
    pub task_queue_flush_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            lease_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            max_concurrency: 8,
            table_sample_limit: 20,
            scan_sample_limit: 100,
            join_sample_limit: 1000,
            auto_accept_threshold: 0.9,
            auto_reject_threshold: 0.3,
            task_max_retries: 2,
            task_retry_backoff: Duration::from_millis(500),
            worker_stop_timeout: Duration::from_secs(5),
            task_queue_flush_interval: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Load from environment variables (and `.env` if present), keeping
    /// defaults for anything unset
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();
        Self {
            poll_interval: env_millis("ONTOLOGY_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval),
            lease_timeout: env_secs("ONTOLOGY_LEASE_TIMEOUT_SECS").unwrap_or(defaults.lease_timeout),
            heartbeat_interval: env_secs("ONTOLOGY_HEARTBEAT_INTERVAL_SECS")
                .unwrap_or(defaults.heartbeat_interval),
            max_concurrency: env_parse("ONTOLOGY_MAX_CONCURRENCY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_concurrency),
            table_sample_limit: env_parse("ONTOLOGY_TABLE_SAMPLE_LIMIT")
                .unwrap_or(defaults.table_sample_limit),
            scan_sample_limit: env_parse("ONTOLOGY_SCAN_SAMPLE_LIMIT")
                .unwrap_or(defaults.scan_sample_limit),
            join_sample_limit: env_parse("ONTOLOGY_JOIN_SAMPLE_LIMIT")
                .unwrap_or(defaults.join_sample_limit),
            auto_accept_threshold: env_parse("ONTOLOGY_AUTO_ACCEPT_THRESHOLD")
                .unwrap_or(defaults.auto_accept_threshold),
            auto_reject_threshold: env_parse("ONTOLOGY_AUTO_REJECT_THRESHOLD")
                .unwrap_or(defaults.auto_reject_threshold),
            task_max_retries: env_parse("ONTOLOGY_TASK_MAX_RETRIES")
                .unwrap_or(defaults.task_max_retries),
            task_retry_backoff: env_millis("ONTOLOGY_TASK_RETRY_BACKOFF_MS")
                .unwrap_or(defaults.task_retry_backoff),
            worker_stop_timeout: env_millis("ONTOLOGY_WORKER_STOP_TIMEOUT_MS")
                .unwrap_or(defaults.worker_stop_timeout),
            task_queue_flush_interval: env_millis("ONTOLOGY_TASK_QUEUE_FLUSH_MS")
                .unwrap_or(defaults.task_queue_flush_interval),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
