use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Fenceline
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub coordination: CoordinationConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceEntry>,
    #[serde(default, rename = "generation")]
    pub generations: Vec<GenerationEntry>,
}

/// Coordination cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    /// Path to the SQLite file shared by every process as the coordination cache
    #[serde(rename = "cache-path")]
    pub cache_path: String,

    /// TTL of the liveness signal; must exceed the worst task hand-off latency
    #[serde(rename = "liveness-ttl-secs", default = "default_liveness_ttl")]
    pub liveness_ttl_secs: u64,

    /// TTL of the advisory locks around fence creation and validation
    #[serde(rename = "lock-timeout-secs", default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// TTL of the per-role heartbeat keys
    #[serde(rename = "heartbeat-ttl-secs", default = "default_heartbeat_ttl")]
    pub heartbeat_ttl_secs: u64,
}

impl CoordinationConfig {
    pub fn liveness_ttl(&self) -> Duration {
        Duration::from_secs(self.liveness_ttl_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }
}

/// Durable storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database holding sources and run attempts
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Directory of the file-backed checkpoint store
    #[serde(rename = "checkpoint-dir")]
    pub checkpoint_dir: String,

    /// Ceiling on a serialized checkpoint, in bytes
    #[serde(rename = "checkpoint-size-limit", default = "default_checkpoint_limit")]
    pub checkpoint_size_limit: usize,

    /// Checkpoints of attempts older than this are deleted
    #[serde(rename = "checkpoint-retention-days", default = "default_retention_days")]
    pub checkpoint_retention_days: u32,
}

/// Task queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Path to the SQLite database used as the task broker
    #[serde(rename = "database-path", default = "default_queue_path")]
    pub database_path: String,

    /// Queue indexing tasks are sent to
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Reserved tasks older than this are handed out again
    #[serde(rename = "visibility-timeout-secs", default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: default_queue_path(),
            name: default_queue_name(),
            visibility_timeout_secs: default_visibility_timeout(),
        }
    }
}

/// Run scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduling passes
    #[serde(rename = "beat-interval-secs", default = "default_beat_interval")]
    pub beat_interval_secs: u64,

    /// Consecutive failed attempts before a source enters repeated-error mode
    #[serde(rename = "repeated-error-threshold", default = "default_error_threshold")]
    pub repeated_error_threshold: usize,

    /// Overlap subtracted from the last successful window end
    #[serde(rename = "poll-offset-minutes", default = "default_poll_offset")]
    pub poll_offset_minutes: i64,

    /// Skip refresh runs against the present generation while a future one builds
    #[serde(rename = "disable-update-on-swap", default)]
    pub disable_update_on_swap: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            beat_interval_secs: default_beat_interval(),
            repeated_error_threshold: default_error_threshold(),
            poll_offset_minutes: default_poll_offset(),
            disable_update_on_swap: false,
        }
    }
}

/// Run validator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    /// Seconds between validation sweeps
    #[serde(rename = "interval-secs", default = "default_validator_interval")]
    pub interval_secs: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_validator_interval(),
        }
    }
}

/// Indexing worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent sub-workers for partitionable stages
    #[serde(rename = "max-crawl-workers", default = "default_crawl_workers")]
    pub max_crawl_workers: usize,

    /// Items yielded between checkpoint persists
    #[serde(rename = "checkpoint-every", default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    /// How long the task waits for the scheduler to fill the fence payload
    #[serde(rename = "fence-wait-timeout-secs", default = "default_fence_wait")]
    pub fence_wait_timeout_secs: u64,

    /// Wall-clock limit for one attempt
    #[serde(rename = "hard-timeout-secs", default = "default_hard_timeout")]
    pub hard_timeout_secs: u64,

    /// Scoped failures tolerated before the failure ratio is checked
    #[serde(rename = "failure-threshold", default = "default_failure_threshold")]
    pub failure_threshold: u64,

    /// Ratio of failures to processed items that aborts a run
    #[serde(rename = "failure-ratio", default = "default_failure_ratio")]
    pub failure_ratio: f64,

    /// Directory receiving the JSONL document output
    #[serde(rename = "output-dir", default = "default_output_dir")]
    pub output_dir: String,

    #[serde(rename = "retry-max-attempts", default = "default_retry_attempts")]
    pub retry_max_attempts: u32,

    #[serde(rename = "retry-base-delay-ms", default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(rename = "retry-max-delay-ms", default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_crawl_workers: default_crawl_workers(),
            checkpoint_every: default_checkpoint_every(),
            fence_wait_timeout_secs: default_fence_wait(),
            hard_timeout_secs: default_hard_timeout(),
            failure_threshold: default_failure_threshold(),
            failure_ratio: default_failure_ratio(),
            output_dir: default_output_dir(),
            retry_max_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

/// A data source to keep indexed
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    /// Human-readable name, unique per config
    pub name: String,

    /// Connector implementation (e.g., "directory")
    pub connector: String,

    /// Credential identifier; with the connector it forms the source identity
    pub credential: String,

    /// Root the connector crawls
    pub root: String,

    /// Seconds between refresh runs; absent means index once
    #[serde(rename = "refresh-freq-secs")]
    pub refresh_freq_secs: Option<u64>,

    #[serde(default)]
    pub paused: bool,
}

/// A downstream index generation
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationEntry {
    pub id: i64,

    /// "present", "future" or "past"
    pub status: String,
}

fn default_liveness_ttl() -> u64 {
    300
}

fn default_lock_timeout() -> u64 {
    30
}

fn default_heartbeat_ttl() -> u64 {
    600
}

fn default_checkpoint_limit() -> usize {
    200 * 1024 * 1024
}

fn default_retention_days() -> u32 {
    7
}

fn default_queue_path() -> String {
    "./fenceline-queue.db".to_string()
}

fn default_queue_name() -> String {
    "connector_indexing".to_string()
}

fn default_visibility_timeout() -> u64 {
    6 * 60 * 60
}

fn default_beat_interval() -> u64 {
    15
}

fn default_error_threshold() -> usize {
    5
}

fn default_poll_offset() -> i64 {
    5
}

fn default_validator_interval() -> u64 {
    60
}

fn default_crawl_workers() -> usize {
    4
}

fn default_checkpoint_every() -> usize {
    10
}

fn default_fence_wait() -> u64 {
    60
}

fn default_hard_timeout() -> u64 {
    6 * 60 * 60
}

fn default_failure_threshold() -> u64 {
    3
}

fn default_failure_ratio() -> f64 {
    0.1
}

fn default_output_dir() -> String {
    "./output".to_string()
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay() -> u64 {
    200
}

fn default_retry_max_delay() -> u64 {
    30_000
}
