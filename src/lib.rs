//! Fenceline: an incremental document-indexing orchestration engine
//!
//! This crate guarantees at most one active indexing run per (source, index generation)
//! across a fleet of worker processes, reconciles runs whose workers crashed, and lets a
//! long multi-stage crawl checkpoint its progress and resume where it was interrupted.

pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod control;
pub mod coordination;
pub mod crawler;
pub mod fence;
pub mod output;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod validator;
pub mod worker;

use thiserror::Error;

/// Main error type for Fenceline operations
#[derive(Debug, Error)]
pub enum FencelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Coordination cache error: {0}")]
    Cache(#[from] coordination::CacheError),

    #[error("Task queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),

    #[error("Crawl error: {0}")]
    Crawl(#[from] crawler::CrawlError),

    #[error("Source error: {0}")]
    Source(#[from] connector::SourceError),

    #[error("Sink error: {0}")]
    Sink(#[from] output::SinkError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown source '{0}'")]
    UnknownSource(String),

    #[error("Timed out waiting for fence payload on {key}")]
    FencePayloadTimeout { key: String },

    #[error("Fence {key} belongs to another run")]
    FenceMismatch { key: String },

    #[error("Liveness lost: {0}")]
    LivenessLost(String),

    #[error("Run aborted: {0}")]
    Aborted(String),

    #[error("Invalid task arguments: {0}")]
    InvalidTask(String),
}

impl FencelineError {
    /// Returns true if this error came from a failed checkpoint write
    ///
    /// The worker leaves the attempt record alone in this case and lets the
    /// validator's orphan detection resolve it.
    pub fn is_checkpoint_write_failure(&self) -> bool {
        matches!(
            self,
            Self::Checkpoint(checkpoint::CheckpointError::Write { .. })
        )
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown connector: {0}")]
    UnknownConnector(String),
}

/// Result type alias for Fenceline operations
pub type Result<T> = std::result::Result<T, FencelineError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use state::{AttemptStatus, GenerationStatus, RunKey, SourceStatus};
