//! Storage module for durable run attempt records
//!
//! This module handles all database operations shared by the scheduler, validator,
//! and workers, including:
//! - SQLite database initialization and schema management
//! - Source and index generation records
//! - Run attempt lifecycle, poll windows, and checkpoint pointers
//! - Scoped failure records

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{AttemptStore, StorageError, StorageResult};

use crate::state::{
    AttemptStatus, GenerationStatus, IndexingTrigger, RunKey, SourceStatus,
};
use crate::FencelineError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Storage handle shared between the components of one process
pub type SharedStorage = Arc<Mutex<SqliteStorage>>;

/// Opens a storage database and wraps it for sharing
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SharedStorage)` - Successfully initialized storage
/// * `Err(FencelineError)` - Failed to initialize storage
pub fn open_shared(path: &Path) -> Result<SharedStorage, FencelineError> {
    Ok(Arc::new(Mutex::new(SqliteStorage::new(path)?)))
}

/// Configured shape of a source, as synced from the config file
#[derive(Debug, Clone)]
pub struct SourceDefinition {
    pub name: String,
    pub connector_id: String,
    pub credential_id: String,
    pub root: String,
    pub refresh_freq_secs: Option<i64>,
    pub paused: bool,
}

/// Represents a source in the database
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub id: i64,
    pub name: String,
    pub connector_id: String,
    pub credential_id: String,
    pub root: String,
    pub status: SourceStatus,
    pub refresh_freq_secs: Option<i64>,
    pub indexing_trigger: Option<IndexingTrigger>,
    pub in_repeated_error_state: bool,
    pub created_at: DateTime<Utc>,
}

/// Represents an index generation in the database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationRecord {
    pub id: i64,
    pub status: GenerationStatus,
}

/// Represents a run attempt in the database
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub id: i64,
    pub source_id: i64,
    pub generation_id: i64,
    pub status: AttemptStatus,
    pub from_beginning: bool,
    pub task_id: Option<String>,
    pub poll_range_start: Option<DateTime<Utc>>,
    pub poll_range_end: Option<DateTime<Utc>>,
    pub checkpoint_pointer: Option<String>,
    pub error_msg: Option<String>,
    pub total_docs_indexed: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AttemptRecord {
    pub fn key(&self) -> RunKey {
        RunKey::new(self.source_id, self.generation_id)
    }

    /// Returns the poll window if both ends were recorded
    pub fn poll_window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.poll_range_start?, self.poll_range_end?))
    }
}

/// A scoped failure to be recorded against an attempt
///
/// Exactly one of `document_id` and `entity_id` is expected to be set.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub document_id: Option<String>,
    pub document_link: Option<String>,
    pub entity_id: Option<String>,
    pub missed_range: Option<(f64, f64)>,
    pub message: String,
}

/// Represents a recorded scoped failure
#[derive(Debug, Clone)]
pub struct AttemptErrorRecord {
    pub id: i64,
    pub attempt_id: i64,
    pub source_id: i64,
    pub failure: FailureRecord,
    pub created_at: DateTime<Utc>,
}
