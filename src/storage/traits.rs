//! Storage traits and error types
//!
//! This module defines the trait interface for the durable attempt record store and
//! associated error types.

use crate::state::{AttemptStatus, GenerationStatus, IndexingTrigger, RunKey, SourceStatus};
use crate::storage::{
    AttemptErrorRecord, AttemptRecord, FailureRecord, GenerationRecord, SourceDefinition,
    SourceRecord,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Source not found: {0}")]
    SourceNotFound(i64),

    #[error("Generation not found: {0}")]
    GenerationNotFound(i64),

    #[error("Attempt not found: {0}")]
    AttemptNotFound(i64),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for the durable attempt record store
///
/// Run attempts are created by the scheduler, moved through their lifecycle by the
/// fence holder, and failed by the validator when their fence is orphaned.
pub trait AttemptStore {
    // ===== Sources =====

    /// Inserts a source or updates the mutable fields of an existing one
    ///
    /// Sources are matched on (connector, credential). A paused definition pauses the
    /// source; an unpaused one re-activates a paused source.
    ///
    /// # Returns
    ///
    /// * `Ok(i64)` - The source id
    fn upsert_source(&mut self, definition: &SourceDefinition) -> StorageResult<i64>;

    fn get_source(&self, source_id: i64) -> StorageResult<SourceRecord>;

    fn get_source_by_name(&self, name: &str) -> StorageResult<Option<SourceRecord>>;

    fn list_sources(&self) -> StorageResult<Vec<SourceRecord>>;

    fn set_source_status(&mut self, source_id: i64, status: SourceStatus) -> StorageResult<()>;

    /// Sets or clears the operator's manual trigger
    fn set_indexing_trigger(
        &mut self,
        source_id: i64,
        trigger: Option<IndexingTrigger>,
    ) -> StorageResult<()>;

    fn set_repeated_error_state(&mut self, source_id: i64, in_error: bool) -> StorageResult<()>;

    // ===== Generations =====

    fn upsert_generation(&mut self, generation_id: i64, status: GenerationStatus)
        -> StorageResult<()>;

    fn get_generation(&self, generation_id: i64) -> StorageResult<GenerationRecord>;

    /// Returns the present and future generations
    fn list_live_generations(&self) -> StorageResult<Vec<GenerationRecord>>;

    // ===== Attempts =====

    /// Creates a NOT_STARTED attempt
    fn create_attempt(&mut self, key: RunKey, from_beginning: bool) -> StorageResult<i64>;

    /// Deletes an attempt that never got queued work
    fn delete_attempt(&mut self, attempt_id: i64) -> StorageResult<()>;

    fn get_attempt(&self, attempt_id: i64) -> StorageResult<AttemptRecord>;

    fn set_attempt_task_id(&mut self, attempt_id: i64, task_id: &str) -> StorageResult<()>;

    /// Returns up to `limit` attempts for the key, newest first
    fn get_recent_attempts(&self, key: RunKey, limit: usize) -> StorageResult<Vec<AttemptRecord>>;

    /// Returns the newest attempt for the key
    fn get_last_attempt(&self, key: RunKey) -> StorageResult<Option<AttemptRecord>> {
        Ok(self.get_recent_attempts(key, 1)?.into_iter().next())
    }

    /// Returns the newest SUCCESS or PARTIALLY_SUCCEEDED attempt with a poll window
    fn get_last_successful_attempt(&self, key: RunKey) -> StorageResult<Option<AttemptRecord>>;

    fn list_attempts_by_status(&self, statuses: &[AttemptStatus])
        -> StorageResult<Vec<AttemptRecord>>;

    /// Moves an attempt from NOT_STARTED to IN_PROGRESS
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The attempt was NOT_STARTED and is now IN_PROGRESS
    /// * `Ok(false)` - The attempt was in any other state and is unchanged
    fn mark_attempt_in_progress(&mut self, attempt_id: i64) -> StorageResult<bool>;

    fn set_poll_window(
        &mut self,
        attempt_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<()>;

    fn set_checkpoint_pointer(&mut self, attempt_id: i64, pointer: Option<&str>)
        -> StorageResult<()>;

    fn update_attempt_progress(
        &mut self,
        attempt_id: i64,
        total_docs_indexed: u64,
        failure_count: u64,
    ) -> StorageResult<()>;

    /// Moves an active attempt to a terminal status
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The attempt was active and now carries `status`
    /// * `Ok(false)` - The attempt was already terminal and is unchanged
    fn finish_attempt(
        &mut self,
        attempt_id: i64,
        status: AttemptStatus,
        error_msg: Option<&str>,
    ) -> StorageResult<bool>;

    /// Returns attempts created before `cutoff` that still point at a checkpoint
    fn attempts_with_checkpoints_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Vec<AttemptRecord>>;

    fn count_attempts_by_status(&self) -> StorageResult<HashMap<AttemptStatus, u64>>;

    // ===== Attempt Errors =====

    fn record_attempt_error(
        &mut self,
        attempt_id: i64,
        source_id: i64,
        failure: &FailureRecord,
    ) -> StorageResult<i64>;

    fn get_attempt_errors(&self, attempt_id: i64) -> StorageResult<Vec<AttemptErrorRecord>>;

    /// Returns the newest recorded failures across all attempts
    fn get_recent_errors(&self, limit: usize) -> StorageResult<Vec<AttemptErrorRecord>>;
}
