//! Checkpoint blob storage
//!
//! Crawl checkpoints are opaque blobs kept outside the attempt database. The
//! attempt record only holds a pointer to the blob.
//!
//! # Components
//!
//! - `CheckpointStore`: put/get/delete of blobs by pointer
//! - `FileCheckpointStore`: one file per checkpoint under a directory
//! - `MemoryCheckpointStore`: in-process store for tests and single-process use
//! - `CheckpointLedger`: ties blobs to attempts and picks the checkpoint to resume from

mod ledger;
mod store;

pub use ledger::{CheckpointLedger, NO_PROGRESS_WINDOW};
pub use store::{FileCheckpointStore, MemoryCheckpointStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to write checkpoint {pointer}: {message}")]
    Write { pointer: String, message: String },

    #[error("Failed to read checkpoint {pointer}: {message}")]
    Read { pointer: String, message: String },

    #[error("Checkpoint is {size} bytes, over the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Checkpoint {pointer} is corrupt: {message}")]
    Corrupt { pointer: String, message: String },

    #[error("Invalid checkpoint pointer: {0}")]
    InvalidPointer(String),
}

pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

/// Blob storage for serialized checkpoints
pub trait CheckpointStore: Send + Sync {
    fn put(&self, pointer: &str, bytes: &[u8]) -> CheckpointResult<()>;

    /// Returns None if no blob exists under the pointer
    fn get(&self, pointer: &str) -> CheckpointResult<Option<Vec<u8>>>;

    /// Deleting a missing blob is not an error
    fn delete(&self, pointer: &str) -> CheckpointResult<()>;
}
