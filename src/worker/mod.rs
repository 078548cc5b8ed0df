//! Indexing worker
//!
//! Executes queued indexing tasks. A task waits for its fence payload, claims
//! the attempt, crawls under a `WorkerSupervisor`, and records the terminal
//! status before releasing the fence.
//!
//! # Components
//!
//! - `IndexingWorker`: runs one task end to end, and drains the task queue
//! - `WorkerSupervisor`: liveness renewal, hard timeout, and cooperative stop checks

mod runner;
mod supervisor;

pub use runner::{IndexingWorker, SinkFactory, SourceFactory, TaskOutcome};
pub use supervisor::WorkerSupervisor;

use crate::state::RunKey;
use serde::{Deserialize, Serialize};

/// Task name the scheduler sends and the worker handles
pub const INDEX_TASK_NAME: &str = "connector_indexing";

/// Arguments of an indexing task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexTaskArgs {
    pub attempt_id: i64,
    pub source_id: i64,
    pub generation_id: i64,
}

impl IndexTaskArgs {
    pub fn key(&self) -> RunKey {
        RunKey::new(self.source_id, self.generation_id)
    }
}
