//! Task queue trait, message types, and error types

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors that can occur talking to the task broker
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task {0} already exists")]
    DuplicateTask(String),

    #[error("Unknown priority value {0}")]
    UnknownPriority(i64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Delivery priority; lower values are delivered first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl TaskPriority {
    pub fn to_db_value(&self) -> i64 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    pub fn from_db_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::High),
            1 => Some(Self::Medium),
            2 => Some(Self::Low),
            _ => None,
        }
    }
}

/// Returned by `send`; identifies the queued task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: String,
}

/// A task as delivered to a worker
#[derive(Debug, Clone)]
pub struct TaskMessage {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
    pub queue: String,
    pub priority: TaskPriority,
    pub enqueued_at: DateTime<Utc>,
    /// Number of times this task has been reserved, including this delivery
    pub delivery_count: u32,
}

/// Work distribution contract used by the scheduler and validator
pub trait TaskQueue: Send + Sync {
    /// Queues a task
    ///
    /// # Arguments
    ///
    /// * `name` - Task handler name
    /// * `args` - JSON arguments passed to the handler
    /// * `queue` - Queue the task is routed to
    /// * `priority` - Delivery priority within the queue
    /// * `explicit_id` - Task id to use instead of a generated one
    fn send(
        &self,
        name: &str,
        args: &serde_json::Value,
        queue: &str,
        priority: TaskPriority,
        explicit_id: Option<&str>,
    ) -> QueueResult<TaskHandle>;

    /// Ids of tasks in `queue` not yet handed to a worker
    fn list_pending(&self, queue: &str) -> QueueResult<BTreeSet<String>>;

    /// Ids of tasks handed to a worker and not yet acknowledged
    fn list_reserved(&self) -> QueueResult<BTreeSet<String>>;

    /// Removes a task that has not been handed to a worker yet
    ///
    /// Returns false if the task is unknown or already reserved.
    fn revoke(&self, task_id: &str) -> QueueResult<bool>;
}
