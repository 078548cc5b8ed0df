//! Task queue used to hand indexing runs to exactly one worker
//!
//! Delivery is at-least-once: a reserved task whose worker disappears is handed out
//! again after the visibility timeout, so task handlers must be idempotent.

mod sqlite;
mod traits;

pub use sqlite::SqliteTaskQueue;
pub use traits::{QueueError, QueueResult, TaskHandle, TaskMessage, TaskPriority, TaskQueue};
