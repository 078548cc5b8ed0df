//! SQLite-backed task broker

use crate::queue::traits::{
    QueueError, QueueResult, TaskHandle, TaskMessage, TaskPriority, TaskQueue,
};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

const QUEUE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    args TEXT NOT NULL,
    queue TEXT NOT NULL,
    priority INTEGER NOT NULL,
    state TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    reserved_at INTEGER,
    reserved_by TEXT,
    delivery_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_tasks_pending ON tasks(queue, state, priority, seq);
"#;

const STATE_PENDING: &str = "pending";
const STATE_RESERVED: &str = "reserved";

/// Task broker stored in a shared SQLite file
///
/// Tasks are `pending` until a worker reserves one, `reserved` until it is
/// acknowledged, and deleted on acknowledgement.
pub struct SqliteTaskQueue {
    conn: Mutex<Connection>,
}

impl SqliteTaskQueue {
    pub fn open(path: &Path) -> QueueResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(QUEUE_SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> QueueResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(QUEUE_SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Reserves the highest-priority, oldest pending task in `queue`
    ///
    /// # Returns
    ///
    /// * `Ok(Some(TaskMessage))` - The task now reserved by `worker_id`
    /// * `Ok(None)` - Nothing is pending
    pub fn reserve_next(&self, queue: &str, worker_id: &str) -> QueueResult<Option<TaskMessage>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = tx
            .query_row(
                "SELECT seq, id, name, args, priority, enqueued_at, delivery_count FROM tasks \
                 WHERE queue = ?1 AND state = ?2 ORDER BY priority, seq LIMIT 1",
                params![queue, STATE_PENDING],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((seq, id, name, args, priority, enqueued_at, delivery_count)) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE tasks SET state = ?1, reserved_at = ?2, reserved_by = ?3, \
             delivery_count = delivery_count + 1 WHERE seq = ?4",
            params![STATE_RESERVED, Utc::now().timestamp_millis(), worker_id, seq],
        )?;
        tx.commit()?;

        Ok(Some(TaskMessage {
            id,
            name,
            args: serde_json::from_str(&args)?,
            queue: queue.to_string(),
            priority: TaskPriority::from_db_value(priority)
                .ok_or(QueueError::UnknownPriority(priority))?,
            enqueued_at: Utc
                .timestamp_millis_opt(enqueued_at)
                .single()
                .unwrap_or_else(Utc::now),
            delivery_count: delivery_count as u32 + 1,
        }))
    }

    /// Acknowledges a reserved task, removing it from the broker
    pub fn ack(&self, task_id: &str) -> QueueResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
        Ok(changed == 1)
    }

    /// Returns reservations older than `visibility_timeout` to the pending state
    ///
    /// # Returns
    ///
    /// * `Ok(usize)` - Number of tasks made deliverable again
    pub fn reclaim_stale(&self, visibility_timeout: Duration) -> QueueResult<usize> {
        let cutoff = Utc::now().timestamp_millis() - visibility_timeout.as_millis() as i64;
        let conn = self.conn.lock();
        let reclaimed = conn.execute(
            "UPDATE tasks SET state = ?1, reserved_at = NULL, reserved_by = NULL \
             WHERE state = ?2 AND reserved_at < ?3",
            params![STATE_PENDING, STATE_RESERVED, cutoff],
        )?;
        Ok(reclaimed)
    }

    fn ids_where(&self, sql: &str, params: impl rusqlite::Params) -> QueueResult<BTreeSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map(params, |row| row.get(0))?
            .collect::<Result<BTreeSet<String>, _>>()?;
        Ok(ids)
    }
}

impl TaskQueue for SqliteTaskQueue {
    fn send(
        &self,
        name: &str,
        args: &serde_json::Value,
        queue: &str,
        priority: TaskPriority,
        explicit_id: Option<&str>,
    ) -> QueueResult<TaskHandle> {
        let id = explicit_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let args = serde_json::to_string(args)?;

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO tasks (id, name, args, queue, priority, state, enqueued_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                name,
                args,
                queue,
                priority.to_db_value(),
                STATE_PENDING,
                Utc::now().timestamp_millis()
            ],
        );

        match result {
            Ok(_) => Ok(TaskHandle { id }),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(QueueError::DuplicateTask(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_pending(&self, queue: &str) -> QueueResult<BTreeSet<String>> {
        self.ids_where(
            "SELECT id FROM tasks WHERE queue = ?1 AND state = ?2",
            params![queue, STATE_PENDING],
        )
    }

    fn list_reserved(&self) -> QueueResult<BTreeSet<String>> {
        self.ids_where(
            "SELECT id FROM tasks WHERE state = ?1",
            params![STATE_RESERVED],
        )
    }

    fn revoke(&self, task_id: &str) -> QueueResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM tasks WHERE id = ?1 AND state = ?2",
            params![task_id, STATE_PENDING],
        )?;
        Ok(changed == 1)
    }
}
