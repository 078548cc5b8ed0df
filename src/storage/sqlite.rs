//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the AttemptStore trait.

use crate::state::{AttemptStatus, GenerationStatus, IndexingTrigger, RunKey, SourceStatus};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{AttemptStore, StorageError, StorageResult};
use crate::storage::{
    AttemptErrorRecord, AttemptRecord, FailureRecord, GenerationRecord, SourceDefinition,
    SourceRecord,
};
use crate::FencelineError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const SOURCE_COLUMNS: &str = "id, name, connector_id, credential_id, root, status, \
     refresh_freq_secs, indexing_trigger, in_repeated_error_state, created_at";

const ATTEMPT_COLUMNS: &str = "id, source_id, generation_id, status, from_beginning, task_id, \
     poll_range_start, poll_range_end, checkpoint_pointer, error_msg, total_docs_indexed, \
     failure_count, created_at, started_at, updated_at, finished_at";

const ERROR_COLUMNS: &str = "id, attempt_id, source_id, document_id, document_link, entity_id, \
     missed_start, missed_end, failure_message, created_at";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// Several processes open the same file, so writers wait on a busy lock rather
    /// than failing immediately.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(FencelineError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, FencelineError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> Result<Self, FencelineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    fn has_successful_attempt(&self, source_id: i64) -> StorageResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM attempts WHERE source_id = ?1 AND status IN (?2, ?3)",
            params![
                source_id,
                AttemptStatus::Success.to_db_string(),
                AttemptStatus::PartiallySucceeded.to_db_string()
            ],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn query_attempts<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> StorageResult<Vec<AttemptRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let attempts = stmt
            .query_map(params, row_to_attempt)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(attempts)
    }

    fn query_errors<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> StorageResult<Vec<AttemptErrorRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let errors = stmt
            .query_map(params, row_to_error)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(errors)
    }
}

impl AttemptStore for SqliteStorage {
    // ===== Sources =====

    fn upsert_source(&mut self, definition: &SourceDefinition) -> StorageResult<i64> {
        let existing: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, status FROM sources WHERE connector_id = ?1 AND credential_id = ?2",
                params![definition.connector_id, definition.credential_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((source_id, current)) = existing else {
            let status = if definition.paused {
                SourceStatus::Paused
            } else {
                SourceStatus::InitialIndexing
            };
            self.conn.execute(
                "INSERT INTO sources (name, connector_id, credential_id, root, status, \
                 refresh_freq_secs, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    definition.name,
                    definition.connector_id,
                    definition.credential_id,
                    definition.root,
                    status.to_db_string(),
                    definition.refresh_freq_secs,
                    format_ts(&Utc::now()),
                ],
            )?;
            return Ok(self.conn.last_insert_rowid());
        };

        let current = SourceStatus::from_db_string(&current).unwrap_or(SourceStatus::Active);
        let status = match (definition.paused, current) {
            (true, SourceStatus::Deleting) => SourceStatus::Deleting,
            (true, _) => SourceStatus::Paused,
            (false, SourceStatus::Paused) => {
                if self.has_successful_attempt(source_id)? {
                    SourceStatus::Active
                } else {
                    SourceStatus::InitialIndexing
                }
            }
            (false, other) => other,
        };

        self.conn.execute(
            "UPDATE sources SET name = ?1, root = ?2, refresh_freq_secs = ?3, status = ?4 \
             WHERE id = ?5",
            params![
                definition.name,
                definition.root,
                definition.refresh_freq_secs,
                status.to_db_string(),
                source_id
            ],
        )?;
        Ok(source_id)
    }

    fn get_source(&self, source_id: i64) -> StorageResult<SourceRecord> {
        self.conn
            .query_row(
                &format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?1"),
                params![source_id],
                row_to_source,
            )
            .optional()?
            .ok_or(StorageError::SourceNotFound(source_id))
    }

    fn get_source_by_name(&self, name: &str) -> StorageResult<Option<SourceRecord>> {
        let source = self
            .conn
            .query_row(
                &format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE name = ?1"),
                params![name],
                row_to_source,
            )
            .optional()?;
        Ok(source)
    }

    fn list_sources(&self) -> StorageResult<Vec<SourceRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY id"))?;
        let sources = stmt
            .query_map([], row_to_source)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    fn set_source_status(&mut self, source_id: i64, status: SourceStatus) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE sources SET status = ?1 WHERE id = ?2",
            params![status.to_db_string(), source_id],
        )?;
        if changed == 0 {
            return Err(StorageError::SourceNotFound(source_id));
        }
        Ok(())
    }

    fn set_indexing_trigger(
        &mut self,
        source_id: i64,
        trigger: Option<IndexingTrigger>,
    ) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE sources SET indexing_trigger = ?1 WHERE id = ?2",
            params![trigger.map(|t| t.to_db_string()), source_id],
        )?;
        if changed == 0 {
            return Err(StorageError::SourceNotFound(source_id));
        }
        Ok(())
    }

    fn set_repeated_error_state(&mut self, source_id: i64, in_error: bool) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE sources SET in_repeated_error_state = ?1 WHERE id = ?2",
            params![in_error, source_id],
        )?;
        Ok(())
    }

    // ===== Generations =====

    fn upsert_generation(
        &mut self,
        generation_id: i64,
        status: GenerationStatus,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO generations (id, status, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status",
            params![generation_id, status.to_db_string(), format_ts(&Utc::now())],
        )?;
        Ok(())
    }

    fn get_generation(&self, generation_id: i64) -> StorageResult<GenerationRecord> {
        self.conn
            .query_row(
                "SELECT id, status FROM generations WHERE id = ?1",
                params![generation_id],
                row_to_generation,
            )
            .optional()?
            .ok_or(StorageError::GenerationNotFound(generation_id))
    }

    fn list_live_generations(&self) -> StorageResult<Vec<GenerationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, status FROM generations WHERE status IN (?1, ?2) ORDER BY id",
        )?;
        let generations = stmt
            .query_map(
                params![
                    GenerationStatus::Present.to_db_string(),
                    GenerationStatus::Future.to_db_string()
                ],
                row_to_generation,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(generations)
    }

    // ===== Attempts =====

    fn create_attempt(&mut self, key: RunKey, from_beginning: bool) -> StorageResult<i64> {
        let now = format_ts(&Utc::now());
        self.conn.execute(
            "INSERT INTO attempts (source_id, generation_id, status, from_beginning, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                key.source_id,
                key.generation_id,
                AttemptStatus::NotStarted.to_db_string(),
                from_beginning,
                now
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn delete_attempt(&mut self, attempt_id: i64) -> StorageResult<()> {
        self.conn
            .execute("DELETE FROM attempts WHERE id = ?1", params![attempt_id])?;
        Ok(())
    }

    fn get_attempt(&self, attempt_id: i64) -> StorageResult<AttemptRecord> {
        self.conn
            .query_row(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE id = ?1"),
                params![attempt_id],
                row_to_attempt,
            )
            .optional()?
            .ok_or(StorageError::AttemptNotFound(attempt_id))
    }

    fn set_attempt_task_id(&mut self, attempt_id: i64, task_id: &str) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE attempts SET task_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![task_id, format_ts(&Utc::now()), attempt_id],
        )?;
        Ok(())
    }

    fn get_recent_attempts(&self, key: RunKey, limit: usize) -> StorageResult<Vec<AttemptRecord>> {
        self.query_attempts(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM attempts \
                 WHERE source_id = ?1 AND generation_id = ?2 ORDER BY id DESC LIMIT ?3"
            ),
            params![key.source_id, key.generation_id, limit as i64],
        )
    }

    fn get_last_successful_attempt(&self, key: RunKey) -> StorageResult<Option<AttemptRecord>> {
        let attempts = self.query_attempts(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM attempts \
                 WHERE source_id = ?1 AND generation_id = ?2 AND status IN (?3, ?4) \
                 AND poll_range_end IS NOT NULL ORDER BY id DESC LIMIT 1"
            ),
            params![
                key.source_id,
                key.generation_id,
                AttemptStatus::Success.to_db_string(),
                AttemptStatus::PartiallySucceeded.to_db_string()
            ],
        )?;
        Ok(attempts.into_iter().next())
    }

    fn list_attempts_by_status(
        &self,
        statuses: &[AttemptStatus],
    ) -> StorageResult<Vec<AttemptRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        self.query_attempts(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE status IN ({placeholders}) \
                 ORDER BY id"
            ),
            params_from_iter(statuses.iter().map(|s| s.to_db_string())),
        )
    }

    fn mark_attempt_in_progress(&mut self, attempt_id: i64) -> StorageResult<bool> {
        let now = format_ts(&Utc::now());
        let changed = self.conn.execute(
            "UPDATE attempts SET status = ?1, started_at = ?2, updated_at = ?2 \
             WHERE id = ?3 AND status = ?4",
            params![
                AttemptStatus::InProgress.to_db_string(),
                now,
                attempt_id,
                AttemptStatus::NotStarted.to_db_string()
            ],
        )?;
        if changed == 0 {
            // Distinguish "wrong state" from "no such attempt"
            self.get_attempt(attempt_id)?;
        }
        Ok(changed > 0)
    }

    fn set_poll_window(
        &mut self,
        attempt_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE attempts SET poll_range_start = ?1, poll_range_end = ?2, updated_at = ?3 \
             WHERE id = ?4",
            params![
                format_ts(&start),
                format_ts(&end),
                format_ts(&Utc::now()),
                attempt_id
            ],
        )?;
        Ok(())
    }

    fn set_checkpoint_pointer(
        &mut self,
        attempt_id: i64,
        pointer: Option<&str>,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE attempts SET checkpoint_pointer = ?1, updated_at = ?2 WHERE id = ?3",
            params![pointer, format_ts(&Utc::now()), attempt_id],
        )?;
        Ok(())
    }

    fn update_attempt_progress(
        &mut self,
        attempt_id: i64,
        total_docs_indexed: u64,
        failure_count: u64,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE attempts SET total_docs_indexed = ?1, failure_count = ?2, updated_at = ?3 \
             WHERE id = ?4",
            params![
                total_docs_indexed as i64,
                failure_count as i64,
                format_ts(&Utc::now()),
                attempt_id
            ],
        )?;
        Ok(())
    }

    fn finish_attempt(
        &mut self,
        attempt_id: i64,
        status: AttemptStatus,
        error_msg: Option<&str>,
    ) -> StorageResult<bool> {
        let now = format_ts(&Utc::now());
        let changed = self.conn.execute(
            "UPDATE attempts SET status = ?1, error_msg = ?2, finished_at = ?3, updated_at = ?3 \
             WHERE id = ?4 AND status IN (?5, ?6)",
            params![
                status.to_db_string(),
                error_msg,
                now,
                attempt_id,
                AttemptStatus::NotStarted.to_db_string(),
                AttemptStatus::InProgress.to_db_string()
            ],
        )?;
        if changed == 0 {
            self.get_attempt(attempt_id)?;
        }
        Ok(changed > 0)
    }

    fn attempts_with_checkpoints_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Vec<AttemptRecord>> {
        self.query_attempts(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM attempts \
                 WHERE checkpoint_pointer IS NOT NULL AND created_at < ?1 ORDER BY id"
            ),
            params![format_ts(&cutoff)],
        )
    }

    fn count_attempts_by_status(&self) -> StorageResult<HashMap<AttemptStatus, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM attempts GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            if let Some(status) = AttemptStatus::from_db_string(&status) {
                counts.insert(status, count as u64);
            }
        }
        Ok(counts)
    }

    // ===== Attempt Errors =====

    fn record_attempt_error(
        &mut self,
        attempt_id: i64,
        source_id: i64,
        failure: &FailureRecord,
    ) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO attempt_errors (attempt_id, source_id, document_id, document_link, \
             entity_id, missed_start, missed_end, failure_message, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                attempt_id,
                source_id,
                failure.document_id,
                failure.document_link,
                failure.entity_id,
                failure.missed_range.map(|(start, _)| start),
                failure.missed_range.map(|(_, end)| end),
                failure.message,
                format_ts(&Utc::now()),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_attempt_errors(&self, attempt_id: i64) -> StorageResult<Vec<AttemptErrorRecord>> {
        self.query_errors(
            &format!("SELECT {ERROR_COLUMNS} FROM attempt_errors WHERE attempt_id = ?1 ORDER BY id"),
            params![attempt_id],
        )
    }

    fn get_recent_errors(&self, limit: usize) -> StorageResult<Vec<AttemptErrorRecord>> {
        self.query_errors(
            &format!("SELECT {ERROR_COLUMNS} FROM attempt_errors ORDER BY id DESC LIMIT ?1"),
            params![limit as i64],
        )
    }
}

/// Formats a timestamp so that string order matches time order
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(idx, v)).transpose()
}

fn parse_enum<T>(idx: usize, value: String, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown value '{}'", value).into(),
        )
    })
}

fn row_to_source(row: &Row<'_>) -> rusqlite::Result<SourceRecord> {
    let trigger: Option<String> = row.get(7)?;
    Ok(SourceRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        connector_id: row.get(2)?,
        credential_id: row.get(3)?,
        root: row.get(4)?,
        status: parse_enum(5, row.get(5)?, SourceStatus::from_db_string)?,
        refresh_freq_secs: row.get(6)?,
        indexing_trigger: trigger
            .map(|t| parse_enum(7, t, IndexingTrigger::from_db_string))
            .transpose()?,
        in_repeated_error_state: row.get(8)?,
        created_at: parse_ts(9, row.get(9)?)?,
    })
}

fn row_to_generation(row: &Row<'_>) -> rusqlite::Result<GenerationRecord> {
    Ok(GenerationRecord {
        id: row.get(0)?,
        status: parse_enum(1, row.get(1)?, GenerationStatus::from_db_string)?,
    })
}

fn row_to_attempt(row: &Row<'_>) -> rusqlite::Result<AttemptRecord> {
    Ok(AttemptRecord {
        id: row.get(0)?,
        source_id: row.get(1)?,
        generation_id: row.get(2)?,
        status: parse_enum(3, row.get(3)?, AttemptStatus::from_db_string)?,
        from_beginning: row.get(4)?,
        task_id: row.get(5)?,
        poll_range_start: parse_opt_ts(6, row.get(6)?)?,
        poll_range_end: parse_opt_ts(7, row.get(7)?)?,
        checkpoint_pointer: row.get(8)?,
        error_msg: row.get(9)?,
        total_docs_indexed: row.get::<_, i64>(10)? as u64,
        failure_count: row.get::<_, i64>(11)? as u64,
        created_at: parse_ts(12, row.get(12)?)?,
        started_at: parse_opt_ts(13, row.get(13)?)?,
        updated_at: parse_ts(14, row.get(14)?)?,
        finished_at: parse_opt_ts(15, row.get(15)?)?,
    })
}

fn row_to_error(row: &Row<'_>) -> rusqlite::Result<AttemptErrorRecord> {
    let missed_start: Option<f64> = row.get(6)?;
    let missed_end: Option<f64> = row.get(7)?;
    Ok(AttemptErrorRecord {
        id: row.get(0)?,
        attempt_id: row.get(1)?,
        source_id: row.get(2)?,
        failure: FailureRecord {
            document_id: row.get(3)?,
            document_link: row.get(4)?,
            entity_id: row.get(5)?,
            missed_range: missed_start.zip(missed_end),
            message: row.get(8)?,
        },
        created_at: parse_ts(9, row.get(9)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str, credential: &str) -> SourceDefinition {
        SourceDefinition {
            name: name.to_string(),
            connector_id: "directory".to_string(),
            credential_id: credential.to_string(),
            root: "/srv/docs".to_string(),
            refresh_freq_secs: Some(3600),
            paused: false,
        }
    }

    fn setup() -> (SqliteStorage, RunKey) {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let source_id = storage.upsert_source(&definition("docs", "local")).unwrap();
        storage
            .upsert_generation(1, GenerationStatus::Present)
            .unwrap();
        (storage, RunKey::new(source_id, 1))
    }

    #[test]
    fn test_upsert_source_is_keyed_by_identity() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let first = storage.upsert_source(&definition("docs", "local")).unwrap();

        let mut renamed = definition("handbook", "local");
        renamed.refresh_freq_secs = None;
        let second = storage.upsert_source(&renamed).unwrap();

        assert_eq!(first, second);
        let source = storage.get_source(first).unwrap();
        assert_eq!(source.name, "handbook");
        assert_eq!(source.refresh_freq_secs, None);
        assert_eq!(source.status, SourceStatus::InitialIndexing);
    }

    #[test]
    fn test_pause_and_unpause_source() {
        let (mut storage, key) = setup();

        let mut paused = definition("docs", "local");
        paused.paused = true;
        storage.upsert_source(&paused).unwrap();
        assert_eq!(
            storage.get_source(key.source_id).unwrap().status,
            SourceStatus::Paused
        );

        // Never succeeded, so it returns to initial indexing
        storage.upsert_source(&definition("docs", "local")).unwrap();
        assert_eq!(
            storage.get_source(key.source_id).unwrap().status,
            SourceStatus::InitialIndexing
        );
    }

    #[test]
    fn test_attempt_lifecycle() {
        let (mut storage, key) = setup();

        let attempt_id = storage.create_attempt(key, false).unwrap();
        let attempt = storage.get_attempt(attempt_id).unwrap();
        assert_eq!(attempt.status, AttemptStatus::NotStarted);
        assert_eq!(attempt.key(), key);

        assert!(storage.mark_attempt_in_progress(attempt_id).unwrap());
        // Second transition is refused
        assert!(!storage.mark_attempt_in_progress(attempt_id).unwrap());

        assert!(storage
            .finish_attempt(attempt_id, AttemptStatus::Success, None)
            .unwrap());
        // Terminal attempts are never overwritten
        assert!(!storage
            .finish_attempt(attempt_id, AttemptStatus::Failed, Some("late"))
            .unwrap());

        let attempt = storage.get_attempt(attempt_id).unwrap();
        assert_eq!(attempt.status, AttemptStatus::Success);
        assert!(attempt.error_msg.is_none());
        assert!(attempt.started_at.is_some());
        assert!(attempt.finished_at.is_some());
    }

    #[test]
    fn test_missing_attempt_is_an_error() {
        let (mut storage, _) = setup();
        assert!(matches!(
            storage.finish_attempt(99, AttemptStatus::Failed, None),
            Err(StorageError::AttemptNotFound(99))
        ));
        assert!(matches!(
            storage.get_attempt(99),
            Err(StorageError::AttemptNotFound(99))
        ));
    }

    #[test]
    fn test_recent_attempts_newest_first() {
        let (mut storage, key) = setup();
        let first = storage.create_attempt(key, false).unwrap();
        let second = storage.create_attempt(key, false).unwrap();

        let recent = storage.get_recent_attempts(key, 5).unwrap();
        assert_eq!(
            recent.iter().map(|a| a.id).collect::<Vec<_>>(),
            vec![second, first]
        );
        assert_eq!(storage.get_last_attempt(key).unwrap().unwrap().id, second);
    }

    #[test]
    fn test_last_successful_attempt_requires_window() {
        let (mut storage, key) = setup();
        let attempt_id = storage.create_attempt(key, false).unwrap();
        storage.mark_attempt_in_progress(attempt_id).unwrap();
        storage
            .finish_attempt(attempt_id, AttemptStatus::PartiallySucceeded, None)
            .unwrap();
        assert!(storage.get_last_successful_attempt(key).unwrap().is_none());

        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now();
        storage.set_poll_window(attempt_id, start, end).unwrap();

        let last = storage.get_last_successful_attempt(key).unwrap().unwrap();
        assert_eq!(last.id, attempt_id);
        let (stored_start, stored_end) = last.poll_window().unwrap();
        assert_eq!(
            stored_start.timestamp_micros(),
            start.timestamp_micros()
        );
        assert_eq!(stored_end.timestamp_micros(), end.timestamp_micros());
    }

    #[test]
    fn test_list_attempts_by_status() {
        let (mut storage, key) = setup();
        let running = storage.create_attempt(key, false).unwrap();
        storage.mark_attempt_in_progress(running).unwrap();
        let queued = storage.create_attempt(key, true).unwrap();

        let active = storage
            .list_attempts_by_status(&[AttemptStatus::NotStarted, AttemptStatus::InProgress])
            .unwrap();
        assert_eq!(active.len(), 2);

        let not_started = storage
            .list_attempts_by_status(&[AttemptStatus::NotStarted])
            .unwrap();
        assert_eq!(not_started.len(), 1);
        assert_eq!(not_started[0].id, queued);
        assert!(not_started[0].from_beginning);

        let counts = storage.count_attempts_by_status().unwrap();
        assert_eq!(counts.get(&AttemptStatus::InProgress), Some(&1));
    }

    #[test]
    fn test_attempt_errors_roundtrip() {
        let (mut storage, key) = setup();
        let attempt_id = storage.create_attempt(key, false).unwrap();

        let failure = FailureRecord {
            document_id: None,
            document_link: None,
            entity_id: Some("folder-7".to_string()),
            missed_range: Some((10.0, 20.0)),
            message: "permission denied".to_string(),
        };
        storage
            .record_attempt_error(attempt_id, key.source_id, &failure)
            .unwrap();

        let errors = storage.get_attempt_errors(attempt_id).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].failure, failure);
        assert_eq!(storage.get_recent_errors(10).unwrap().len(), 1);
    }

    #[test]
    fn test_checkpoint_pointer_retention_query() {
        let (mut storage, key) = setup();
        let attempt_id = storage.create_attempt(key, false).unwrap();
        storage
            .set_checkpoint_pointer(attempt_id, Some("checkpoint_1.json"))
            .unwrap();

        let past = Utc::now() - chrono::Duration::days(1);
        assert!(storage.attempts_with_checkpoints_before(past).unwrap().is_empty());

        let future = Utc::now() + chrono::Duration::days(1);
        let old = storage.attempts_with_checkpoints_before(future).unwrap();
        assert_eq!(old.len(), 1);

        storage.set_checkpoint_pointer(attempt_id, None).unwrap();
        assert!(storage
            .attempts_with_checkpoints_before(future)
            .unwrap()
            .is_empty());
    }
}
