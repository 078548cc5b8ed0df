//! Database schema definitions and migrations
//!
//! This module contains all SQL schema definitions for the durable attempt records.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- External origins, identified by (connector, credential)
CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    connector_id TEXT NOT NULL,
    credential_id TEXT NOT NULL,
    root TEXT NOT NULL,
    status TEXT NOT NULL,
    refresh_freq_secs INTEGER,
    indexing_trigger TEXT,
    in_repeated_error_state INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(connector_id, credential_id)
);

-- Downstream index generations
CREATE TABLE IF NOT EXISTS generations (
    id INTEGER PRIMARY KEY,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- One row per indexing run attempt
CREATE TABLE IF NOT EXISTS attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES sources(id),
    generation_id INTEGER NOT NULL REFERENCES generations(id),
    status TEXT NOT NULL,
    from_beginning INTEGER NOT NULL DEFAULT 0,
    task_id TEXT,
    poll_range_start TEXT,
    poll_range_end TEXT,
    checkpoint_pointer TEXT,
    error_msg TEXT,
    total_docs_indexed INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    updated_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_attempts_key ON attempts(source_id, generation_id);
CREATE INDEX IF NOT EXISTS idx_attempts_status ON attempts(status);

-- Scoped failures recorded while an attempt ran
CREATE TABLE IF NOT EXISTS attempt_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    attempt_id INTEGER NOT NULL REFERENCES attempts(id) ON DELETE CASCADE,
    source_id INTEGER NOT NULL REFERENCES sources(id),
    document_id TEXT,
    document_link TEXT,
    entity_id TEXT,
    missed_start REAL,
    missed_end REAL,
    failure_message TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attempt_errors_attempt ON attempt_errors(attempt_id);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        initialize_schema(&conn).unwrap();
        let result = initialize_schema(&conn);

        assert!(result.is_ok());
    }

    #[test]
    fn test_tables_exist_after_init() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        for table in ["sources", "generations", "attempts", "attempt_errors"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "Table {} should exist", table);
        }
    }
}
