//! SQLite-backed coordination cache
//!
//! Every process opens the same database file. Conditional writes run inside
//! `BEGIN IMMEDIATE` transactions so check-and-write is atomic across processes.

use crate::coordination::traits::{CacheError, CacheResult, CoordinationCache};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

const CACHE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);

CREATE TABLE IF NOT EXISTS cache_members (
    set_key TEXT NOT NULL,
    member TEXT NOT NULL,
    PRIMARY KEY (set_key, member)
);
"#;

/// Coordination cache stored in a shared SQLite file
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Opens or creates the cache database at `path`
    pub fn open(path: &Path) -> CacheResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(CACHE_SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> CacheResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CACHE_SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_ms() + ttl.as_millis() as i64)
}

impl CoordinationCache for SqliteCache {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM cache_entries WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![key, now_ms()],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expiry(ttl)],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM cache_entries \
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_ms()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, expiry(ttl)],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        let conn = self.conn.lock();
        let live: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM cache_entries \
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2))",
            params![key, now_ms()],
            |row| row.get(0),
        )?;
        conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        Ok(live)
    }

    fn replace_if_equal(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE cache_entries SET value = ?1, expires_at = ?2 \
             WHERE key = ?3 AND value = ?4 AND (expires_at IS NULL OR expires_at > ?5)",
            params![value, expiry(ttl), key, expected, now_ms()],
        )?;
        Ok(changed == 1)
    }

    fn delete_if_equal(&self, key: &str, expected: &str) -> CacheResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM cache_entries \
             WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
            params![key, expected, now_ms()],
        )?;
        Ok(changed == 1)
    }

    fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ms();
        let current: Option<(String, Option<i64>)> = tx
            .query_row(
                "SELECT value, expires_at FROM cache_entries \
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (current, expires_at) = match current {
            Some((value, expires_at)) => {
                let value = value.parse::<i64>().map_err(|_| CacheError::NotAnInteger {
                    key: key.to_string(),
                })?;
                (value, expires_at)
            }
            None => (0, None),
        };

        let next = current + delta;
        tx.execute(
            "INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, next.to_string(), expires_at],
        )?;
        tx.commit()?;
        Ok(next)
    }

    fn add_member(&self, set_key: &str, member: &str) -> CacheResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO cache_members (set_key, member) VALUES (?1, ?2)",
            params![set_key, member],
        )?;
        Ok(())
    }

    fn remove_member(&self, set_key: &str, member: &str) -> CacheResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM cache_members WHERE set_key = ?1 AND member = ?2",
            params![set_key, member],
        )?;
        Ok(())
    }

    fn members(&self, set_key: &str) -> CacheResult<BTreeSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT member FROM cache_members WHERE set_key = ?1")?;
        let members = stmt
            .query_map(params![set_key], |row| row.get(0))?
            .collect::<Result<BTreeSet<String>, _>>()?;
        Ok(members)
    }
}
