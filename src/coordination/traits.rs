//! Coordination cache trait and error types

use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur talking to the coordination cache
///
/// Every error is fatal to the operation that hit it; callers never treat a failed
/// cache call as "no fence" or "lock acquired".
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Coordination cache unavailable: {0}")]
    Unavailable(String),

    #[error("Value at {key} is not an integer")]
    NotAnInteger { key: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Shared low-latency key-value store used as fence registry and liveness surface
pub trait CoordinationCache: Send + Sync {
    // ===== Single Keys =====

    /// Creates `key` only if no live value exists
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The key was created with `value`
    /// * `Ok(false)` - A live value already existed and was left untouched
    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool>;

    fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Writes `value` unconditionally, replacing any TTL with `ttl`
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// Returns true if a live value was removed
    fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Overwrites `key` only while it still holds `expected`
    fn replace_if_equal(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<bool>;

    /// Deletes `key` only while it still holds `expected`
    fn delete_if_equal(&self, key: &str, expected: &str) -> CacheResult<bool>;

    /// Adds `delta` to an integer value, treating a missing key as zero
    fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64>;

    fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    // ===== Sets =====

    fn add_member(&self, set_key: &str, member: &str) -> CacheResult<()>;

    fn remove_member(&self, set_key: &str, member: &str) -> CacheResult<()>;

    fn members(&self, set_key: &str) -> CacheResult<BTreeSet<String>>;
}
