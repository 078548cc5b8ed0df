//! Advisory lock stored in the coordination cache

use crate::coordination::traits::{CacheResult, CoordinationCache};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Short-lived advisory lock identified by a random owner token
///
/// The lock expires after `timeout` unless reacquired, so a crashed holder never
/// blocks others for longer than that. It only serializes decisions; it never
/// protects the execution of a run.
pub struct CacheLock {
    cache: Arc<dyn CoordinationCache>,
    key: String,
    token: String,
    timeout: Duration,
}

impl CacheLock {
    pub fn new(cache: Arc<dyn CoordinationCache>, key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            cache,
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            timeout,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Attempts to take the lock once
    pub fn try_acquire(&self) -> CacheResult<bool> {
        self.cache
            .set_if_absent(&self.key, &self.token, Some(self.timeout))
    }

    /// Polls for the lock until `wait` elapses
    pub fn acquire(&self, wait: Duration) -> CacheResult<bool> {
        let deadline = Instant::now() + wait;
        loop {
            if self.try_acquire()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Returns true while this instance holds the lock
    pub fn owned(&self) -> CacheResult<bool> {
        Ok(self.cache.get(&self.key)?.as_deref() == Some(self.token.as_str()))
    }

    /// Extends the lock's TTL if this instance still holds it
    pub fn reacquire(&self) -> CacheResult<bool> {
        self.cache
            .replace_if_equal(&self.key, &self.token, &self.token, Some(self.timeout))
    }

    /// Releases the lock if this instance still holds it
    pub fn release(&self) -> CacheResult<bool> {
        self.cache.delete_if_equal(&self.key, &self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCache;

    #[test]
    fn test_lock_excludes_second_owner() {
        let cache: Arc<dyn CoordinationCache> = Arc::new(MemoryCache::new());
        let first = CacheLock::new(Arc::clone(&cache), "lock:test", Duration::from_secs(5));
        let second = CacheLock::new(Arc::clone(&cache), "lock:test", Duration::from_secs(5));

        assert!(first.try_acquire().unwrap());
        assert!(!second.acquire(Duration::from_millis(120)).unwrap());
        assert!(first.owned().unwrap());
        assert!(!second.owned().unwrap());

        // Only the owner can release
        assert!(!second.release().unwrap());
        assert!(first.release().unwrap());
        assert!(second.try_acquire().unwrap());
    }

    #[test]
    fn test_reacquire_fails_after_expiry() {
        let cache: Arc<dyn CoordinationCache> = Arc::new(MemoryCache::new());
        let lock = CacheLock::new(Arc::clone(&cache), "lock:sweep", Duration::from_millis(30));

        assert!(lock.try_acquire().unwrap());
        assert!(lock.reacquire().unwrap());

        std::thread::sleep(Duration::from_millis(60));
        assert!(!lock.reacquire().unwrap());
        assert!(!lock.owned().unwrap());
    }
}
