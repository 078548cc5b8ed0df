//! In-process coordination cache

use crate::coordination::traits::{CacheError, CacheResult, CoordinationCache};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl State {
    /// Returns the live entry at `key`, evicting it first if it expired
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

/// Coordination cache held in process memory
///
/// Processes sharing one `MemoryCache` see the same state. It can be switched
/// offline to exercise the "cache unavailable" paths.
pub struct MemoryCache {
    state: Mutex<State>,
    available: AtomicBool,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Makes every subsequent call fail with `CacheError::Unavailable` while false
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> CacheResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("memory cache offline".to_string()))
        }
    }
}

impl CoordinationCache for MemoryCache {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(true)
    }

    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check()?;
        let mut state = self.state.lock();
        Ok(state.live(key).map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.check()?;
        self.state
            .lock()
            .entries
            .insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        let live = state.live(key).is_some();
        state.entries.remove(key);
        Ok(live)
    }

    fn replace_if_equal(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        match state.live(key) {
            Some(entry) if entry.value == expected => {
                *entry = Entry::new(value, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_if_equal(&self, key: &str, expected: &str) -> CacheResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        if state.live(key).is_some_and(|e| e.value == expected) {
            state.entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.check()?;
        let mut state = self.state.lock();
        let (current, expires_at) = match state.live(key) {
            Some(entry) => {
                let current = entry
                    .value
                    .parse::<i64>()
                    .map_err(|_| CacheError::NotAnInteger {
                        key: key.to_string(),
                    })?;
                (current, entry.expires_at)
            }
            None => (0, None),
        };
        let next = current + delta;
        state.entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    fn add_member(&self, set_key: &str, member: &str) -> CacheResult<()> {
        self.check()?;
        self.state
            .lock()
            .sets
            .entry(set_key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    fn remove_member(&self, set_key: &str, member: &str) -> CacheResult<()> {
        self.check()?;
        if let Some(set) = self.state.lock().sets.get_mut(set_key) {
            set.remove(member);
        }
        Ok(())
    }

    fn members(&self, set_key: &str) -> CacheResult<BTreeSet<String>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .sets
            .get(set_key)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_if_absent_is_exclusive() {
        let cache = MemoryCache::new();
        assert!(cache.set_if_absent("fence", "a", None).unwrap());
        assert!(!cache.set_if_absent("fence", "b", None).unwrap());
        assert_eq!(cache.get("fence").unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn test_ttl_expiry_frees_key() {
        let cache = MemoryCache::new();
        assert!(cache
            .set_if_absent("live", "1", Some(Duration::from_millis(20)))
            .unwrap());
        std::thread::sleep(Duration::from_millis(40));
        assert!(!cache.exists("live").unwrap());
        assert!(cache.set_if_absent("live", "2", None).unwrap());
    }

    #[test]
    fn test_conditional_replace_and_delete() {
        let cache = MemoryCache::new();
        cache.set("k", "old", None).unwrap();

        assert!(!cache.replace_if_equal("k", "other", "new", None).unwrap());
        assert!(cache.replace_if_equal("k", "old", "new", None).unwrap());
        assert!(!cache.delete_if_equal("k", "old").unwrap());
        assert!(cache.delete_if_equal("k", "new").unwrap());
        assert!(cache.get("k").unwrap().is_none());
    }

    #[test]
    fn test_incr_by() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr_by("progress", 5).unwrap(), 5);
        assert_eq!(cache.incr_by("progress", 2).unwrap(), 7);

        cache.set("text", "abc", None).unwrap();
        assert!(matches!(
            cache.incr_by("text", 1),
            Err(CacheError::NotAnInteger { .. })
        ));
    }

    #[test]
    fn test_members() {
        let cache = MemoryCache::new();
        cache.add_member("fences", "a").unwrap();
        cache.add_member("fences", "b").unwrap();
        cache.remove_member("fences", "a").unwrap();

        let members = cache.members("fences").unwrap();
        assert_eq!(members.into_iter().collect::<Vec<_>>(), vec!["b"]);
        assert!(cache.members("missing").unwrap().is_empty());
    }

    #[test]
    fn test_offline_cache_fails_every_call() {
        let cache = MemoryCache::new();
        cache.set_available(false);
        assert!(matches!(
            cache.set_if_absent("k", "v", None),
            Err(CacheError::Unavailable(_))
        ));
        assert!(cache.get("k").is_err());
        assert!(cache.members("s").is_err());

        cache.set_available(true);
        assert!(cache.set_if_absent("k", "v", None).unwrap());
    }
}
