//! Bounded display-name cache owned by one connector instance

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

const DEFAULT_CAPACITY: usize = 1024;

/// LRU cache mapping container ids to display names
///
/// Each connector instance owns its own cache, so names never leak between runs.
/// Callers invalidate explicitly when the underlying hierarchy may have changed.
pub struct NameCache {
    entries: Mutex<LruCache<String, String>>,
}

impl Default for NameCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl NameCache {
    /// Creates a cache holding at most `capacity` names (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the cached name for `id`, computing and caching it on a miss
    pub fn get_or_insert_with(&self, id: &str, resolve: impl FnOnce() -> String) -> String {
        let mut entries = self.entries.lock();
        if let Some(name) = entries.get(id) {
            return name.clone();
        }
        let name = resolve();
        entries.put(id.to_string(), name.clone());
        name
    }

    pub fn invalidate(&self, id: &str) {
        self.entries.lock().pop(id);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
