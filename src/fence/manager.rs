use crate::coordination::CoordinationCache;
use crate::fence::keys::{
    fence_key, liveness_key, progress_key, stop_key, ACTIVE_FENCES,
};
use crate::state::RunKey;
use crate::storage::SourceRecord;
use crate::FencelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const PAYLOAD_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run details written into a fence once the attempt and task exist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FencePayload {
    pub attempt_id: i64,
    pub task_id: String,
    /// Set when the worker begins crawling
    pub started: Option<DateTime<Utc>>,
    /// Name of the crawl stage being processed
    pub stage: Option<String>,
}

/// Value stored under a fence key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FenceRecord {
    /// Identifies the incarnation of the fence that a handle refers to
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub payload: Option<FencePayload>,
}

/// Proof of having created (or taken over) a particular fence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceHandle {
    pub key: RunKey,
    pub token: String,
}

/// Creates, fills, renews, and tears down run fences
///
/// A fence's existence is the only "run active" signal for its key. Every write
/// after creation is conditional on the exact previous value, so a fence deleted
/// by the validator is never brought back by a late writer.
#[derive(Clone)]
pub struct FenceManager {
    cache: Arc<dyn CoordinationCache>,
    liveness_ttl: Duration,
}

impl FenceManager {
    pub fn new(cache: Arc<dyn CoordinationCache>, liveness_ttl: Duration) -> Self {
        Self {
            cache,
            liveness_ttl,
        }
    }

    pub fn cache(&self) -> &Arc<dyn CoordinationCache> {
        &self.cache
    }

    pub fn liveness_ttl(&self) -> Duration {
        self.liveness_ttl
    }

    /// Creates an empty fence for (source, generation)
    ///
    /// Callers serialize this decision with the creation lock.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(FenceHandle))` - The fence was created by this call
    /// * `Ok(None)` - A fence already exists or the source does not accept runs
    /// * `Err(FencelineError)` - The cache could not be reached
    pub fn acquire(
        &self,
        source: &SourceRecord,
        generation_id: i64,
    ) -> crate::Result<Option<FenceHandle>> {
        let key = RunKey::new(source.id, generation_id);
        if !source.status.accepts_runs() {
            tracing::debug!("Source {} is {}, not fencing {}", source.name, source.status, key);
            return Ok(None);
        }

        let record = FenceRecord {
            token: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            payload: None,
        };
        let fence = fence_key(key);
        // Registered before it exists: the validator drops registry entries
        // without a fence, but can never see a fence missing from the registry
        self.cache.add_member(ACTIVE_FENCES, &fence)?;
        if !self
            .cache
            .set_if_absent(&fence, &serde_json::to_string(&record)?, None)?
        {
            return Ok(None);
        }
        // A sweep may have dropped the entry between the two writes
        self.cache.add_member(ACTIVE_FENCES, &fence)?;

        // Leftovers from a previous incarnation of this key
        self.cache.delete(&stop_key(key))?;
        self.cache.delete(&progress_key(key))?;
        self.renew_liveness(key)?;

        tracing::info!("Fence acquired for {}", key);
        Ok(Some(FenceHandle {
            key,
            token: record.token,
        }))
    }

    /// Reads a fence together with its raw stored value
    pub fn load_raw(&self, key: RunKey) -> crate::Result<Option<(String, FenceRecord)>> {
        let Some(raw) = self.cache.get(&fence_key(key))? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&raw)?;
        Ok(Some((raw, record)))
    }

    pub fn load(&self, key: RunKey) -> crate::Result<Option<FenceRecord>> {
        Ok(self.load_raw(key)?.map(|(_, record)| record))
    }

    /// Returns true if a fence exists for the key
    pub fn is_fenced(&self, key: RunKey) -> crate::Result<bool> {
        Ok(self.cache.exists(&fence_key(key))?)
    }

    /// Applies `change` to the fence if it is still the incarnation `handle` names
    ///
    /// Returns false, writing nothing, if the fence is gone or was replaced.
    fn update(
        &self,
        handle: &FenceHandle,
        change: impl FnOnce(&mut FenceRecord),
    ) -> crate::Result<bool> {
        let Some((raw, mut record)) = self.load_raw(handle.key)? else {
            return Ok(false);
        };
        if record.token != handle.token {
            return Ok(false);
        }
        change(&mut record);
        let updated = serde_json::to_string(&record)?;
        if updated == raw {
            return Ok(true);
        }
        Ok(self
            .cache
            .replace_if_equal(&fence_key(handle.key), &raw, &updated, None)?)
    }

    /// Writes the attempt and task ids into the fence
    ///
    /// Idempotent for the same ids.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The payload is in place
    /// * `Ok(false)` - The fence expired or was torn down; the caller must roll back
    pub fn fill(&self, handle: &FenceHandle, attempt_id: i64, task_id: &str) -> crate::Result<bool> {
        let filled = self.update(handle, |record| {
            let unchanged = record
                .payload
                .as_ref()
                .is_some_and(|p| p.attempt_id == attempt_id && p.task_id == task_id);
            if !unchanged {
                record.payload = Some(FencePayload {
                    attempt_id,
                    task_id: task_id.to_string(),
                    started: None,
                    stage: None,
                });
            }
        })?;
        if filled {
            tracing::info!(
                "Fence {} filled: attempt={} task={}",
                handle.key,
                attempt_id,
                task_id
            );
        }
        Ok(filled)
    }

    /// Polls until the fence carries a payload for `task_id`
    ///
    /// The scheduler enqueues the task before filling the payload, so a fast worker
    /// can get here first.
    ///
    /// # Returns
    ///
    /// * `Ok((FenceHandle, FencePayload))` - The payload written for this task
    /// * `Err(FenceMismatch)` - The fence names a different task
    /// * `Err(FencePayloadTimeout)` - No payload appeared within `timeout`
    pub fn wait_for_payload(
        &self,
        key: RunKey,
        task_id: &str,
        timeout: Duration,
    ) -> crate::Result<(FenceHandle, FencePayload)> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(record) = self.load(key)? {
                if let Some(payload) = record.payload {
                    if payload.task_id != task_id {
                        return Err(FencelineError::FenceMismatch {
                            key: fence_key(key),
                        });
                    }
                    let handle = FenceHandle {
                        key,
                        token: record.token,
                    };
                    return Ok((handle, payload));
                }
            }

            if Instant::now() >= deadline {
                return Err(FencelineError::FencePayloadTimeout {
                    key: fence_key(key),
                });
            }
            std::thread::sleep(PAYLOAD_POLL_INTERVAL);
        }
    }

    /// Records that the worker has begun crawling
    pub fn mark_started(&self, handle: &FenceHandle) -> crate::Result<bool> {
        let now = Utc::now();
        self.update(handle, |record| {
            if let Some(payload) = record.payload.as_mut() {
                payload.started = Some(now);
            }
        })
    }

    /// Records the crawl stage being processed
    pub fn set_stage(&self, handle: &FenceHandle, stage: &str) -> crate::Result<bool> {
        self.update(handle, |record| {
            if let Some(payload) = record.payload.as_mut() {
                payload.stage = Some(stage.to_string());
            }
        })
    }

    /// Extends the liveness signal of the handle's run
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The fence is still the handle's and its liveness is fresh
    /// * `Err(LivenessLost)` - The fence was torn down or belongs to a newer run;
    ///   nothing was written
    pub fn renew(&self, handle: &FenceHandle) -> crate::Result<()> {
        match self.load(handle.key)? {
            Some(record) if record.token == handle.token => self.renew_liveness(handle.key),
            Some(_) => Err(FencelineError::LivenessLost(format!(
                "fence {} was taken over by another run",
                fence_key(handle.key)
            ))),
            None => Err(FencelineError::LivenessLost(format!(
                "fence {} no longer exists",
                fence_key(handle.key)
            ))),
        }
    }

    /// Sets the liveness signal for a key with a fresh TTL
    pub fn renew_liveness(&self, key: RunKey) -> crate::Result<()> {
        self.cache
            .set(&liveness_key(key), "1", Some(self.liveness_ttl))?;
        Ok(())
    }

    /// Returns true if the liveness signal has not expired
    pub fn is_alive(&self, key: RunKey) -> crate::Result<bool> {
        Ok(self.cache.exists(&liveness_key(key))?)
    }

    /// Deletes the fence and its companion keys if `handle` still owns it
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The fence was deleted by this call
    /// * `Ok(false)` - The fence was already gone or belongs to a newer incarnation
    pub fn release(&self, handle: &FenceHandle) -> crate::Result<bool> {
        let Some((raw, record)) = self.load_raw(handle.key)? else {
            return Ok(false);
        };
        if record.token != handle.token {
            return Ok(false);
        }
        let released = self.reset(handle.key, &raw)?;
        if released {
            tracing::info!("Fence released for {}", handle.key);
        }
        Ok(released)
    }

    /// Tears down the fence if it still holds `observed`
    ///
    /// Used by the validator for orphans and by `release`.
    pub fn reset(&self, key: RunKey, observed: &str) -> crate::Result<bool> {
        let fence = fence_key(key);
        if !self.cache.delete_if_equal(&fence, observed)? {
            return Ok(false);
        }
        self.cache.delete(&liveness_key(key))?;
        self.cache.delete(&progress_key(key))?;
        self.cache.delete(&stop_key(key))?;
        self.cache.remove_member(ACTIVE_FENCES, &fence)?;
        Ok(true)
    }

    /// Sets the cooperative stop flag for the key's run
    pub fn request_stop(&self, key: RunKey) -> crate::Result<()> {
        self.cache.set(&stop_key(key), "1", None)?;
        Ok(())
    }

    pub fn stop_requested(&self, key: RunKey) -> crate::Result<bool> {
        Ok(self.cache.exists(&stop_key(key))?)
    }

    /// Adds to the run's progress counter and returns the new total
    pub fn incr_progress(&self, key: RunKey, delta: i64) -> crate::Result<i64> {
        Ok(self.cache.incr_by(&progress_key(key), delta)?)
    }

    pub fn progress(&self, key: RunKey) -> crate::Result<Option<i64>> {
        Ok(self
            .cache
            .get(&progress_key(key))?
            .and_then(|value| value.parse().ok()))
    }

    /// Fence keys currently registered
    pub fn list_fences(&self) -> crate::Result<BTreeSet<String>> {
        Ok(self.cache.members(ACTIVE_FENCES)?)
    }

    pub fn register(&self, fence: &str) -> crate::Result<()> {
        self.cache.add_member(ACTIVE_FENCES, fence)?;
        Ok(())
    }

    /// Drops a fence key from the registry without touching the fence itself
    pub fn unregister(&self, fence: &str) -> crate::Result<()> {
        self.cache.remove_member(ACTIVE_FENCES, fence)?;
        Ok(())
    }
}

/// Releases a fence when dropped unless released explicitly
///
/// The worker's terminal transition calls `release`; the drop path covers early
/// returns and panics.
pub struct FenceGuard<'a> {
    manager: &'a FenceManager,
    handle: Option<FenceHandle>,
}

impl<'a> FenceGuard<'a> {
    pub fn new(manager: &'a FenceManager, handle: FenceHandle) -> Self {
        Self {
            manager,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&FenceHandle> {
        self.handle.as_ref()
    }

    pub fn release(mut self) -> crate::Result<bool> {
        match self.handle.take() {
            Some(handle) => self.manager.release(&handle),
            None => Ok(false),
        }
    }

    /// Drops the guard without releasing; the fence is left for the validator
    pub fn disarm(mut self) -> Option<FenceHandle> {
        self.handle.take()
    }
}

impl Drop for FenceGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.manager.release(&handle) {
                tracing::error!("Failed to release fence for {}: {}", handle.key, e);
            }
        }
    }
}
