use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::crawler::CrawlCheckpoint;
use crate::state::RunKey;
use crate::storage::{AttemptStore, SharedStorage};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;

/// Number of recent terminal attempts considered when picking a checkpoint
///
/// If this many attempts in a row indexed nothing and none succeeded, checkpoints
/// are ignored and the next run starts from scratch.
pub const NO_PROGRESS_WINDOW: usize = 50;

/// Connects checkpoint blobs to the attempts that wrote them
pub struct CheckpointLedger {
    store: Arc<dyn CheckpointStore>,
    storage: SharedStorage,
    size_limit: usize,
}

impl CheckpointLedger {
    pub fn new(store: Arc<dyn CheckpointStore>, storage: SharedStorage, size_limit: usize) -> Self {
        Self {
            store,
            storage,
            size_limit,
        }
    }

    /// Deterministic blob name for an attempt
    pub fn pointer_for(attempt_id: i64) -> String {
        format!("checkpoint_{}.json", attempt_id)
    }

    /// Serializes and stores a checkpoint, then points the attempt at it
    ///
    /// # Returns
    ///
    /// * `Ok(String)` - The pointer now recorded on the attempt
    /// * `Err(FencelineError::Checkpoint(TooLarge))` - The serialized checkpoint exceeds the limit
    /// * `Err(FencelineError::Checkpoint(Write))` - The blob store rejected the write
    pub fn save(&self, attempt_id: i64, checkpoint: &CrawlCheckpoint) -> crate::Result<String> {
        let bytes = checkpoint.to_json()?;
        if bytes.len() > self.size_limit {
            return Err(CheckpointError::TooLarge {
                size: bytes.len(),
                limit: self.size_limit,
            }
            .into());
        }

        let pointer = Self::pointer_for(attempt_id);
        self.store.put(&pointer, &bytes)?;
        self.storage
            .lock()
            .set_checkpoint_pointer(attempt_id, Some(&pointer))?;
        Ok(pointer)
    }

    /// Loads a checkpoint blob
    ///
    /// # Returns
    ///
    /// * `Ok(Some(CrawlCheckpoint))` - The blob exists and parses
    /// * `Ok(None)` - No blob under the pointer
    /// * `Err(FencelineError)` - The blob could not be read or is corrupt
    pub fn load(&self, pointer: &str) -> crate::Result<Option<CrawlCheckpoint>> {
        let Some(bytes) = self.store.get(pointer)? else {
            return Ok(None);
        };
        let checkpoint =
            CrawlCheckpoint::from_json(&bytes).map_err(|e| CheckpointError::Corrupt {
                pointer: pointer.to_string(),
                message: e.to_string(),
            })?;
        Ok(Some(checkpoint))
    }

    /// Picks the checkpoint a new attempt with the given window should resume from
    ///
    /// Only the newest FAILED or CANCELED attempt over exactly the same poll window
    /// qualifies. A missing or unreadable blob means starting fresh.
    ///
    /// # Returns
    ///
    /// * `Ok(Some((attempt_id, checkpoint)))` - Resume from this attempt's checkpoint
    /// * `Ok(None)` - Start from an empty checkpoint
    pub fn latest_valid_checkpoint(
        &self,
        key: RunKey,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> crate::Result<Option<(i64, CrawlCheckpoint)>> {
        let candidates: Vec<_> = {
            let storage = self.storage.lock();
            storage
                .get_recent_attempts(key, NO_PROGRESS_WINDOW + 2)?
                .into_iter()
                .filter(|attempt| attempt.status.is_terminal())
                .take(NO_PROGRESS_WINDOW)
                .collect()
        };

        if candidates.len() == NO_PROGRESS_WINDOW {
            let any_progress = candidates
                .iter()
                .any(|a| a.total_docs_indexed > 0 || a.status.is_successful());
            if !any_progress {
                tracing::warn!(
                    "{} consecutive attempts without progress for {}, ignoring checkpoints",
                    NO_PROGRESS_WINDOW,
                    key
                );
                return Ok(None);
            }
        }

        let Some(candidate) = candidates.into_iter().find(|attempt| {
            attempt.status.retries_window()
                && attempt.checkpoint_pointer.is_some()
                && attempt.poll_window() == Some(window)
        }) else {
            return Ok(None);
        };

        let Some(pointer) = candidate.checkpoint_pointer.as_deref() else {
            return Ok(None);
        };
        match self.load(pointer) {
            Ok(Some(checkpoint)) => {
                tracing::info!(
                    "Resuming {} from checkpoint of attempt {}",
                    key,
                    candidate.id
                );
                Ok(Some((candidate.id, checkpoint)))
            }
            Ok(None) => {
                tracing::warn!("Checkpoint {} of attempt {} is gone", pointer, candidate.id);
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable checkpoint of attempt {}: {}",
                    candidate.id,
                    e
                );
                Ok(None)
            }
        }
    }

    /// Deletes an attempt's checkpoint blob and clears its pointer
    pub fn cleanup(&self, attempt_id: i64) -> crate::Result<()> {
        let pointer = self.storage.lock().get_attempt(attempt_id)?.checkpoint_pointer;
        if let Some(pointer) = pointer {
            self.store.delete(&pointer)?;
            self.storage.lock().set_checkpoint_pointer(attempt_id, None)?;
        }
        Ok(())
    }

    /// Removes checkpoints of terminal attempts older than `retention_days`
    ///
    /// # Returns
    ///
    /// * `Ok(usize)` - Number of checkpoints removed
    pub fn cleanup_older_than(&self, retention_days: u32) -> crate::Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        let stale = self.storage.lock().attempts_with_checkpoints_before(cutoff)?;

        let mut removed = 0;
        for attempt in stale.iter().filter(|a| a.status.is_terminal()) {
            if let Err(e) = self.cleanup(attempt.id) {
                tracing::warn!("Failed to remove checkpoint of attempt {}: {}", attempt.id, e);
                continue;
            }
            removed += 1;
        }

        if removed > 0 {
            tracing::info!("Removed {} checkpoints older than {} days", removed, retention_days);
        }
        Ok(removed)
    }
}
