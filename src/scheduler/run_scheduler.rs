use crate::checkpoint::CheckpointLedger;
use crate::config::{Config, SchedulerConfig};
use crate::coordination::CacheLock;
use crate::fence::keys::CREATE_LOCK;
use crate::fence::{FenceHandle, FenceManager};
use crate::queue::{TaskPriority, TaskQueue};
use crate::scheduler::eligibility::{is_in_repeated_error_state, should_index, Eligibility};
use crate::state::{GenerationStatus, IndexingTrigger, RunKey};
use crate::storage::{
    AttemptStore, GenerationRecord, SharedStorage, SourceDefinition, SourceRecord,
};
use crate::worker::{IndexTaskArgs, INDEX_TASK_NAME};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Result of one scheduling pass
#[derive(Debug, Default)]
pub struct BeatReport {
    /// Attempts created during the pass
    pub started: Vec<i64>,
    /// (source, generation) pairs whose evaluation failed
    pub errors: usize,
    /// Checkpoints removed by retention
    pub checkpoints_removed: usize,
}

/// Decides when runs start and submits them under fence protection
pub struct RunScheduler {
    storage: SharedStorage,
    fences: FenceManager,
    queue: Arc<dyn TaskQueue>,
    config: SchedulerConfig,
    queue_name: String,
    lock_timeout: Duration,
    retention: Option<(Arc<CheckpointLedger>, u32)>,
}

impl RunScheduler {
    pub fn new(storage: SharedStorage, fences: FenceManager, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            storage,
            fences,
            queue,
            config: SchedulerConfig::default(),
            queue_name: "connector_indexing".to_string(),
            lock_timeout: Duration::from_secs(30),
            retention: None,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Deletes checkpoints older than `days` on every beat
    pub fn with_checkpoint_retention(mut self, ledger: Arc<CheckpointLedger>, days: u32) -> Self {
        self.retention = Some((ledger, days));
        self
    }

    /// Writes configured sources and generations to storage
    ///
    /// # Returns
    ///
    /// * `Ok(usize)` - Number of sources synced
    pub fn sync_config(&self, config: &Config) -> crate::Result<usize> {
        let mut storage = self.storage.lock();
        for generation in &config.generations {
            let status = GenerationStatus::from_db_string(&generation.status).ok_or_else(|| {
                crate::ConfigError::Validation(format!(
                    "Generation {} has unknown status '{}'",
                    generation.id, generation.status
                ))
            })?;
            storage.upsert_generation(generation.id, status)?;
        }

        for source in &config.sources {
            storage.upsert_source(&SourceDefinition {
                name: source.name.clone(),
                connector_id: source.connector.clone(),
                credential_id: source.credential.clone(),
                root: source.root.clone(),
                refresh_freq_secs: source.refresh_freq_secs.map(|secs| secs as i64),
                paused: source.paused,
            })?;
        }

        tracing::info!(
            "Synced {} sources and {} generations from config",
            config.sources.len(),
            config.generations.len()
        );
        Ok(config.sources.len())
    }

    /// Sets the manual trigger on a source by name
    pub fn trigger(&self, source_name: &str, reindex: bool) -> crate::Result<i64> {
        let mut storage = self.storage.lock();
        let source = storage
            .get_source_by_name(source_name)?
            .ok_or_else(|| crate::FencelineError::UnknownSource(source_name.to_string()))?;
        let trigger = if reindex {
            IndexingTrigger::Reindex
        } else {
            IndexingTrigger::Update
        };
        storage.set_indexing_trigger(source.id, Some(trigger))?;
        tracing::info!("Manual {:?} trigger set on source {}", trigger, source.name);
        Ok(source.id)
    }

    /// One scheduling pass over every source and live generation
    pub fn check_for_indexing(&self) -> crate::Result<BeatReport> {
        let mut report = BeatReport::default();
        let (sources, generations) = {
            let storage = self.storage.lock();
            (storage.list_sources()?, storage.list_live_generations()?)
        };
        let secondary_building = generations
            .iter()
            .any(|g| g.status == GenerationStatus::Future);

        for source in &sources {
            for generation in &generations {
                match self.evaluate(source, generation, secondary_building) {
                    Ok(Some(attempt_id)) => report.started.push(attempt_id),
                    Ok(None) => {}
                    Err(e) => {
                        report.errors += 1;
                        tracing::error!(
                            "Scheduling failed for source {} generation {}: {}",
                            source.name,
                            generation.id,
                            e
                        );
                    }
                }
            }
        }

        if let Some((ledger, days)) = &self.retention {
            report.checkpoints_removed = ledger.cleanup_older_than(*days)?;
        }

        tracing::debug!(
            "Scheduling pass: {} started, {} errors",
            report.started.len(),
            report.errors
        );
        Ok(report)
    }

    /// Starts a run for the key if it is due
    ///
    /// # Returns
    ///
    /// * `Ok(Some(attempt_id))` - A run was created and queued
    /// * `Ok(None)` - Not due, or another run holds the fence
    pub fn maybe_start(&self, key: RunKey) -> crate::Result<Option<i64>> {
        let (source, generation, generations) = {
            let storage = self.storage.lock();
            (
                storage.get_source(key.source_id)?,
                storage.get_generation(key.generation_id)?,
                storage.list_live_generations()?,
            )
        };
        if !generation.status.is_live() {
            return Ok(None);
        }
        let secondary_building = generations
            .iter()
            .any(|g| g.status == GenerationStatus::Future);
        self.evaluate(&source, &generation, secondary_building)
    }

    fn evaluate(
        &self,
        source: &SourceRecord,
        generation: &GenerationRecord,
        secondary_building: bool,
    ) -> crate::Result<Option<i64>> {
        let key = RunKey::new(source.id, generation.id);
        let recent = self
            .storage
            .lock()
            .get_recent_attempts(key, self.config.repeated_error_threshold)?;

        let mut source = source.clone();
        if generation.status == GenerationStatus::Present {
            let in_error = is_in_repeated_error_state(
                &recent,
                self.config.repeated_error_threshold,
                source.refresh_freq_secs.is_some(),
            );
            if in_error != source.in_repeated_error_state {
                if in_error {
                    tracing::warn!("Source {} entered repeated error state", source.name);
                } else {
                    tracing::info!("Source {} left repeated error state", source.name);
                }
                self.storage
                    .lock()
                    .set_repeated_error_state(source.id, in_error)?;
                source.in_repeated_error_state = in_error;
            }
        }

        let eligible = should_index(&Eligibility {
            source: &source,
            generation: generation.status,
            last_attempt: recent.first(),
            secondary_building,
            disable_update_on_swap: self.config.disable_update_on_swap,
            now: Utc::now(),
        });
        if !eligible {
            return Ok(None);
        }

        let from_beginning = generation.status == GenerationStatus::Future
            || source.indexing_trigger == Some(IndexingTrigger::Reindex);
        let attempt_id = self.try_create_run(&source, generation.id, from_beginning)?;

        if attempt_id.is_some()
            && generation.status == GenerationStatus::Present
            && source.indexing_trigger.is_some()
        {
            self.storage.lock().set_indexing_trigger(source.id, None)?;
        }
        Ok(attempt_id)
    }

    /// Creates a fenced, queued run without checking whether it is due
    ///
    /// Fence creation is serialized across schedulers by a short advisory lock.
    /// A failure after the fence is acquired unwinds every step taken so far.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(attempt_id))` - The run is fenced, recorded, queued, and filled
    /// * `Ok(None)` - The lock was busy, a fence exists, or the source is not runnable
    pub fn try_create_run(
        &self,
        source: &SourceRecord,
        generation_id: i64,
        from_beginning: bool,
    ) -> crate::Result<Option<i64>> {
        let lock = CacheLock::new(self.fences.cache().clone(), CREATE_LOCK, self.lock_timeout);
        if !lock.acquire(self.lock_timeout / 2)? {
            tracing::debug!("Creation lock busy, skipping source {}", source.name);
            return Ok(None);
        }

        let result = self.create_under_lock(source, generation_id, from_beginning);

        if let Err(e) = lock.release() {
            tracing::warn!("Failed to release creation lock: {}", e);
        }
        result
    }

    fn create_under_lock(
        &self,
        source: &SourceRecord,
        generation_id: i64,
        from_beginning: bool,
    ) -> crate::Result<Option<i64>> {
        // Status may have changed since the caller read it
        let source = self.storage.lock().get_source(source.id)?;
        let Some(handle) = self.fences.acquire(&source, generation_id)? else {
            return Ok(None);
        };
        let key = handle.key;

        let attempt_id = match self.storage.lock().create_attempt(key, from_beginning) {
            Ok(id) => id,
            Err(e) => {
                self.unwind(&handle, None, None);
                return Err(e.into());
            }
        };

        let task_id = format!("connector_indexing_{}_{}", key, Uuid::new_v4());
        let args = IndexTaskArgs {
            attempt_id,
            source_id: key.source_id,
            generation_id: key.generation_id,
        };

        let submitted = serde_json::to_value(&args)
            .map_err(crate::FencelineError::from)
            .and_then(|args| {
                self.queue
                    .send(
                        INDEX_TASK_NAME,
                        &args,
                        &self.queue_name,
                        TaskPriority::Medium,
                        Some(&task_id),
                    )
                    .map_err(crate::FencelineError::from)
            });
        if let Err(e) = submitted {
            self.unwind(&handle, Some(attempt_id), None);
            return Err(e);
        }

        let filled = self
            .storage
            .lock()
            .set_attempt_task_id(attempt_id, &task_id)
            .map_err(crate::FencelineError::from)
            .and_then(|_| self.fences.fill(&handle, attempt_id, &task_id));
        match filled {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("Fence for {} vanished before fill, rolling back", key);
                self.unwind(&handle, Some(attempt_id), Some(&task_id));
                return Ok(None);
            }
            Err(e) => {
                self.unwind(&handle, Some(attempt_id), Some(&task_id));
                return Err(e);
            }
        }

        tracing::info!(
            "Created attempt {} for source {} generation {} (task {}, from_beginning={})",
            attempt_id,
            source.name,
            generation_id,
            task_id,
            from_beginning
        );
        Ok(Some(attempt_id))
    }

    /// Undoes a partially created run
    ///
    /// Best effort: each step is attempted even if an earlier one fails, and any
    /// leftover fence is reconciled by the validator.
    fn unwind(&self, handle: &FenceHandle, attempt_id: Option<i64>, task_id: Option<&str>) {
        if let Some(task_id) = task_id {
            if let Err(e) = self.queue.revoke(task_id) {
                tracing::warn!("Failed to revoke task {}: {}", task_id, e);
            }
        }
        if let Some(attempt_id) = attempt_id {
            if let Err(e) = self.storage.lock().delete_attempt(attempt_id) {
                tracing::warn!("Failed to delete attempt {}: {}", attempt_id, e);
            }
        }
        if let Err(e) = self.fences.release(handle) {
            tracing::warn!("Failed to release fence for {}: {}", handle.key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCache;
    use crate::queue::SqliteTaskQueue;
    use crate::state::{AttemptStatus, SourceStatus};
    use crate::storage::SqliteStorage;
    use parking_lot::Mutex;

    struct Fixture {
        cache: Arc<MemoryCache>,
        storage: SharedStorage,
        queue: Arc<SqliteTaskQueue>,
        scheduler: RunScheduler,
        key: RunKey,
    }

    fn fixture(refresh: Option<i64>) -> Fixture {
        let mut sqlite = SqliteStorage::new_in_memory().unwrap();
        let source_id = sqlite
            .upsert_source(&SourceDefinition {
                name: "docs".to_string(),
                connector_id: "directory".to_string(),
                credential_id: "local".to_string(),
                root: "/tmp".to_string(),
                refresh_freq_secs: refresh,
                paused: false,
            })
            .unwrap();
        sqlite.upsert_generation(1, GenerationStatus::Present).unwrap();

        let cache = Arc::new(MemoryCache::new());
        let storage: SharedStorage = Arc::new(Mutex::new(sqlite));
        let queue = Arc::new(SqliteTaskQueue::open_in_memory().unwrap());
        let fences = FenceManager::new(cache.clone(), Duration::from_secs(60));
        let scheduler = RunScheduler::new(storage.clone(), fences, queue.clone())
            .with_lock_timeout(Duration::from_secs(2));
        Fixture {
            cache,
            storage,
            queue,
            scheduler,
            key: RunKey::new(source_id, 1),
        }
    }

    #[test]
    fn test_maybe_start_creates_fenced_queued_attempt() {
        let fx = fixture(Some(3600));
        let attempt_id = fx.scheduler.maybe_start(fx.key).unwrap().unwrap();

        let attempt = fx.storage.lock().get_attempt(attempt_id).unwrap();
        assert_eq!(attempt.status, AttemptStatus::NotStarted);
        let task_id = attempt.task_id.unwrap();
        assert!(fx.queue.list_pending("connector_indexing").unwrap().contains(&task_id));

        let fences = FenceManager::new(fx.cache.clone(), Duration::from_secs(60));
        let payload = fences.load(fx.key).unwrap().unwrap().payload.unwrap();
        assert_eq!(payload.attempt_id, attempt_id);
        assert_eq!(payload.task_id, task_id);

        // Fenced: a second call creates nothing
        assert!(fx.scheduler.maybe_start(fx.key).unwrap().is_none());
    }

    #[test]
    fn test_busy_lock_skips_creation() {
        let fx = fixture(Some(3600));
        let other = CacheLock::new(fx.cache.clone(), CREATE_LOCK, Duration::from_secs(30));
        assert!(other.try_acquire().unwrap());

        let scheduler = RunScheduler::new(
            fx.storage.clone(),
            FenceManager::new(fx.cache.clone(), Duration::from_secs(60)),
            fx.queue.clone(),
        )
        .with_lock_timeout(Duration::from_millis(200));
        assert!(scheduler.maybe_start(fx.key).unwrap().is_none());
    }

    #[test]
    fn test_cache_outage_unwinds_attempt() {
        let fx = fixture(Some(3600));
        let source = fx.storage.lock().get_source(fx.key.source_id).unwrap();
        fx.cache.set_available(false);

        assert!(fx.scheduler.try_create_run(&source, 1, false).is_err());
        fx.cache.set_available(true);
        assert!(fx.storage.lock().get_last_attempt(fx.key).unwrap().is_none());
    }

    #[test]
    fn test_paused_source_is_skipped() {
        let fx = fixture(Some(3600));
        fx.storage
            .lock()
            .set_source_status(fx.key.source_id, SourceStatus::Paused)
            .unwrap();
        assert!(fx.scheduler.maybe_start(fx.key).unwrap().is_none());
    }

    #[test]
    fn test_manual_trigger_is_consumed() {
        let fx = fixture(Some(3600));
        fx.scheduler.trigger("docs", true).unwrap();

        let attempt_id = fx.scheduler.maybe_start(fx.key).unwrap().unwrap();
        let storage = fx.storage.lock();
        assert!(storage.get_attempt(attempt_id).unwrap().from_beginning);
        assert!(storage
            .get_source(fx.key.source_id)
            .unwrap()
            .indexing_trigger
            .is_none());
    }

    #[test]
    fn test_repeated_failures_set_error_state() {
        let fx = fixture(None);
        {
            let mut storage = fx.storage.lock();
            let id = storage.create_attempt(fx.key, false).unwrap();
            storage.mark_attempt_in_progress(id).unwrap();
            storage.finish_attempt(id, AttemptStatus::Failed, Some("boom")).unwrap();
        }

        let report = fx.scheduler.check_for_indexing().unwrap();
        assert!(report.started.is_empty());
        assert!(
            fx.storage
                .lock()
                .get_source(fx.key.source_id)
                .unwrap()
                .in_repeated_error_state
        );
    }
}
