use crate::checkpoint::CheckpointLedger;
use crate::config::WorkerConfig;
use crate::connector::{
    build_source, Item, PollWindow, RetrievalMode, RetryPolicy, ScopedFailure, Source, StageSpec,
};
use crate::crawler::{
    CrawlCheckpoint, CrawlObserver, CrawlOptions, CrawlOutcome, CrawlStateMachine,
};
use crate::fence::{fence_key, FenceGuard, FenceManager};
use crate::output::{DocumentSink, JsonlSink};
use crate::queue::{SqliteTaskQueue, TaskMessage};
use crate::state::{AttemptStatus, RunKey, SourceStatus};
use crate::storage::{AttemptRecord, AttemptStore, FailureRecord, SharedStorage, SourceRecord};
use crate::worker::supervisor::WorkerSupervisor;
use crate::worker::{IndexTaskArgs, INDEX_TASK_NAME};
use crate::FencelineError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

/// Builds the connector for a source
pub type SourceFactory =
    Arc<dyn Fn(&SourceRecord) -> crate::Result<Box<dyn Source>> + Send + Sync>;

/// Opens the document sink for a run
pub type SinkFactory =
    Arc<dyn Fn(&SourceRecord, RunKey) -> crate::Result<Box<dyn DocumentSink>> + Send + Sync>;

/// How a delivered task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The attempt was no longer NOT_STARTED; another delivery owns it
    Skipped,
    /// The attempt reached a terminal status and the fence was released
    Finished {
        attempt_id: i64,
        status: AttemptStatus,
    },
    /// A checkpoint write failed; the attempt and fence are left for the validator
    Abandoned { attempt_id: i64 },
}

/// Runs indexing tasks delivered by the task queue
pub struct IndexingWorker {
    storage: SharedStorage,
    fences: FenceManager,
    ledger: Arc<CheckpointLedger>,
    config: WorkerConfig,
    poll_offset: ChronoDuration,
    source_factory: SourceFactory,
    sink_factory: SinkFactory,
}

impl IndexingWorker {
    /// Creates a worker using the configured connectors and JSONL output
    ///
    /// # Arguments
    ///
    /// * `storage` - Attempt database
    /// * `fences` - Fence manager over the coordination cache
    /// * `ledger` - Checkpoint ledger for saving and resuming progress
    /// * `config` - Worker tuning, retry policy, and output directory
    /// * `poll_offset_minutes` - Overlap subtracted from the last successful window end
    pub fn new(
        storage: SharedStorage,
        fences: FenceManager,
        ledger: Arc<CheckpointLedger>,
        config: WorkerConfig,
        poll_offset_minutes: i64,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config);
        let source_factory: SourceFactory =
            Arc::new(move |record: &SourceRecord| Ok(build_source(record, policy)?));

        let output_dir = PathBuf::from(&config.output_dir);
        let sink_factory: SinkFactory = Arc::new(move |record: &SourceRecord, key: RunKey| {
            let sink = JsonlSink::create(&output_dir, &record.name, key)?;
            Ok(Box::new(sink) as Box<dyn DocumentSink>)
        });

        Self {
            storage,
            fences,
            ledger,
            config,
            poll_offset: ChronoDuration::minutes(poll_offset_minutes),
            source_factory,
            sink_factory,
        }
    }

    pub fn with_source_factory(mut self, factory: SourceFactory) -> Self {
        self.source_factory = factory;
        self
    }

    pub fn with_sink_factory(mut self, factory: SinkFactory) -> Self {
        self.sink_factory = factory;
        self
    }

    /// Reserves and runs the next task from the queue, acknowledging it afterwards
    ///
    /// Tasks are acknowledged whatever the outcome: a failed attempt is recorded in
    /// storage, and anything left unrecorded is the validator's to reconcile.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(TaskOutcome))` - A task was handled
    /// * `Ok(None)` - Nothing was pending
    /// * `Err(FencelineError)` - The task failed before reaching an outcome
    pub fn poll_once(
        &self,
        queue: &SqliteTaskQueue,
        queue_name: &str,
        worker_id: &str,
    ) -> crate::Result<Option<TaskOutcome>> {
        let Some(task) = queue.reserve_next(queue_name, worker_id)? else {
            return Ok(None);
        };

        if task.name != INDEX_TASK_NAME {
            tracing::warn!("Dropping task {} with unknown name '{}'", task.id, task.name);
            queue.ack(&task.id)?;
            return Ok(None);
        }

        let outcome = self.run_task(&task);
        if let Err(e) = &outcome {
            tracing::error!("Task {} failed: {}", task.id, e);
        }
        queue.ack(&task.id)?;
        outcome.map(Some)
    }

    /// Runs one indexing task end to end
    ///
    /// # Arguments
    ///
    /// * `task` - The delivered task; its arguments name the attempt
    ///
    /// # Returns
    ///
    /// * `Ok(TaskOutcome)` - How the attempt ended
    /// * `Err(FencelineError)` - The task never took ownership of the attempt, or
    ///   recording its outcome failed
    pub fn run_task(&self, task: &TaskMessage) -> crate::Result<TaskOutcome> {
        let args: IndexTaskArgs = serde_json::from_value(task.args.clone())
            .map_err(|e| FencelineError::InvalidTask(e.to_string()))?;
        let key = args.key();

        let (handle, payload) = self.fences.wait_for_payload(
            key,
            &task.id,
            Duration::from_secs(self.config.fence_wait_timeout_secs),
        )?;
        if payload.attempt_id != args.attempt_id {
            return Err(FencelineError::FenceMismatch {
                key: fence_key(key),
            });
        }

        if !self.storage.lock().mark_attempt_in_progress(args.attempt_id)? {
            tracing::info!(
                "Attempt {} is no longer NOT_STARTED, skipping task {}",
                args.attempt_id,
                task.id
            );
            return Ok(TaskOutcome::Skipped);
        }
        tracing::info!("Attempt {} started for {}", args.attempt_id, key);

        let guard = FenceGuard::new(&self.fences, handle.clone());
        let result = WorkerSupervisor::start(
            self.fences.clone(),
            handle.clone(),
            Duration::from_secs(self.config.hard_timeout_secs),
        )
        .and_then(|supervisor| {
            let result = self
                .fences
                .mark_started(&handle)
                .and_then(|_| self.execute(&args, &supervisor));
            supervisor.finish();
            result
        });

        self.conclude(&args, result, guard)
    }

    /// Records the terminal status and releases the fence
    fn conclude(
        &self,
        args: &IndexTaskArgs,
        result: crate::Result<CrawlOutcome>,
        guard: FenceGuard<'_>,
    ) -> crate::Result<TaskOutcome> {
        let attempt_id = args.attempt_id;
        let (status, message) = match result {
            Ok(CrawlOutcome::Completed(stats)) if stats.failures > 0 => {
                (AttemptStatus::PartiallySucceeded, None)
            }
            Ok(CrawlOutcome::Completed(_)) => (AttemptStatus::Success, None),
            Ok(CrawlOutcome::Stopped(_)) => {
                (AttemptStatus::Canceled, Some("Canceled by request".to_string()))
            }
            Err(e) if e.is_checkpoint_write_failure() => {
                tracing::error!(
                    "Attempt {} could not write its checkpoint, leaving it for the validator: {}",
                    attempt_id,
                    e
                );
                guard.disarm();
                return Ok(TaskOutcome::Abandoned { attempt_id });
            }
            Err(e) => {
                tracing::error!("Attempt {} failed: {}", attempt_id, e);
                (AttemptStatus::Failed, Some(e.to_string()))
            }
        };

        {
            let mut storage = self.storage.lock();
            storage.finish_attempt(attempt_id, status, message.as_deref())?;
            if status.is_successful() {
                let source = storage.get_source(args.source_id)?;
                if source.status == SourceStatus::InitialIndexing {
                    storage.set_source_status(source.id, SourceStatus::Active)?;
                }
                if source.in_repeated_error_state {
                    storage.set_repeated_error_state(source.id, false)?;
                }
            }
        }
        tracing::info!("Attempt {} finished as {}", attempt_id, status);

        guard.release()?;
        Ok(TaskOutcome::Finished { attempt_id, status })
    }

    fn execute(
        &self,
        args: &IndexTaskArgs,
        supervisor: &WorkerSupervisor,
    ) -> crate::Result<CrawlOutcome> {
        let key = args.key();
        let (record, attempt) = {
            let storage = self.storage.lock();
            (
                storage.get_source(args.source_id)?,
                storage.get_attempt(args.attempt_id)?,
            )
        };

        let (start, end) = self.compute_window(&attempt)?;
        let window = {
            let mut storage = self.storage.lock();
            storage.set_poll_window(attempt.id, start, end)?;
            // Stored precision is what later attempts compare against
            storage
                .get_attempt(attempt.id)?
                .poll_window()
                .unwrap_or((start, end))
        };
        tracing::info!(
            "Attempt {} polls {} from {} to {}",
            attempt.id,
            record.name,
            window.0,
            window.1
        );

        let source = (self.source_factory)(&record)?;
        let machine = CrawlStateMachine::new(
            source.as_ref(),
            CrawlOptions {
                max_workers: self.config.max_crawl_workers,
                checkpoint_every: self.config.checkpoint_every,
                mode: RetrievalMode::Full,
                window: PollWindow::from_datetimes(window.0, window.1),
            },
        );

        let mut checkpoint = if attempt.from_beginning {
            CrawlCheckpoint::new()
        } else {
            match self.ledger.latest_valid_checkpoint(key, window)? {
                Some((_, checkpoint)) if machine.accepts(&checkpoint) => checkpoint,
                Some((previous, _)) => {
                    tracing::warn!(
                        "Checkpoint of attempt {} does not match the stages of {}, starting fresh",
                        previous,
                        record.name
                    );
                    CrawlCheckpoint::new()
                }
                None => CrawlCheckpoint::new(),
            }
        };

        let mut observer = AttemptObserver {
            attempt_id: attempt.id,
            source_id: record.id,
            storage: &self.storage,
            ledger: &self.ledger,
            fences: &self.fences,
            supervisor,
            sink: (self.sink_factory)(&record, key)?,
            failure_threshold: self.config.failure_threshold,
            failure_ratio: self.config.failure_ratio,
            items: 0,
            failures: 0,
            unreported: 0,
        };
        let result = machine.run(&mut checkpoint, &mut observer);

        let (items, failures) = (observer.items, observer.failures);
        if let Err(e) = self
            .storage
            .lock()
            .update_attempt_progress(attempt.id, items, failures)
        {
            tracing::warn!("Failed to record final counters of attempt {}: {}", attempt.id, e);
        }
        tracing::info!(
            "Attempt {} indexed {} documents with {} failures",
            attempt.id,
            items,
            failures
        );
        result
    }

    /// Computes the modification window an attempt covers
    ///
    /// Starts at the last successful window end minus the poll offset, or at the
    /// epoch when reindexing or nothing has succeeded yet. Ends at the previous
    /// attempt's window end if that attempt failed or was canceled, so the retry
    /// covers the same window; otherwise ends now.
    fn compute_window(
        &self,
        attempt: &AttemptRecord,
    ) -> crate::Result<(DateTime<Utc>, DateTime<Utc>)> {
        let key = attempt.key();
        let epoch = DateTime::<Utc>::from(UNIX_EPOCH);
        let storage = self.storage.lock();

        let start = if attempt.from_beginning {
            epoch
        } else {
            storage
                .get_last_successful_attempt(key)?
                .and_then(|last| last.poll_range_end)
                .map(|end| (end - self.poll_offset).max(epoch))
                .unwrap_or(epoch)
        };

        let end = storage
            .get_recent_attempts(key, 2)?
            .into_iter()
            .find(|previous| previous.id != attempt.id)
            .filter(|previous| previous.status.retries_window())
            .and_then(|previous| previous.poll_range_end)
            .unwrap_or_else(Utc::now);

        Ok((start.min(end), end))
    }
}

/// Connects one crawl to the attempt's sink, ledger, and supervisor
struct AttemptObserver<'w> {
    attempt_id: i64,
    source_id: i64,
    storage: &'w SharedStorage,
    ledger: &'w CheckpointLedger,
    fences: &'w FenceManager,
    supervisor: &'w WorkerSupervisor,
    sink: Box<dyn DocumentSink>,
    failure_threshold: u64,
    failure_ratio: f64,
    items: u64,
    failures: u64,
    /// Items not yet added to the cache progress counter
    unreported: u64,
}

impl AttemptObserver<'_> {
    fn check_failure_threshold(&self) -> crate::Result<()> {
        if self.failures <= self.failure_threshold {
            return Ok(());
        }
        let processed = (self.items + self.failures).max(1);
        let ratio = self.failures as f64 / processed as f64;
        if ratio > self.failure_ratio {
            return Err(FencelineError::Aborted(format!(
                "{} of {} documents failed ({:.0}%), above the {:.0}% limit",
                self.failures,
                processed,
                ratio * 100.0,
                self.failure_ratio * 100.0
            )));
        }
        Ok(())
    }
}

impl CrawlObserver for AttemptObserver<'_> {
    fn on_stage(&mut self, stage: &StageSpec) -> crate::Result<()> {
        if !self.fences.set_stage(self.supervisor.handle(), &stage.name)? {
            return Err(FencelineError::LivenessLost(format!(
                "fence for {} was torn down",
                self.supervisor.handle().key
            )));
        }
        tracing::debug!("Attempt {} entered stage {}", self.attempt_id, stage.name);
        Ok(())
    }

    fn on_item(&mut self, item: Item) -> crate::Result<()> {
        self.sink.write(&item)?;
        self.items += 1;
        self.unreported += 1;
        Ok(())
    }

    fn on_failure(&mut self, failure: &ScopedFailure) -> crate::Result<()> {
        self.storage.lock().record_attempt_error(
            self.attempt_id,
            self.source_id,
            &FailureRecord::from(failure),
        )?;
        self.failures += 1;
        self.check_failure_threshold()
    }

    fn persist(&mut self, checkpoint: &CrawlCheckpoint) -> crate::Result<()> {
        // Documents must be durable before a checkpoint claims them
        self.sink.flush()?;
        self.ledger.save(self.attempt_id, checkpoint)?;
        self.storage
            .lock()
            .update_attempt_progress(self.attempt_id, self.items, self.failures)?;
        if self.unreported > 0 {
            self.supervisor.report_progress(self.unreported)?;
            self.unreported = 0;
        }
        Ok(())
    }

    fn should_stop(&mut self) -> crate::Result<bool> {
        self.supervisor.should_stop()
    }
}
