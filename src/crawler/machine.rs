//! Crawl state machine with partitioned sub-workers

use crate::connector::{
    Item, PageRequest, PollWindow, RetrievalMode, Retrieved, ScopedFailure, Source, SourceError,
    StageSpec,
};
use crate::crawler::checkpoint::{CrawlCheckpoint, CrawlPhase};
use crate::crawler::claim::ClaimPool;
use crate::crawler::CrawlError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};

/// Entries buffered between sub-workers and the coordinating thread
const EVENT_BUFFER: usize = 256;

/// Tuning for one crawl
#[derive(Debug, Clone, Copy)]
pub struct CrawlOptions {
    pub max_workers: usize,
    /// Persist the checkpoint after this many yielded items
    pub checkpoint_every: usize,
    pub mode: RetrievalMode,
    pub window: PollWindow,
}

/// Receives everything a crawl produces
///
/// All calls happen on the thread that called `CrawlStateMachine::run`, so an
/// implementation needs no internal locking. An error from any callback ends the
/// crawl and is returned from `run`.
pub trait CrawlObserver {
    fn on_stage(&mut self, _stage: &StageSpec) -> crate::Result<()> {
        Ok(())
    }

    fn on_item(&mut self, item: Item) -> crate::Result<()>;

    fn on_failure(&mut self, failure: &ScopedFailure) -> crate::Result<()>;

    fn persist(&mut self, checkpoint: &CrawlCheckpoint) -> crate::Result<()>;

    /// Polled before each item; returning true stops the crawl cleanly
    fn should_stop(&mut self) -> crate::Result<bool>;
}

/// Counters for one call to `run`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlStats {
    pub items: u64,
    pub duplicates: u64,
    pub failures: u64,
    pub containers_completed: u64,
    pub containers_failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// Every stage drained
    Completed(CrawlStats),
    /// The observer asked to stop; the persisted checkpoint resumes the crawl
    Stopped(CrawlStats),
}

impl CrawlOutcome {
    pub fn stats(&self) -> CrawlStats {
        match self {
            Self::Completed(stats) | Self::Stopped(stats) => *stats,
        }
    }
}

enum WorkerEvent {
    Claimed(String),
    Entry { container: String, entry: Retrieved },
    Finished { container: String, error: Option<String> },
    Systemic(String),
}

enum StageFlow {
    Drained,
    Stopped,
}

enum ContainerEnd {
    Finished,
    Halted,
}

/// Aborts the pool if a sub-worker unwinds so its siblings stop waiting
struct AbortOnPanic<'a> {
    pool: &'a ClaimPool,
    halt: &'a AtomicBool,
}

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.halt.store(true, Ordering::SeqCst);
            self.pool.abort();
        }
    }
}

/// Drives a source through its stages
///
/// Containers of a partitionable stage are crawled by up to `max_workers` scoped
/// threads. Sub-workers only fetch pages; the checkpoint and the observer stay on
/// the calling thread, which de-duplicates entries and persists progress.
pub struct CrawlStateMachine<'s> {
    source: &'s dyn Source,
    options: CrawlOptions,
    stages: Vec<StageSpec>,
}

impl<'s> CrawlStateMachine<'s> {
    pub fn new(source: &'s dyn Source, options: CrawlOptions) -> Self {
        Self {
            stages: source.stages(),
            source,
            options,
        }
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Returns true if the checkpoint was produced by a source with the same stages
    pub fn accepts(&self, checkpoint: &CrawlCheckpoint) -> bool {
        self.check_compatible(checkpoint).is_ok()
    }

    fn check_compatible(&self, checkpoint: &CrawlCheckpoint) -> Result<(), CrawlError> {
        if let CrawlPhase::Stage { index, name } = &checkpoint.phase {
            if self.stages.get(*index).map(|stage| &stage.name) != Some(name) {
                return Err(CrawlError::IncompatibleCheckpoint {
                    index: *index,
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Runs the crawl from `checkpoint` until it is done or the observer stops it
    ///
    /// # Arguments
    ///
    /// * `checkpoint` - Progress to resume from; updated in place
    /// * `observer` - Receives items, failures, and checkpoints
    ///
    /// # Returns
    ///
    /// * `Ok(CrawlOutcome)` - The crawl completed or stopped cleanly
    /// * `Err(FencelineError)` - A systemic source failure or an observer error
    pub fn run(
        &self,
        checkpoint: &mut CrawlCheckpoint,
        observer: &mut dyn CrawlObserver,
    ) -> crate::Result<CrawlOutcome> {
        self.check_compatible(checkpoint)?;
        let mut stats = CrawlStats::default();

        if checkpoint.phase == CrawlPhase::Start {
            checkpoint.advance(&self.stages)?;
            observer.persist(checkpoint)?;
        }

        while let CrawlPhase::Stage { index, .. } = checkpoint.phase {
            let stage = self.stages[index].clone();
            observer.on_stage(&stage)?;

            if observer.should_stop()? {
                observer.persist(checkpoint)?;
                return Ok(CrawlOutcome::Stopped(stats));
            }

            if checkpoint.containers.is_none() {
                let containers = self
                    .source
                    .discover_containers(&stage)
                    .map_err(|e| CrawlError::Systemic(e.to_string()))?;
                tracing::info!(
                    "Stage {} of {}: {} containers",
                    stage.name,
                    self.source.name(),
                    containers.len()
                );
                checkpoint.containers = Some(containers);
                observer.persist(checkpoint)?;
            }

            match self.run_stage(&stage, checkpoint, observer, &mut stats)? {
                StageFlow::Drained => {
                    checkpoint.advance(&self.stages)?;
                    observer.persist(checkpoint)?;
                }
                StageFlow::Stopped => {
                    observer.persist(checkpoint)?;
                    return Ok(CrawlOutcome::Stopped(stats));
                }
            }
        }

        Ok(CrawlOutcome::Completed(stats))
    }

    fn run_stage(
        &self,
        stage: &StageSpec,
        checkpoint: &mut CrawlCheckpoint,
        observer: &mut dyn CrawlObserver,
        stats: &mut CrawlStats,
    ) -> crate::Result<StageFlow> {
        let containers = checkpoint.containers.clone().unwrap_or_default();
        let remaining = containers
            .iter()
            .filter(|id| !checkpoint.completed.contains(*id))
            .count();
        if remaining == 0 {
            return Ok(StageFlow::Drained);
        }

        let workers = if stage.partitionable {
            self.options.max_workers.clamp(1, remaining)
        } else {
            1
        };

        let cursors: BTreeMap<String, Option<f64>> = checkpoint
            .in_progress
            .iter()
            .map(|(id, progress)| (id.clone(), progress.cursor))
            .collect();
        let pool = ClaimPool::new(&containers, &checkpoint.completed, cursors.keys().cloned());
        let halt = AtomicBool::new(false);

        tracing::debug!(
            "Crawling stage {} with {} workers over {} containers",
            stage.name,
            workers,
            remaining
        );

        let (flow, panicked) = std::thread::scope(|scope| {
            let (tx, rx) = mpsc::sync_channel::<WorkerEvent>(EVENT_BUFFER);
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let tx = tx.clone();
                    let (pool, halt, cursors) = (&pool, &halt, &cursors);
                    scope.spawn(move || self.sub_worker(stage, pool, halt, cursors, tx))
                })
                .collect();
            drop(tx);

            let flow = self.coordinate(stage, &rx, checkpoint, observer, stats);
            if !matches!(flow, Ok(StageFlow::Drained)) {
                halt.store(true, Ordering::SeqCst);
                pool.abort();
            }
            drop(rx);

            let panicked = handles
                .into_iter()
                .map(|handle| handle.join())
                .filter(|joined| joined.is_err())
                .count();
            (flow, panicked)
        });

        if panicked > 0 {
            tracing::error!("{} sub-workers panicked in stage {}", panicked, stage.name);
            return Err(CrawlError::WorkerPanicked.into());
        }

        let flow = flow?;
        if matches!(flow, StageFlow::Drained) && !pool.is_drained() {
            return Err(CrawlError::StageIncomplete(stage.name.clone()).into());
        }
        Ok(flow)
    }

    /// Applies sub-worker events to the checkpoint and the observer
    fn coordinate(
        &self,
        stage: &StageSpec,
        rx: &Receiver<WorkerEvent>,
        checkpoint: &mut CrawlCheckpoint,
        observer: &mut dyn CrawlObserver,
        stats: &mut CrawlStats,
    ) -> crate::Result<StageFlow> {
        let mut since_persist = 0usize;

        for event in rx.iter() {
            match event {
                WorkerEvent::Claimed(container) => {
                    checkpoint.in_progress.entry(container).or_default();
                }
                WorkerEvent::Entry {
                    container,
                    entry: Retrieved::Item(item),
                } => {
                    if observer.should_stop()? {
                        return Ok(StageFlow::Stopped);
                    }
                    let progress = checkpoint.in_progress.entry(container).or_default();
                    if !progress.observe(&item.id, item.modified) {
                        stats.duplicates += 1;
                        continue;
                    }
                    observer.on_item(item)?;
                    stats.items += 1;
                    since_persist += 1;
                    if since_persist >= self.options.checkpoint_every {
                        observer.persist(checkpoint)?;
                        since_persist = 0;
                    }
                }
                WorkerEvent::Entry {
                    entry: Retrieved::Failure(failure),
                    ..
                } => {
                    stats.failures += 1;
                    observer.on_failure(&failure)?;
                }
                WorkerEvent::Finished { container, error } => {
                    let progress = checkpoint.in_progress.remove(&container);
                    if let Some(message) = error {
                        tracing::warn!(
                            "Container {} in stage {} failed: {}",
                            container,
                            stage.name,
                            message
                        );
                        let start = progress
                            .and_then(|p| p.cursor)
                            .unwrap_or(self.options.window.start);
                        let failure = ScopedFailure::Container {
                            id: container.clone(),
                            message,
                            missed_range: Some((start, self.options.window.end)),
                        };
                        stats.failures += 1;
                        stats.containers_failed += 1;
                        observer.on_failure(&failure)?;
                        checkpoint.failed.insert(container.clone());
                    } else {
                        stats.containers_completed += 1;
                    }
                    checkpoint.completed.insert(container);
                    observer.persist(checkpoint)?;
                    since_persist = 0;
                }
                WorkerEvent::Systemic(message) => {
                    tracing::error!("Systemic failure in stage {}: {}", stage.name, message);
                    observer.persist(checkpoint)?;
                    return Err(CrawlError::Systemic(message).into());
                }
            }
        }

        Ok(StageFlow::Drained)
    }

    fn sub_worker(
        &self,
        stage: &StageSpec,
        pool: &ClaimPool,
        halt: &AtomicBool,
        cursors: &BTreeMap<String, Option<f64>>,
        tx: SyncSender<WorkerEvent>,
    ) {
        let _guard = AbortOnPanic { pool, halt };

        while let Some(claim) = pool.claim() {
            let container = claim.container;
            if halt.load(Ordering::SeqCst)
                || tx.send(WorkerEvent::Claimed(container.clone())).is_err()
            {
                pool.release(&container);
                return;
            }

            let since = cursors.get(&container).copied().flatten();
            match self.crawl_container(stage, &container, since, halt, &tx) {
                Ok(ContainerEnd::Finished) => {
                    let _ = tx.send(WorkerEvent::Finished {
                        container: container.clone(),
                        error: None,
                    });
                    pool.complete(&container);
                }
                Ok(ContainerEnd::Halted) => {
                    pool.release(&container);
                    return;
                }
                Err(SourceError::Systemic(message)) => {
                    let _ = tx.send(WorkerEvent::Systemic(message));
                    pool.abort();
                    return;
                }
                Err(error) => {
                    let _ = tx.send(WorkerEvent::Finished {
                        container: container.clone(),
                        error: Some(error.to_string()),
                    });
                    pool.complete(&container);
                }
            }
        }
    }

    fn crawl_container(
        &self,
        stage: &StageSpec,
        container: &str,
        since: Option<f64>,
        halt: &AtomicBool,
        tx: &SyncSender<WorkerEvent>,
    ) -> Result<ContainerEnd, SourceError> {
        let mut page_token: Option<String> = None;

        loop {
            if halt.load(Ordering::SeqCst) {
                return Ok(ContainerEnd::Halted);
            }

            let page = self.source.fetch_page(&PageRequest {
                stage: &stage.name,
                container,
                since,
                window: self.options.window,
                mode: self.options.mode,
                page_token: page_token.as_deref(),
            })?;

            for entry in page.entries {
                let event = WorkerEvent::Entry {
                    container: container.to_string(),
                    entry,
                };
                if tx.send(event).is_err() {
                    return Ok(ContainerEnd::Halted);
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(ContainerEnd::Finished),
            }
        }
    }
}
