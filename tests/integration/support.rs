//! Shared fixtures for the integration tests

#![allow(dead_code)]

use fenceline::checkpoint::{CheckpointLedger, MemoryCheckpointStore};
use fenceline::config::WorkerConfig;
use fenceline::connector::{
    Item, Page, PageRequest, Retrieved, ScopedFailure, Source, SourceError, StageSpec,
};
use fenceline::coordination::MemoryCache;
use fenceline::crawler::{CrawlCheckpoint, CrawlObserver};
use fenceline::fence::FenceManager;
use fenceline::output::{DocumentSink, MemorySink};
use fenceline::queue::{SqliteTaskQueue, TaskQueue};
use fenceline::scheduler::RunScheduler;
use fenceline::state::{GenerationStatus, RunKey};
use fenceline::storage::{
    AttemptRecord, AttemptStore, SharedStorage, SourceDefinition, SourceRecord, SqliteStorage,
};
use fenceline::validator::RunValidator;
use fenceline::worker::IndexingWorker;
use fenceline::FencelineError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const QUEUE: &str = "connector_indexing";
pub const ROOT_STAGE: &str = "root";
pub const FOLDER_STAGE: &str = "folders";

/// Deterministic in-memory source
///
/// Stage `root` is a single container; stage `folders` is partitionable. Item `i`
/// of a container is modified at `i + 1` seconds after the epoch, so every
/// listing is strictly ordered and filters cleanly on a cursor.
pub struct FakeSource {
    root_items: usize,
    containers: BTreeMap<String, usize>,
    page_size: usize,
    /// Fail systemically once this many items have been served
    fail_after: AtomicUsize,
    served: AtomicUsize,
    first_fetches: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn new(root_items: usize, containers: &[(&str, usize)], page_size: usize) -> Self {
        Self {
            root_items,
            containers: containers
                .iter()
                .map(|(name, count)| (name.to_string(), *count))
                .collect(),
            page_size,
            fail_after: AtomicUsize::new(usize::MAX),
            served: AtomicUsize::new(0),
            first_fetches: Mutex::new(Vec::new()),
        }
    }

    /// `n` partitionable containers named `folder-00`.. with `per` items each
    pub fn folders(n: usize, per: usize) -> Self {
        let names: Vec<String> = (0..n).map(|i| format!("folder-{:02}", i)).collect();
        let containers: Vec<(&str, usize)> = names.iter().map(|name| (name.as_str(), per)).collect();
        Self::new(2, &containers, 4)
    }

    pub fn fail_after(&self, served: Option<usize>) {
        self.fail_after
            .store(served.unwrap_or(usize::MAX), Ordering::SeqCst);
        self.served.store(0, Ordering::SeqCst);
    }

    /// Containers in the order their listings were started from the first page
    pub fn first_fetches(&self) -> Vec<String> {
        self.first_fetches.lock().clone()
    }

    /// Every item id the source holds
    pub fn all_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = (0..self.root_items).map(|i| item_id(ROOT_STAGE, i)).collect();
        for (name, count) in &self.containers {
            ids.extend((0..*count).map(|i| item_id(name, i)));
        }
        ids.sort();
        ids
    }

    fn count_for(&self, stage: &str, container: &str) -> Option<usize> {
        if stage == ROOT_STAGE {
            Some(self.root_items)
        } else {
            self.containers.get(container).copied()
        }
    }
}

pub fn item_id(container: &str, index: usize) -> String {
    format!("{}/item-{:03}", container, index)
}

impl Source for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    fn stages(&self) -> Vec<StageSpec> {
        vec![
            StageSpec::new(ROOT_STAGE, false),
            StageSpec::new(FOLDER_STAGE, true),
        ]
    }

    fn discover_containers(&self, stage: &StageSpec) -> Result<Vec<String>, SourceError> {
        if stage.name == FOLDER_STAGE {
            Ok(self.containers.keys().cloned().collect())
        } else {
            Ok(vec![stage.name.clone()])
        }
    }

    fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, SourceError> {
        let count = self
            .count_for(request.stage, request.container)
            .ok_or_else(|| SourceError::Scoped {
                container: request.container.to_string(),
                message: "no such container".to_string(),
            })?;

        if request.page_token.is_none() {
            self.first_fetches.lock().push(request.container.to_string());
        }
        if self.served.load(Ordering::SeqCst) >= self.fail_after.load(Ordering::SeqCst) {
            return Err(SourceError::Systemic("credentials revoked".to_string()));
        }

        let visible: Vec<(usize, f64)> = (0..count)
            .map(|i| (i, (i + 1) as f64))
            .filter(|(_, modified)| request.since.map_or(true, |since| *modified >= since))
            .filter(|(_, modified)| request.window.contains(*modified))
            .collect();

        let offset: usize = request
            .page_token
            .and_then(|token| token.parse().ok())
            .unwrap_or(0);
        let end = (offset + self.page_size).min(visible.len());

        let entries: Vec<Retrieved> = visible[offset.min(end)..end]
            .iter()
            .map(|(i, modified)| {
                Retrieved::Item(Item {
                    id: item_id(request.container, *i),
                    modified: *modified,
                    title: format!("Item {} of {}", i, request.container),
                    link: None,
                    metadata: BTreeMap::new(),
                    content: Some(format!("body {}", i)),
                })
            })
            .collect();
        self.served.fetch_add(entries.len(), Ordering::SeqCst);

        Ok(Page {
            entries,
            next_page_token: (end < visible.len()).then(|| end.to_string()),
        })
    }
}

/// Lets one `FakeSource` be handed to the worker's source factory repeatedly
pub struct SharedSource(pub Arc<FakeSource>);

impl Source for SharedSource {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn stages(&self) -> Vec<StageSpec> {
        self.0.stages()
    }

    fn discover_containers(&self, stage: &StageSpec) -> Result<Vec<String>, SourceError> {
        self.0.discover_containers(stage)
    }

    fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, SourceError> {
        self.0.fetch_page(request)
    }
}

/// Observer that keeps everything in memory
#[derive(Default)]
pub struct Recorder {
    /// `stage:<name>` and item ids, in delivery order
    pub log: Vec<String>,
    pub items: Vec<Item>,
    pub failures: Vec<ScopedFailure>,
    pub persisted: Option<CrawlCheckpoint>,
    pub persists: usize,
    /// Ask to stop once this many items were delivered
    pub stop_after: Option<usize>,
    /// Fail the item after this many were delivered
    pub crash_after: Option<usize>,
}

impl Recorder {
    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }
}

impl CrawlObserver for Recorder {
    fn on_stage(&mut self, stage: &StageSpec) -> fenceline::Result<()> {
        self.log.push(format!("stage:{}", stage.name));
        Ok(())
    }

    fn on_item(&mut self, item: Item) -> fenceline::Result<()> {
        if self.crash_after == Some(self.items.len()) {
            return Err(FencelineError::Aborted("simulated crash".to_string()));
        }
        self.log.push(item.id.clone());
        self.items.push(item);
        Ok(())
    }

    fn on_failure(&mut self, failure: &ScopedFailure) -> fenceline::Result<()> {
        self.failures.push(failure.clone());
        Ok(())
    }

    fn persist(&mut self, checkpoint: &CrawlCheckpoint) -> fenceline::Result<()> {
        self.persisted = Some(checkpoint.clone());
        self.persists += 1;
        Ok(())
    }

    fn should_stop(&mut self) -> fenceline::Result<bool> {
        Ok(self.stop_after.is_some_and(|n| self.items.len() >= n))
    }
}

pub fn source_definition(name: &str, connector: &str, root: &str) -> SourceDefinition {
    SourceDefinition {
        name: name.to_string(),
        connector_id: connector.to_string(),
        credential_id: "test".to_string(),
        root: root.to_string(),
        refresh_freq_secs: None,
        paused: false,
    }
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        max_crawl_workers: 3,
        checkpoint_every: 10,
        fence_wait_timeout_secs: 2,
        ..WorkerConfig::default()
    }
}

/// One source and one present generation over in-memory collaborators
pub struct Harness {
    pub storage: SharedStorage,
    pub cache: Arc<MemoryCache>,
    pub fences: FenceManager,
    pub queue: Arc<SqliteTaskQueue>,
    pub store: Arc<MemoryCheckpointStore>,
    pub ledger: Arc<CheckpointLedger>,
    pub key: RunKey,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Duration::from_secs(60), 1024 * 1024)
    }

    pub fn build(liveness_ttl: Duration, checkpoint_limit: usize) -> Self {
        let mut db = SqliteStorage::new_in_memory().unwrap();
        let source_id = db
            .upsert_source(&source_definition("fake", "fake", "/nowhere"))
            .unwrap();
        db.upsert_generation(1, GenerationStatus::Present).unwrap();

        let storage: SharedStorage = Arc::new(Mutex::new(db));
        let cache = Arc::new(MemoryCache::new());
        let fences = FenceManager::new(cache.clone(), liveness_ttl);
        let store = Arc::new(MemoryCheckpointStore::new());
        let ledger = Arc::new(CheckpointLedger::new(
            store.clone(),
            storage.clone(),
            checkpoint_limit,
        ));

        Self {
            storage,
            cache,
            fences,
            queue: Arc::new(SqliteTaskQueue::open_in_memory().unwrap()),
            store,
            ledger,
            key: RunKey::new(source_id, 1),
        }
    }

    pub fn source(&self) -> SourceRecord {
        self.storage.lock().get_source(self.key.source_id).unwrap()
    }

    pub fn attempt(&self, attempt_id: i64) -> AttemptRecord {
        self.storage.lock().get_attempt(attempt_id).unwrap()
    }

    pub fn scheduler(&self) -> RunScheduler {
        let queue: Arc<dyn TaskQueue> = self.queue.clone();
        RunScheduler::new(self.storage.clone(), self.fences.clone(), queue)
    }

    pub fn validator(&self) -> RunValidator {
        let queue: Arc<dyn TaskQueue> = self.queue.clone();
        RunValidator::new(
            self.storage.clone(),
            self.fences.clone(),
            queue,
            QUEUE,
            Duration::from_secs(30),
        )
    }

    pub fn worker(&self, source: &Arc<FakeSource>, sink: &MemorySink) -> IndexingWorker {
        let source = source.clone();
        let sink = sink.clone();
        IndexingWorker::new(
            self.storage.clone(),
            self.fences.clone(),
            self.ledger.clone(),
            worker_config(),
            5,
        )
        .with_source_factory(Arc::new(move |_: &SourceRecord| {
            Ok(Box::new(SharedSource(source.clone())) as Box<dyn Source>)
        }))
        .with_sink_factory(Arc::new(move |_: &SourceRecord, _: RunKey| {
            Ok(Box::new(sink.clone()) as Box<dyn DocumentSink>)
        }))
    }
}

/// Asserts that `ids` holds no id twice
pub fn assert_unique(ids: &[String]) {
    let mut sorted = ids.to_vec();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), ids.len(), "duplicate ids delivered");
}
