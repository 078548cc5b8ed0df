//! End-to-end runs from a configuration file through the JSONL output

use fenceline::checkpoint::{CheckpointLedger, FileCheckpointStore};
use fenceline::config::{load_config, Config};
use fenceline::control::Control;
use fenceline::coordination::SqliteCache;
use fenceline::fence::FenceManager;
use fenceline::output::load_statistics;
use fenceline::queue::{SqliteTaskQueue, TaskQueue};
use fenceline::scheduler::RunScheduler;
use fenceline::state::{AttemptStatus, SourceStatus};
use fenceline::storage::{open_shared, AttemptStore, SharedStorage};
use fenceline::validator::RunValidator;
use fenceline::worker::{IndexingWorker, TaskOutcome};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Every long-lived component, opened the way the binary opens them
struct Deployment {
    config: Config,
    storage: SharedStorage,
    fences: FenceManager,
    queue: Arc<SqliteTaskQueue>,
    ledger: Arc<CheckpointLedger>,
    output_dir: PathBuf,
    _dir: TempDir,
}

impl Deployment {
    fn scheduler(&self) -> RunScheduler {
        let queue: Arc<dyn TaskQueue> = self.queue.clone();
        RunScheduler::new(self.storage.clone(), self.fences.clone(), queue)
            .with_config(self.config.scheduler.clone())
            .with_queue_name(self.config.queue.name.clone())
            .with_lock_timeout(self.config.coordination.lock_timeout())
    }

    fn validator(&self) -> RunValidator {
        let queue: Arc<dyn TaskQueue> = self.queue.clone();
        RunValidator::new(
            self.storage.clone(),
            self.fences.clone(),
            queue,
            self.config.queue.name.clone(),
            self.config.coordination.lock_timeout(),
        )
    }

    fn worker(&self) -> IndexingWorker {
        IndexingWorker::new(
            self.storage.clone(),
            self.fences.clone(),
            self.ledger.clone(),
            self.config.worker.clone(),
            self.config.scheduler.poll_offset_minutes,
        )
    }

    fn poll(&self) -> Option<TaskOutcome> {
        self.worker()
            .poll_once(&self.queue, &self.config.queue.name, "worker-1")
            .unwrap()
    }
}

fn write_docs(root: &Path) {
    fs::create_dir_all(root.join("team")).unwrap();
    fs::write(root.join("readme.txt"), "start here").unwrap();
    fs::write(root.join("team/notes.txt"), "monday notes").unwrap();
    fs::write(root.join("team/plan.txt"), "the plan").unwrap();
}

fn deploy() -> Deployment {
    let dir = TempDir::new().unwrap();
    let docs = dir.path().join("docs");
    write_docs(&docs);
    let at = |name: &str| dir.path().join(name).display().to_string();

    let toml = format!(
        r#"
[coordination]
cache-path = "{cache}"
liveness-ttl-secs = 30

[storage]
database-path = "{db}"
checkpoint-dir = "{checkpoints}"

[queue]
database-path = "{queue}"

[worker]
output-dir = "{output}"
fence-wait-timeout-secs = 5

[[source]]
name = "team-notes"
connector = "directory"
credential = "local"
root = "{docs}"

[[generation]]
id = 1
status = "present"
"#,
        cache = at("cache.db"),
        db = at("fenceline.db"),
        checkpoints = at("checkpoints"),
        queue = at("queue.db"),
        output = at("out"),
        docs = docs.display(),
    );
    let config_path = dir.path().join("fenceline.toml");
    fs::write(&config_path, toml).unwrap();
    let config = load_config(&config_path).unwrap();

    let storage = open_shared(Path::new(&config.storage.database_path)).unwrap();
    let cache = Arc::new(SqliteCache::open(Path::new(&config.coordination.cache_path)).unwrap());
    let queue = Arc::new(SqliteTaskQueue::open(Path::new(&config.queue.database_path)).unwrap());
    let store = Arc::new(FileCheckpointStore::new(&config.storage.checkpoint_dir).unwrap());
    let ledger = Arc::new(CheckpointLedger::new(
        store,
        storage.clone(),
        config.storage.checkpoint_size_limit,
    ));
    let fences = FenceManager::new(cache, config.coordination.liveness_ttl());

    Deployment {
        output_dir: PathBuf::from(&config.worker.output_dir),
        config,
        storage,
        fences,
        queue,
        ledger,
        _dir: dir,
    }
}

fn output_lines(dir: &Path) -> Vec<serde_json::Value> {
    let mut lines = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let content = fs::read_to_string(entry.unwrap().path()).unwrap();
        lines.extend(
            content
                .lines()
                .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()),
        );
    }
    lines
}

#[test]
fn test_configured_source_is_indexed_end_to_end() {
    let d = deploy();
    let scheduler = d.scheduler();
    assert_eq!(scheduler.sync_config(&d.config).unwrap(), 1);

    let report = scheduler.check_for_indexing().unwrap();
    assert_eq!(report.started.len(), 1);
    let attempt_id = report.started[0];

    assert_eq!(
        d.poll(),
        Some(TaskOutcome::Finished {
            attempt_id,
            status: AttemptStatus::Success
        })
    );
    assert_eq!(d.poll(), None);

    let mut ids: Vec<String> = output_lines(&d.output_dir)
        .iter()
        .map(|doc| doc["id"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["readme.txt", "team/notes.txt", "team/plan.txt"]);

    let storage = d.storage.lock();
    let attempt = storage.get_attempt(attempt_id).unwrap();
    assert_eq!(attempt.total_docs_indexed, 3);
    assert!(attempt.poll_window().is_some());
    let source = storage.get_source_by_name("team-notes").unwrap().unwrap();
    assert_eq!(source.status, SourceStatus::Active);

    let stats = load_statistics(&*storage).unwrap();
    assert_eq!(stats.count(AttemptStatus::Success), 1);
    assert_eq!(stats.total_attempts, 1);
}

#[test]
fn test_finished_run_leaves_nothing_to_reconcile() {
    let d = deploy();
    let scheduler = d.scheduler();
    scheduler.sync_config(&d.config).unwrap();
    let attempt_id = scheduler.check_for_indexing().unwrap().started[0];
    d.poll().unwrap();

    let report = d.validator().sweep().unwrap();
    assert_eq!(report.orphans_reconciled + report.unfenced_reconciled, 0);

    let status = Control::new(d.storage.clone(), d.fences.clone())
        .get_status(attempt_id)
        .unwrap();
    assert!(!status.fenced);
    assert_eq!(status.attempt.status, AttemptStatus::Success);

    // Sources without a refresh interval are indexed once
    assert!(scheduler.check_for_indexing().unwrap().started.is_empty());
}

#[test]
fn test_reindex_trigger_starts_from_the_beginning() {
    let d = deploy();
    let scheduler = d.scheduler();
    scheduler.sync_config(&d.config).unwrap();
    scheduler.check_for_indexing().unwrap();
    d.poll().unwrap();

    scheduler.trigger("team-notes", true).unwrap();
    let started = scheduler.check_for_indexing().unwrap().started;
    assert_eq!(started.len(), 1);
    assert!(d.storage.lock().get_attempt(started[0]).unwrap().from_beginning);

    let Some(TaskOutcome::Finished { status, .. }) = d.poll() else {
        panic!("reindex task was not run");
    };
    assert_eq!(status, AttemptStatus::Success);

    // The reindex appends every document again
    assert_eq!(output_lines(&d.output_dir).len(), 6);
    let window = d.storage.lock().get_attempt(started[0]).unwrap().poll_window().unwrap();
    assert_eq!(window.0.timestamp(), 0);
}

#[tokio::test]
async fn test_passes_share_handles_across_blocking_tasks() {
    let d = Arc::new(deploy());

    let beat = d.clone();
    let started = tokio::task::spawn_blocking(move || {
        let scheduler = beat.scheduler();
        scheduler.sync_config(&beat.config)?;
        scheduler.check_for_indexing()
    })
    .await
    .unwrap()
    .unwrap()
    .started;
    assert_eq!(started.len(), 1);

    let work = d.clone();
    let sweep = d.clone();
    let (outcome, report) = tokio::join!(
        tokio::task::spawn_blocking(move || work.poll()),
        tokio::task::spawn_blocking(move || sweep.validator().sweep()),
    );
    assert!(matches!(
        outcome.unwrap(),
        Some(TaskOutcome::Finished { status: AttemptStatus::Success, .. })
    ));
    // A sweep racing the worker must never reconcile a live run
    assert_eq!(report.unwrap().unwrap().orphans_reconciled, 0);
    assert_eq!(
        d.storage.lock().get_attempt(started[0]).unwrap().status,
        AttemptStatus::Success
    );
}
