//! At most one live run per (source, generation)

use crate::support::{source_definition, Harness, QUEUE};
use fenceline::coordination::SqliteCache;
use fenceline::fence::FenceManager;
use fenceline::queue::{SqliteTaskQueue, TaskQueue};
use fenceline::scheduler::RunScheduler;
use fenceline::state::{AttemptStatus, GenerationStatus, RunKey};
use fenceline::storage::{AttemptStore, SharedStorage, SqliteStorage};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tempfile::TempDir;

const CONTENDERS: usize = 8;

#[test]
fn test_concurrent_maybe_start_creates_one_run() {
    let h = Harness::new();
    let scheduler = h.scheduler();
    let barrier = Barrier::new(CONTENDERS);

    let results: Vec<Option<i64>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..CONTENDERS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    scheduler.maybe_start(h.key).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let started: Vec<i64> = results.into_iter().flatten().collect();
    assert_eq!(started.len(), 1, "exactly one contender wins");

    let attempts = h.storage.lock().get_recent_attempts(h.key, 10).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].id, started[0]);
    assert_eq!(attempts[0].status, AttemptStatus::NotStarted);
    assert_eq!(h.queue.list_pending(QUEUE).unwrap().len(), 1);

    let payload = h.fences.load(h.key).unwrap().unwrap().payload.unwrap();
    assert_eq!(payload.attempt_id, started[0]);
    assert_eq!(attempts[0].task_id.as_deref(), Some(payload.task_id.as_str()));
}

/// One scheduler process: its own connections to the shared files
struct Process {
    scheduler: RunScheduler,
    storage: SharedStorage,
    queue: Arc<SqliteTaskQueue>,
}

fn open_process(dir: &TempDir) -> Process {
    let storage: SharedStorage = Arc::new(Mutex::new(
        SqliteStorage::new(&dir.path().join("fenceline.db")).unwrap(),
    ));
    let cache = Arc::new(SqliteCache::open(&dir.path().join("cache.db")).unwrap());
    let queue = Arc::new(SqliteTaskQueue::open(&dir.path().join("queue.db")).unwrap());
    let fences = FenceManager::new(cache, Duration::from_secs(60));
    let broker: Arc<dyn TaskQueue> = queue.clone();

    Process {
        scheduler: RunScheduler::new(storage.clone(), fences, broker),
        storage,
        queue,
    }
}

#[test]
fn test_schedulers_on_separate_connections_agree() {
    let dir = TempDir::new().unwrap();
    let first = open_process(&dir);
    let second = open_process(&dir);

    let key = {
        let mut storage = first.storage.lock();
        let source_id = storage
            .upsert_source(&source_definition("wiki", "directory", "/srv/wiki"))
            .unwrap();
        storage.upsert_generation(1, GenerationStatus::Present).unwrap();
        RunKey::new(source_id, 1)
    };

    let barrier = Barrier::new(2);
    let (a, b) = std::thread::scope(|scope| {
        let a = scope.spawn(|| {
            barrier.wait();
            first.scheduler.maybe_start(key).unwrap()
        });
        let b = scope.spawn(|| {
            barrier.wait();
            second.scheduler.maybe_start(key).unwrap()
        });
        (a.join().unwrap(), b.join().unwrap())
    });

    assert!(a.is_some() ^ b.is_some(), "got {:?} and {:?}", a, b);
    assert_eq!(
        second.storage.lock().get_recent_attempts(key, 10).unwrap().len(),
        1
    );
    assert_eq!(first.queue.list_pending(QUEUE).unwrap().len(), 1);

    // Neither process may start another while the fence stands
    assert_eq!(first.scheduler.maybe_start(key).unwrap(), None);
    assert_eq!(second.scheduler.maybe_start(key).unwrap(), None);
}

#[test]
fn test_manual_trigger_waits_for_live_run() {
    let h = Harness::new();
    let scheduler = h.scheduler();

    let first = scheduler.maybe_start(h.key).unwrap().unwrap();
    scheduler.trigger("fake", true).unwrap();

    // The trigger is honored only after the fenced run ends
    assert_eq!(scheduler.maybe_start(h.key).unwrap(), None);
    assert_eq!(h.storage.lock().get_recent_attempts(h.key, 10).unwrap().len(), 1);
    assert_eq!(h.attempt(first).status, AttemptStatus::NotStarted);
}
