//! Validator reconciliation of runs whose workers went away

use crate::support::{FakeSource, Harness, QUEUE};
use fenceline::coordination::CacheLock;
use fenceline::fence::keys::VALIDATE_LOCK;
use fenceline::output::MemorySink;
use fenceline::state::AttemptStatus;
use fenceline::storage::AttemptStore;
use fenceline::worker::TaskOutcome;
use std::sync::Arc;
use std::time::Duration;

const SHORT_TTL: Duration = Duration::from_millis(60);

fn past_ttl() {
    std::thread::sleep(SHORT_TTL * 3);
}

#[test]
fn test_lost_worker_is_reconciled_and_key_freed() {
    let h = Harness::build(SHORT_TTL, 1024 * 1024);
    let scheduler = h.scheduler();
    let attempt_id = scheduler.maybe_start(h.key).unwrap().unwrap();

    // A worker takes the task and dies without touching the attempt
    let task = h.queue.reserve_next(QUEUE, "doomed").unwrap().unwrap();
    h.queue.ack(&task.id).unwrap();
    past_ttl();

    let report = h.validator().sweep().unwrap();
    assert_eq!(report.orphans_reconciled, 1);

    let attempt = h.attempt(attempt_id);
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert!(attempt.error_msg.unwrap().contains(&task.id));
    assert!(h.fences.load(h.key).unwrap().is_none());

    // The key is free again
    scheduler.trigger("fake", false).unwrap();
    let next = scheduler.maybe_start(h.key).unwrap();
    assert!(next.is_some());
    assert_ne!(next, Some(attempt_id));
}

#[test]
fn test_queued_tasks_keep_their_run_alive() {
    let h = Harness::build(SHORT_TTL, 1024 * 1024);
    let attempt_id = h.scheduler().maybe_start(h.key).unwrap().unwrap();
    let validator = h.validator();

    // Pending in the broker
    past_ttl();
    let report = validator.sweep().unwrap();
    assert_eq!(report.orphans_reconciled, 0);
    assert_eq!(report.fences_checked, 1);

    // Reserved by a worker that has not started yet
    h.queue.reserve_next(QUEUE, "slow").unwrap().unwrap();
    past_ttl();
    let report = validator.sweep().unwrap();
    assert_eq!(report.orphans_reconciled, 0);

    assert_eq!(h.attempt(attempt_id).status, AttemptStatus::NotStarted);
    assert!(h.fences.is_fenced(h.key).unwrap());
    assert!(h.fences.is_alive(h.key).unwrap());
}

#[test]
fn test_abandoned_attempt_fails_after_liveness_lapses() {
    let h = Harness::build(SHORT_TTL, 1024 * 1024);
    let source = Arc::new(FakeSource::folders(2, 5));
    let sink = MemorySink::new();
    let worker = h.worker(&source, &sink);
    let attempt_id = h.scheduler().maybe_start(h.key).unwrap().unwrap();

    h.store.set_fail_writes(true);
    let outcome = worker.poll_once(&h.queue, QUEUE, "w1").unwrap();
    assert_eq!(outcome, Some(TaskOutcome::Abandoned { attempt_id }));
    assert_eq!(h.attempt(attempt_id).status, AttemptStatus::InProgress);
    assert!(h.fences.is_fenced(h.key).unwrap());

    past_ttl();
    let report = h.validator().sweep().unwrap();
    assert_eq!(report.orphans_reconciled, 1);
    assert_eq!(h.attempt(attempt_id).status, AttemptStatus::Failed);
    assert!(!h.fences.is_fenced(h.key).unwrap());
}

#[test]
fn test_active_attempt_without_fence_is_failed() {
    let h = Harness::new();
    let attempt_id = h.storage.lock().create_attempt(h.key, false).unwrap();

    let report = h.validator().sweep().unwrap();
    assert_eq!(report.unfenced_reconciled, 1);

    let attempt = h.attempt(attempt_id);
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert!(attempt.finished_at.is_some());
}

#[test]
fn test_only_one_validator_sweeps_at_a_time() {
    let h = Harness::new();
    let held = CacheLock::new(h.cache.clone(), VALIDATE_LOCK, Duration::from_secs(30));
    assert!(held.try_acquire().unwrap());

    let report = h.validator().sweep().unwrap();
    assert!(report.skipped);
    assert_eq!(report.fences_checked, 0);

    held.release().unwrap();
    assert!(!h.validator().sweep().unwrap().skipped);
}
