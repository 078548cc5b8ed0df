//! Partitioned crawling and resumption from persisted checkpoints

use crate::support::{assert_unique, item_id, FakeSource, Harness, Recorder, FOLDER_STAGE, QUEUE};
use fenceline::connector::{PollWindow, RetrievalMode};
use fenceline::crawler::{CrawlCheckpoint, CrawlOptions, CrawlOutcome, CrawlStateMachine};
use fenceline::output::MemorySink;
use fenceline::state::AttemptStatus;
use fenceline::worker::TaskOutcome;
use std::sync::Arc;

fn options(max_workers: usize, checkpoint_every: usize) -> CrawlOptions {
    CrawlOptions {
        max_workers,
        checkpoint_every,
        mode: RetrievalMode::Full,
        window: PollWindow::everything(),
    }
}

fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}

#[test]
fn test_every_container_is_claimed_exactly_once() {
    let source = FakeSource::folders(7, 6);
    let machine = CrawlStateMachine::new(&source, options(3, 5));
    let mut checkpoint = CrawlCheckpoint::new();
    let mut recorder = Recorder::default();

    let outcome = machine.run(&mut checkpoint, &mut recorder).unwrap();
    let CrawlOutcome::Completed(stats) = outcome else {
        panic!("crawl did not complete: {:?}", outcome);
    };
    assert!(checkpoint.is_done());
    assert_eq!(stats.items, 2 + 7 * 6);
    assert_eq!(stats.duplicates, 0);
    assert_eq!(stats.containers_completed, 8);

    let folders: Vec<String> = source
        .first_fetches()
        .into_iter()
        .filter(|container| container.starts_with("folder-"))
        .collect();
    assert_eq!(folders.len(), 7, "a container was listed twice: {:?}", folders);
    assert_eq!(
        sorted(folders),
        (0..7).map(|i| format!("folder-{:02}", i)).collect::<Vec<_>>()
    );

    assert_unique(&recorder.ids());
    assert_eq!(sorted(recorder.ids()), source.all_ids());
}

#[test]
fn test_stage_starts_after_previous_stage_drains() {
    let source = FakeSource::folders(4, 3);
    let machine = CrawlStateMachine::new(&source, options(4, 2));
    let mut recorder = Recorder::default();
    machine
        .run(&mut CrawlCheckpoint::new(), &mut recorder)
        .unwrap();

    let folder_stage = recorder
        .log
        .iter()
        .position(|entry| *entry == format!("stage:{}", FOLDER_STAGE))
        .unwrap();
    for (position, entry) in recorder.log.iter().enumerate() {
        if entry.starts_with("root/") {
            assert!(position < folder_stage, "{} delivered after stage change", entry);
        }
        if entry.starts_with("folder-") {
            assert!(position > folder_stage, "{} delivered before its stage", entry);
        }
    }
}

#[test]
fn test_stopped_crawl_resumes_without_duplicates() {
    let source = FakeSource::folders(5, 9);
    let machine = CrawlStateMachine::new(&source, options(3, 4));

    let mut first = Recorder {
        stop_after: Some(17),
        ..Recorder::default()
    };
    let outcome = machine
        .run(&mut CrawlCheckpoint::new(), &mut first)
        .unwrap();
    assert!(matches!(outcome, CrawlOutcome::Stopped(_)));
    assert_eq!(first.items.len(), 17);

    // Resume from what was persisted, round-tripped through its stored form
    let persisted = first.persisted.clone().unwrap();
    let mut checkpoint = CrawlCheckpoint::from_json(&persisted.to_json().unwrap()).unwrap();
    assert!(!checkpoint.is_done());

    let mut second = Recorder::default();
    let outcome = machine.run(&mut checkpoint, &mut second).unwrap();
    assert!(matches!(outcome, CrawlOutcome::Completed(_)));

    let mut all = first.ids();
    all.extend(second.ids());
    assert_unique(&all);
    assert_eq!(sorted(all), source.all_ids());
}

#[test]
fn test_crash_resumes_after_last_persisted_item() {
    let source = FakeSource::new(0, &[("C", 100)], 10);
    let machine = CrawlStateMachine::new(&source, options(3, 10));

    let mut first = Recorder {
        crash_after: Some(50),
        ..Recorder::default()
    };
    assert!(machine
        .run(&mut CrawlCheckpoint::new(), &mut first)
        .is_err());
    assert_eq!(first.items.len(), 50);

    let mut checkpoint = first.persisted.clone().unwrap();
    assert_eq!(checkpoint.in_progress["C"].cursor, Some(50.0));

    let mut second = Recorder::default();
    machine.run(&mut checkpoint, &mut second).unwrap();
    assert_eq!(
        second.ids(),
        (50..100).map(|i| item_id("C", i)).collect::<Vec<_>>()
    );
}

#[test]
fn test_systemic_failure_resumes_after_last_persisted_item() {
    let source = FakeSource::new(0, &[("C", 100)], 10);
    let machine = CrawlStateMachine::new(&source, options(2, 10));
    source.fail_after(Some(50));

    let mut first = Recorder::default();
    let error = machine
        .run(&mut CrawlCheckpoint::new(), &mut first)
        .unwrap_err();
    assert!(error.to_string().contains("credentials revoked"));
    assert_eq!(first.items.len(), 50);

    source.fail_after(None);
    let mut checkpoint = first.persisted.clone().unwrap();
    let mut second = Recorder::default();
    machine.run(&mut checkpoint, &mut second).unwrap();

    assert_eq!(second.items.len(), 50);
    assert_eq!(second.items[0].id, item_id("C", 50));
    assert!(checkpoint.is_done());
}

#[test]
fn test_failed_attempt_is_resumed_by_the_next_attempt() {
    let h = Harness::new();
    let source = Arc::new(FakeSource::new(0, &[("C", 100)], 10));
    let sink = MemorySink::new();
    let worker = h.worker(&source, &sink);
    let scheduler = h.scheduler();

    source.fail_after(Some(50));
    let first = scheduler.maybe_start(h.key).unwrap().unwrap();
    let outcome = worker.poll_once(&h.queue, QUEUE, "w1").unwrap();
    assert_eq!(
        outcome,
        Some(TaskOutcome::Finished {
            attempt_id: first,
            status: AttemptStatus::Failed
        })
    );
    let failed = h.attempt(first);
    assert!(failed.error_msg.unwrap().contains("credentials revoked"));
    assert!(failed.checkpoint_pointer.is_some());
    assert_eq!(failed.total_docs_indexed, 50);
    assert_eq!(sink.len(), 50);

    source.fail_after(None);
    let second = scheduler
        .try_create_run(&h.source(), h.key.generation_id, false)
        .unwrap()
        .unwrap();
    let outcome = worker.poll_once(&h.queue, QUEUE, "w1").unwrap();
    assert_eq!(
        outcome,
        Some(TaskOutcome::Finished {
            attempt_id: second,
            status: AttemptStatus::Success
        })
    );

    let resumed = h.attempt(second);
    assert_eq!(resumed.poll_window(), h.attempt(first).poll_window());
    assert_eq!(resumed.total_docs_indexed, 50);

    let ids = sink.ids();
    assert_unique(&ids);
    assert_eq!(sorted(ids), source.all_ids());
}

#[test]
fn test_oversized_checkpoint_fails_the_attempt() {
    let h = Harness::build(std::time::Duration::from_secs(60), 300);
    let names: Vec<String> = (0..20)
        .map(|i| format!("a-folder-with-a-rather-long-name-{:02}", i))
        .collect();
    let containers: Vec<(&str, usize)> = names.iter().map(|name| (name.as_str(), 2)).collect();
    let source = Arc::new(FakeSource::new(1, &containers, 10));
    let sink = MemorySink::new();

    let attempt_id = h.scheduler().maybe_start(h.key).unwrap().unwrap();
    let outcome = h
        .worker(&source, &sink)
        .poll_once(&h.queue, QUEUE, "w1")
        .unwrap();
    assert_eq!(
        outcome,
        Some(TaskOutcome::Finished {
            attempt_id,
            status: AttemptStatus::Failed
        })
    );

    let attempt = h.attempt(attempt_id);
    assert!(attempt.error_msg.unwrap().contains("300 byte limit"));
    assert!(!h.fences.is_fenced(h.key).unwrap());

    // Only checkpoints under the ceiling were ever stored
    let pointer = attempt.checkpoint_pointer.unwrap();
    let stored = h.ledger.load(&pointer).unwrap().unwrap();
    assert!(stored.to_json().unwrap().len() <= 300);
    assert!(stored.containers.map_or(true, |containers| containers.len() < 20));
}
