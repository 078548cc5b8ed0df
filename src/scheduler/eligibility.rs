//! Pure scheduling decisions

use crate::state::{AttemptStatus, GenerationStatus, SourceStatus};
use crate::storage::{AttemptRecord, SourceRecord};
use chrono::{DateTime, Utc};

/// Everything `should_index` looks at
#[derive(Debug, Clone, Copy)]
pub struct Eligibility<'a> {
    pub source: &'a SourceRecord,
    pub generation: GenerationStatus,
    pub last_attempt: Option<&'a AttemptRecord>,
    /// A future generation is being built
    pub secondary_building: bool,
    pub disable_update_on_swap: bool,
    pub now: DateTime<Utc>,
}

/// Decides whether a run should be started for (source, generation)
///
/// Overlap with a run already in flight is not checked here; the fence does that.
pub fn should_index(input: &Eligibility<'_>) -> bool {
    let source = input.source;

    if !source.status.accepts_runs() {
        return false;
    }

    if input.disable_update_on_swap
        && input.generation == GenerationStatus::Present
        && input.secondary_building
    {
        return false;
    }

    // A future generation is indexed until one attempt completes
    if input.generation == GenerationStatus::Future {
        return match input.last_attempt {
            Some(last) => !(last.status.is_successful() || last.status.is_active()),
            None => true,
        };
    }

    if input.generation == GenerationStatus::Present && source.indexing_trigger.is_some() {
        return true;
    }

    if source.in_repeated_error_state {
        return false;
    }

    let Some(last) = input.last_attempt else {
        return true;
    };

    let Some(refresh_secs) = source.refresh_freq_secs else {
        return false;
    };

    if source.status == SourceStatus::InitialIndexing {
        return true;
    }

    (input.now - last.updated_at).num_seconds() >= refresh_secs
}

/// Returns true if the newest attempts all failed
///
/// Sources without a refresh interval enter the mode after a single failure.
///
/// # Arguments
///
/// * `recent` - Attempts for one (source, generation), newest first
/// * `threshold` - Consecutive failures required for refreshed sources
/// * `has_refresh` - Whether the source has a refresh interval
pub fn is_in_repeated_error_state(
    recent: &[AttemptRecord],
    threshold: usize,
    has_refresh: bool,
) -> bool {
    let needed = if has_refresh { threshold } else { 1 };
    recent.len() >= needed
        && recent
            .iter()
            .take(needed)
            .all(|attempt| attempt.status == AttemptStatus::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::IndexingTrigger;
    use chrono::Duration;

    fn source(status: SourceStatus, refresh: Option<i64>) -> SourceRecord {
        SourceRecord {
            id: 1,
            name: "docs".to_string(),
            connector_id: "directory".to_string(),
            credential_id: "local".to_string(),
            root: "/tmp".to_string(),
            status,
            refresh_freq_secs: refresh,
            indexing_trigger: None,
            in_repeated_error_state: false,
            created_at: Utc::now(),
        }
    }

    fn attempt(status: AttemptStatus, updated_secs_ago: i64) -> AttemptRecord {
        let now = Utc::now();
        AttemptRecord {
            id: 1,
            source_id: 1,
            generation_id: 1,
            status,
            from_beginning: false,
            task_id: None,
            poll_range_start: None,
            poll_range_end: None,
            checkpoint_pointer: None,
            error_msg: None,
            total_docs_indexed: 0,
            failure_count: 0,
            created_at: now,
            started_at: None,
            updated_at: now - Duration::seconds(updated_secs_ago),
            finished_at: None,
        }
    }

    fn input<'a>(
        source: &'a SourceRecord,
        generation: GenerationStatus,
        last: Option<&'a AttemptRecord>,
    ) -> Eligibility<'a> {
        Eligibility {
            source,
            generation,
            last_attempt: last,
            secondary_building: false,
            disable_update_on_swap: false,
            now: Utc::now(),
        }
    }

    #[test]
    fn test_paused_source_never_indexes() {
        let src = source(SourceStatus::Paused, Some(60));
        assert!(!should_index(&input(&src, GenerationStatus::Present, None)));
        assert!(!should_index(&input(&src, GenerationStatus::Future, None)));
    }

    #[test]
    fn test_first_run_and_refresh_interval() {
        let src = source(SourceStatus::Active, Some(600));
        assert!(should_index(&input(&src, GenerationStatus::Present, None)));

        let recent = attempt(AttemptStatus::Success, 60);
        assert!(!should_index(&input(&src, GenerationStatus::Present, Some(&recent))));

        let old = attempt(AttemptStatus::Success, 601);
        assert!(should_index(&input(&src, GenerationStatus::Present, Some(&old))));

        let no_refresh = source(SourceStatus::Active, None);
        assert!(!should_index(&input(&no_refresh, GenerationStatus::Present, Some(&old))));
    }

    #[test]
    fn test_initial_indexing_retries_immediately() {
        let src = source(SourceStatus::InitialIndexing, Some(3600));
        let failed = attempt(AttemptStatus::Failed, 5);
        assert!(should_index(&input(&src, GenerationStatus::Present, Some(&failed))));
    }

    #[test]
    fn test_future_generation_indexes_once() {
        let src = source(SourceStatus::Active, None);
        assert!(should_index(&input(&src, GenerationStatus::Future, None)));

        let failed = attempt(AttemptStatus::Failed, 5);
        assert!(should_index(&input(&src, GenerationStatus::Future, Some(&failed))));

        let running = attempt(AttemptStatus::InProgress, 5);
        assert!(!should_index(&input(&src, GenerationStatus::Future, Some(&running))));

        let done = attempt(AttemptStatus::Success, 5);
        assert!(!should_index(&input(&src, GenerationStatus::Future, Some(&done))));
    }

    #[test]
    fn test_manual_trigger_and_repeated_errors() {
        let mut src = source(SourceStatus::Active, Some(3600));
        src.in_repeated_error_state = true;
        let old = attempt(AttemptStatus::Failed, 7200);
        assert!(!should_index(&input(&src, GenerationStatus::Present, Some(&old))));

        src.indexing_trigger = Some(IndexingTrigger::Update);
        assert!(should_index(&input(&src, GenerationStatus::Present, Some(&old))));
    }

    #[test]
    fn test_update_on_swap_disabled() {
        let src = source(SourceStatus::Active, Some(60));
        let mut eligibility = input(&src, GenerationStatus::Present, None);
        eligibility.secondary_building = true;
        eligibility.disable_update_on_swap = true;
        assert!(!should_index(&eligibility));
    }

    #[test]
    fn test_repeated_error_state() {
        let failed: Vec<_> = (0..5).map(|_| attempt(AttemptStatus::Failed, 0)).collect();
        assert!(is_in_repeated_error_state(&failed, 5, true));
        assert!(!is_in_repeated_error_state(&failed[..4], 5, true));

        let mut mixed = failed.clone();
        mixed[2] = attempt(AttemptStatus::Canceled, 0);
        assert!(!is_in_repeated_error_state(&mixed, 5, true));

        // A single failure is enough without a refresh interval
        assert!(is_in_repeated_error_state(&failed[..1], 5, false));
        assert!(!is_in_repeated_error_state(&[], 5, false));
    }
}
