//! Run Scheduler
//!
//! Decides when a (source, generation) pair is due for a run and submits it:
//! acquire fence, create attempt, enqueue task, fill fence payload.

mod eligibility;
mod run_scheduler;

pub use eligibility::{is_in_repeated_error_state, should_index, Eligibility};
pub use run_scheduler::{BeatReport, RunScheduler};
