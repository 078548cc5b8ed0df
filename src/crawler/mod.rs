//! Resumable multi-stage crawl
//!
//! This module drives a `Source` through its stages and keeps a serializable
//! checkpoint of where it is:
//! - `CrawlPhase` and `transition` define the stage order
//! - `CrawlCheckpoint` records containers finished, failed, and in progress
//! - `ClaimPool` hands containers of a partitionable stage to sub-workers
//! - `CrawlStateMachine` runs the sub-workers and reports to a `CrawlObserver`

mod checkpoint;
mod claim;
mod machine;

pub use checkpoint::{transition, ContainerProgress, CrawlCheckpoint, CrawlEvent, CrawlPhase};
pub use claim::{Claim, ClaimPool, PoolCounts};
pub use machine::{CrawlObserver, CrawlOptions, CrawlOutcome, CrawlStateMachine, CrawlStats};

use thiserror::Error;

/// Errors raised by the crawl state machine itself
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Invalid crawl transition from {from:?} on {event:?}")]
    InvalidTransition { from: CrawlPhase, event: CrawlEvent },

    #[error("Checkpoint stage {index} ({name}) does not match this source")]
    IncompatibleCheckpoint { index: usize, name: String },

    #[error("Systemic failure during crawl: {0}")]
    Systemic(String),

    #[error("Stage {0} ended with unfinished containers")]
    StageIncomplete(String),

    #[error("A crawl sub-worker panicked")]
    WorkerPanicked,
}
