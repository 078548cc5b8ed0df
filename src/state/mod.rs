//! State module for run lifecycle tracking
//!
//! # Components
//!
//! - `AttemptStatus`: lifecycle of one run attempt (not started, in progress, terminal states)
//! - `SourceStatus`: administrative state of a source (paused, active, ...)
//! - `GenerationStatus`: lifecycle of a downstream index generation
//! - `RunKey`: the (source, generation) pair a fence protects

mod attempt_status;
mod run_key;
mod source_status;

// Re-export main types
pub use attempt_status::AttemptStatus;
pub use run_key::RunKey;
pub use source_status::{GenerationStatus, IndexingTrigger, SourceStatus};
