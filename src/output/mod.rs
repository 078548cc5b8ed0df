//! Output module for crawled documents and run statistics
//!
//! This module handles:
//! - Writing crawled documents to a sink (JSONL file, or memory in tests)
//! - Summarizing attempt outcomes and recent failures for operators

mod sink;
pub mod stats;

pub use sink::{DocumentSink, JsonlSink, MemorySink, SinkError, SinkResult};
pub use stats::{load_statistics, print_statistics, AttemptStatistics};
