//! Connector retrieval contract and implementations
//!
//! A connector exposes an ordered list of stages. Each stage is split into
//! containers that can be crawled independently; each container is read page by
//! page with a per-container cursor so an interrupted crawl can resume mid-container.
//!
//! # Components
//!
//! - `Source`: the retrieval contract the crawl state machine drives
//! - `RetryingSource`: decorator retrying transient errors with backoff
//! - `NameCache`: bounded display-name cache owned by one connector instance
//! - `DirectorySource`: local filesystem connector

mod cache;
mod directory;
mod retry;
mod traits;

pub use cache::NameCache;
pub use directory::DirectorySource;
pub use retry::{RetryPolicy, RetryingSource};
pub use traits::{
    Item, Page, PageRequest, PollWindow, RetrievalMode, Retrieved, ScopedFailure, Source,
    SourceError, StageSpec,
};

use crate::storage::SourceRecord;
use crate::ConfigError;

/// Connector ids accepted in configuration
pub const KNOWN_CONNECTORS: &[&str] = &["directory"];

/// Builds the connector for a stored source, wrapped in the retry decorator
///
/// # Arguments
///
/// * `source` - The source record naming the connector and its root
/// * `policy` - Retry policy applied to every call into the connector
///
/// # Returns
///
/// * `Ok(Box<dyn Source>)` - The ready-to-crawl connector
/// * `Err(ConfigError)` - The connector id is not known
pub fn build_source(source: &SourceRecord, policy: RetryPolicy) -> Result<Box<dyn Source>, ConfigError> {
    match source.connector_id.as_str() {
        "directory" => Ok(Box::new(RetryingSource::new(
            DirectorySource::new(&source.name, &source.root),
            policy,
        ))),
        other => Err(ConfigError::UnknownConnector(other.to_string())),
    }
}
