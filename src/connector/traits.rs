//! Retrieval contract between the crawl state machine and connectors

use crate::storage::FailureRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors surfaced by a connector
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// Rate limit, timeout, or other condition worth retrying
    #[error("Transient source error: {0}")]
    Transient(String),

    /// One container cannot be read; the rest of the run proceeds
    #[error("Container {container} failed: {message}")]
    Scoped { container: String, message: String },

    /// The whole source is unusable (e.g. credentials revoked)
    #[error("Systemic source error: {0}")]
    Systemic(String),
}

/// One document as retrieved from a source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    pub id: String,
    /// Last-modified time in seconds since the Unix epoch
    pub modified: f64,
    pub title: String,
    pub link: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Absent in slim mode
    pub content: Option<String>,
}

/// A failure attributable to one item or one container
#[derive(Debug, Clone, PartialEq)]
pub enum ScopedFailure {
    Item {
        id: String,
        link: Option<String>,
        message: String,
    },
    Container {
        id: String,
        message: String,
        missed_range: Option<(f64, f64)>,
    },
}

impl ScopedFailure {
    pub fn message(&self) -> &str {
        match self {
            Self::Item { message, .. } | Self::Container { message, .. } => message,
        }
    }
}

impl From<&ScopedFailure> for FailureRecord {
    fn from(failure: &ScopedFailure) -> Self {
        match failure {
            ScopedFailure::Item { id, link, message } => FailureRecord {
                document_id: Some(id.clone()),
                document_link: link.clone(),
                entity_id: None,
                missed_range: None,
                message: message.clone(),
            },
            ScopedFailure::Container {
                id,
                message,
                missed_range,
            } => FailureRecord {
                document_id: None,
                document_link: None,
                entity_id: Some(id.clone()),
                missed_range: *missed_range,
                message: message.clone(),
            },
        }
    }
}

/// One entry of a page: an item or a scoped failure
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieved {
    Item(Item),
    Failure(ScopedFailure),
}

/// A named stage of a source's retrieval protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    /// Whether containers of this stage may be crawled concurrently
    pub partitionable: bool,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, partitionable: bool) -> Self {
        Self {
            name: name.into(),
            partitionable,
        }
    }
}

/// Time range of modifications a run covers, in epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollWindow {
    pub start: f64,
    pub end: f64,
}

impl PollWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn from_datetimes(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: start.timestamp_micros() as f64 / 1_000_000.0,
            end: end.timestamp_micros() as f64 / 1_000_000.0,
        }
    }

    /// A window covering all of history up to `end`
    pub fn everything() -> Self {
        Self {
            start: 0.0,
            end: f64::MAX,
        }
    }

    pub fn contains(&self, modified: f64) -> bool {
        modified >= self.start && modified <= self.end
    }
}

/// Whether items carry full content or only identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    Full,
    /// Stateless listing of ids and minimal metadata
    Slim,
}

/// Arguments of one page fetch
#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub stage: &'a str,
    pub container: &'a str,
    /// Resume point within the container; items modified before it are skipped
    pub since: Option<f64>,
    pub window: PollWindow,
    pub mode: RetrievalMode,
    /// Opaque token from the previous page of the same listing
    pub page_token: Option<&'a str>,
}

/// One page of a container listing
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Entries in non-decreasing modification order
    pub entries: Vec<Retrieved>,
    pub next_page_token: Option<String>,
}

/// The retrieval contract a connector implements
///
/// Within one container, `fetch_page` must return items in non-decreasing
/// `modified` order, and a request with `since` must include every item modified
/// at or after it. Listings restart cleanly from any cursor.
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    /// Ordered stages this source is crawled in
    fn stages(&self) -> Vec<StageSpec>;

    /// Lists the containers of a stage
    ///
    /// Non-partitionable stages are a single container named after the stage.
    fn discover_containers(&self, stage: &StageSpec) -> Result<Vec<String>, SourceError> {
        Ok(vec![stage.name.clone()])
    }

    fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, SourceError>;
}
