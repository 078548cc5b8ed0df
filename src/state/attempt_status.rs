/// Run attempt status definitions
///
/// A run attempt moves from `NotStarted` to `InProgress` and ends in one of the
/// terminal states. Only the fence holder moves an attempt between states; the
/// validator may only fail a non-terminal attempt whose fence is orphaned.
use std::fmt;

/// Represents the lifecycle state of one indexing run attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptStatus {
    // ===== Active States =====
    /// Attempt row exists, task queued, worker not yet running
    NotStarted,

    /// A worker holds the fence and is crawling
    InProgress,

    // ===== Terminal States =====
    /// Crawl completed with no scoped failures
    Success,

    /// Crawl completed, but some items or containers failed
    PartiallySucceeded,

    /// Attempt aborted or reconciled as orphaned
    Failed,

    /// Cooperative stop was observed
    Canceled,
}

impl AttemptStatus {
    /// Returns true if no further transitions are allowed
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotStarted | Self::InProgress)
    }

    /// Returns true if the attempt may still be picked up or is running
    pub fn is_active(&self) -> bool {
        matches!(self, Self::NotStarted | Self::InProgress)
    }

    /// Returns true if the crawl finished its traversal
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Success | Self::PartiallySucceeded)
    }

    /// Returns true if a later attempt should retry the same poll window
    pub fn retries_window(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }

    /// Converts the status to its database representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::PartiallySucceeded => "partially_succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Parses a status from its database representation
    ///
    /// Returns None if the string doesn't match any known status.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(Self::NotStarted),
            "in_progress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "partially_succeeded" => Some(Self::PartiallySucceeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Returns all possible attempt statuses
    pub fn all_statuses() -> Vec<Self> {
        vec![
            Self::NotStarted,
            Self::InProgress,
            Self::Success,
            Self::PartiallySucceeded,
            Self::Failed,
            Self::Canceled,
        ]
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
