/// Source and index generation status definitions
use std::fmt;

/// Administrative state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceStatus {
    /// Source has never completed a successful run
    InitialIndexing,

    /// Source is indexed and refreshed on its interval
    Active,

    /// Paused by an operator, no runs are started
    Paused,

    /// Source is being removed
    Deleting,
}

impl SourceStatus {
    /// Returns true if new runs may be started for this source
    pub fn accepts_runs(&self) -> bool {
        matches!(self, Self::InitialIndexing | Self::Active)
    }

    /// Converts the status to its database representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::InitialIndexing => "initial_indexing",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Deleting => "deleting",
        }
    }

    /// Parses a status from its database representation
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "initial_indexing" => Some(Self::InitialIndexing),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "deleting" => Some(Self::Deleting),
            _ => None,
        }
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Lifecycle of a downstream index generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationStatus {
    /// Index currently serving queries
    Present,

    /// Index being built to replace the present one
    Future,

    /// Retired index, never crawled again
    Past,
}

impl GenerationStatus {
    /// Returns true if sources are crawled into this generation
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Present | Self::Future)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Future => "future",
            Self::Past => "past",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "present" => Some(Self::Present),
            "future" => Some(Self::Future),
            "past" => Some(Self::Past),
            _ => None,
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Kind of manual trigger an operator placed on a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexingTrigger {
    /// Run an incremental update now
    Update,

    /// Re-crawl from the beginning of time
    Reindex,
}

impl IndexingTrigger {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Reindex => "reindex",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "update" => Some(Self::Update),
            "reindex" => Some(Self::Reindex),
            _ => None,
        }
    }
}
