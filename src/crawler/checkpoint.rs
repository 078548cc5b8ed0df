//! Serializable crawl progress and the stage transition function

use crate::connector::StageSpec;
use crate::crawler::CrawlError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Where a crawl is in its ordered list of stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrawlPhase {
    Start,
    Stage { index: usize, name: String },
    Done,
}

/// Inputs of the transition function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlEvent {
    /// The crawl leaves `Start`
    Begin,
    /// Every container of the current stage finished
    StageDrained,
}

/// Computes the next phase
///
/// `Start` moves to the first stage, a drained stage moves to the next one, and
/// the last stage moves to `Done`. Any other combination is an error.
pub fn transition(
    phase: &CrawlPhase,
    event: CrawlEvent,
    stages: &[StageSpec],
) -> Result<CrawlPhase, CrawlError> {
    match (phase, event) {
        (CrawlPhase::Start, CrawlEvent::Begin) => Ok(stage_at(0, stages)),
        (CrawlPhase::Stage { index, .. }, CrawlEvent::StageDrained) => {
            Ok(stage_at(index + 1, stages))
        }
        (from, event) => Err(CrawlError::InvalidTransition {
            from: from.clone(),
            event,
        }),
    }
}

fn stage_at(index: usize, stages: &[StageSpec]) -> CrawlPhase {
    match stages.get(index) {
        Some(stage) => CrawlPhase::Stage {
            index,
            name: stage.name.clone(),
        },
        None => CrawlPhase::Done,
    }
}

/// Progress within one container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerProgress {
    /// Modification time of the newest item yielded from this container
    pub cursor: Option<f64>,

    /// Ids yielded at or after the cursor, with their modification times
    ///
    /// A resumed listing starts at the cursor inclusively, so only these ids can
    /// be delivered twice; older entries are pruned as the cursor advances.
    pub recent: BTreeMap<String, f64>,
}

impl ContainerProgress {
    /// Records an item about to be yielded
    ///
    /// # Returns
    ///
    /// * `true` - First sighting; the item should reach the sink
    /// * `false` - Already yielded; the item must be dropped
    pub fn observe(&mut self, id: &str, modified: f64) -> bool {
        if self.recent.contains_key(id) {
            return false;
        }
        self.recent.insert(id.to_string(), modified);

        if self.cursor.map_or(true, |cursor| modified > cursor) {
            self.cursor = Some(modified);
            self.recent.retain(|_, seen| *seen >= modified);
        }
        true
    }
}

/// Everything needed to resume a crawl where it stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlCheckpoint {
    pub has_more: bool,
    pub phase: CrawlPhase,

    /// Containers of the current stage, fixed when the stage is entered
    pub containers: Option<Vec<String>>,

    /// Containers of the current stage that finished, with or without error
    pub completed: BTreeSet<String>,

    /// Subset of `completed` that finished with a scoped failure
    pub failed: BTreeSet<String>,

    /// Containers being crawled when the checkpoint was taken
    pub in_progress: BTreeMap<String, ContainerProgress>,
}

impl Default for CrawlCheckpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlCheckpoint {
    /// A checkpoint for a crawl that has not started
    pub fn new() -> Self {
        Self {
            has_more: true,
            phase: CrawlPhase::Start,
            containers: None,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            in_progress: BTreeMap::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == CrawlPhase::Done
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Moves to the next stage, forgetting the drained stage's containers
    pub fn advance(&mut self, stages: &[StageSpec]) -> Result<(), CrawlError> {
        let event = match self.phase {
            CrawlPhase::Start => CrawlEvent::Begin,
            _ => CrawlEvent::StageDrained,
        };
        self.phase = transition(&self.phase, event, stages)?;
        self.containers = None;
        self.completed.clear();
        self.failed.clear();
        self.in_progress.clear();
        if self.is_done() {
            self.has_more = false;
        }
        Ok(())
    }
}
