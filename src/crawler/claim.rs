//! Container claim pool for one partitionable stage

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

/// Upper bound on one condition-variable wait before re-checking the pool
const WAIT_SLICE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Available,
    Claimed,
    Finished,
}

/// A container handed to one sub-worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub container: String,
    /// The container was in progress when the checkpoint was taken
    pub resumed: bool,
}

/// Snapshot of the pool's slots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub available: usize,
    pub claimed: usize,
    pub finished: usize,
}

struct PoolState {
    slots: BTreeMap<String, Slot>,
    resume_first: VecDeque<String>,
    resumed: BTreeSet<String>,
    aborted: bool,
}

impl PoolState {
    fn take_claimable(&mut self) -> Option<Claim> {
        while let Some(id) = self.resume_first.pop_front() {
            if let Some(slot) = self.slots.get_mut(&id) {
                if *slot == Slot::Available {
                    *slot = Slot::Claimed;
                    return Some(Claim {
                        container: id,
                        resumed: true,
                    });
                }
            }
        }

        let (id, slot) = self
            .slots
            .iter_mut()
            .find(|(_, slot)| **slot == Slot::Available)?;
        *slot = Slot::Claimed;
        Some(Claim {
            resumed: self.resumed.contains(id),
            container: id.clone(),
        })
    }

    fn any_claimed(&self) -> bool {
        self.slots.values().any(|slot| *slot == Slot::Claimed)
    }
}

/// Disjoint, dynamic assignment of containers to sub-workers
///
/// Owned by the crawl state machine for the lifetime of one stage. Sub-workers
/// borrow the pool and only ever hold container ids.
pub struct ClaimPool {
    state: Mutex<PoolState>,
    changed: Condvar,
}

impl ClaimPool {
    /// Builds the pool for a stage
    ///
    /// # Arguments
    ///
    /// * `containers` - Every container discovered at stage entry
    /// * `completed` - Containers already finished according to the checkpoint
    /// * `resumed` - Containers that were in progress; they are handed out first
    pub fn new(
        containers: &[String],
        completed: &BTreeSet<String>,
        resumed: impl IntoIterator<Item = String>,
    ) -> Self {
        let slots = containers
            .iter()
            .map(|id| {
                let slot = if completed.contains(id) {
                    Slot::Finished
                } else {
                    Slot::Available
                };
                (id.clone(), slot)
            })
            .collect::<BTreeMap<_, _>>();

        let resumed: BTreeSet<String> = resumed
            .into_iter()
            .filter(|id| slots.get(id) == Some(&Slot::Available))
            .collect();

        Self {
            state: Mutex::new(PoolState {
                slots,
                resume_first: resumed.iter().cloned().collect(),
                resumed,
                aborted: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Claims the next container
    ///
    /// Blocks only while nothing is claimable but some container is still claimed
    /// by another worker, since a released container becomes claimable again.
    ///
    /// # Returns
    ///
    /// * `Some(Claim)` - The container now exclusively held by the caller
    /// * `None` - Nothing is claimable and nothing is in progress, or the pool was aborted
    pub fn claim(&self) -> Option<Claim> {
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return None;
            }
            if let Some(claim) = state.take_claimable() {
                return Some(claim);
            }
            if !state.any_claimed() {
                return None;
            }
            self.changed.wait_for(&mut state, WAIT_SLICE);
        }
    }

    /// Marks a claimed container finished
    pub fn complete(&self, container: &str) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(container) {
            *slot = Slot::Finished;
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Returns a claimed container to the pool unfinished
    pub fn release(&self, container: &str) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(container) {
            if *slot == Slot::Claimed {
                *slot = Slot::Available;
            }
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Wakes every waiter and makes all further claims return None
    pub fn abort(&self) {
        self.state.lock().aborted = true;
        self.changed.notify_all();
    }

    /// Returns true once every container is finished
    pub fn is_drained(&self) -> bool {
        self.state
            .lock()
            .slots
            .values()
            .all(|slot| *slot == Slot::Finished)
    }

    pub fn counts(&self) -> PoolCounts {
        let state = self.state.lock();
        let mut counts = PoolCounts::default();
        for slot in state.slots.values() {
            match slot {
                Slot::Available => counts.available += 1,
                Slot::Claimed => counts.claimed += 1,
                Slot::Finished => counts.finished += 1,
            }
        }
        counts
    }
}
