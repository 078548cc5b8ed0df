//! Run Validator
//!
//! Background sweep that reconciles fences whose task is gone and attempts left
//! active without a fence. It only ever writes terminal attempt status and tears
//! down fences; it never touches checkpoints.

use crate::coordination::CacheLock;
use crate::fence::keys::VALIDATE_LOCK;
use crate::fence::{parse_fence_key, FenceManager};
use crate::queue::TaskQueue;
use crate::state::{AttemptStatus, RunKey};
use crate::storage::{AttemptRecord, AttemptStore, SharedStorage};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// What one sweep did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Another validator held the sweep lock
    pub skipped: bool,
    pub fences_checked: usize,
    pub malformed_skipped: usize,
    pub setup_resets: usize,
    pub orphans_reconciled: usize,
    pub unfenced_reconciled: usize,
    pub errors: usize,
    /// The sweep lock expired mid-sweep and the sweep stopped early
    pub lock_lost: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Alive,
    Setup,
    Malformed,
    Gone,
    SetupReset,
    Orphaned,
}

/// Task ids visible in the broker at the start of a sweep
struct QueueSnapshot {
    pending: BTreeSet<String>,
    reserved: BTreeSet<String>,
}

impl QueueSnapshot {
    fn contains(&self, task_id: &str) -> bool {
        self.pending.contains(task_id) || self.reserved.contains(task_id)
    }
}

pub struct RunValidator {
    storage: SharedStorage,
    fences: FenceManager,
    queue: Arc<dyn TaskQueue>,
    queue_name: String,
    lock_timeout: Duration,
}

impl RunValidator {
    pub fn new(
        storage: SharedStorage,
        fences: FenceManager,
        queue: Arc<dyn TaskQueue>,
        queue_name: impl Into<String>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            fences,
            queue,
            queue_name: queue_name.into(),
            lock_timeout,
        }
    }

    /// Runs one reconciliation sweep
    ///
    /// Per fence: malformed keys are skipped, fences still in setup are left
    /// alone while their liveness signal holds, and a filled fence is alive if
    /// its task is pending, reserved, or its liveness signal is fresh. A fence
    /// failing all three is orphaned: its attempt is marked FAILED and the fence
    /// deleted. Active attempts with no fence of their own are then marked FAILED.
    ///
    /// # Returns
    ///
    /// * `Ok(SweepReport)` - Counts of what the sweep found and did
    /// * `Err(FencelineError)` - The cache or broker could not be read
    pub fn sweep(&self) -> crate::Result<SweepReport> {
        let mut report = SweepReport::default();
        let lock = CacheLock::new(self.fences.cache().clone(), VALIDATE_LOCK, self.lock_timeout);
        if !lock.try_acquire()? {
            report.skipped = true;
            return Ok(report);
        }

        let result = self.sweep_locked(&lock, &mut report);
        if let Err(e) = lock.release() {
            tracing::warn!("Failed to release validator lock: {}", e);
        }
        result?;

        if report.orphans_reconciled + report.unfenced_reconciled + report.setup_resets > 0 {
            tracing::info!(
                "Validator sweep: {} orphans, {} unfenced attempts, {} setup resets",
                report.orphans_reconciled,
                report.unfenced_reconciled,
                report.setup_resets
            );
        }
        Ok(report)
    }

    fn sweep_locked(&self, lock: &CacheLock, report: &mut SweepReport) -> crate::Result<()> {
        let snapshot = QueueSnapshot {
            pending: self.queue.list_pending(&self.queue_name)?,
            reserved: self.queue.list_reserved()?,
        };

        for fence in self.fences.list_fences()? {
            if !lock.reacquire()? {
                tracing::warn!("Validator lock lost mid-sweep, stopping early");
                report.lock_lost = true;
                return Ok(());
            }

            report.fences_checked += 1;
            match self.validate_fence(&fence, &snapshot) {
                Ok(Verdict::Malformed) => report.malformed_skipped += 1,
                Ok(Verdict::SetupReset) => report.setup_resets += 1,
                Ok(Verdict::Orphaned) => report.orphans_reconciled += 1,
                Ok(Verdict::Alive | Verdict::Setup | Verdict::Gone) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::error!("Failed to validate fence {}: {}", fence, e);
                }
            }
        }

        if !lock.reacquire()? {
            report.lock_lost = true;
            return Ok(());
        }
        report.unfenced_reconciled = self.reconcile_unfenced()?;
        Ok(())
    }

    fn validate_fence(&self, fence: &str, snapshot: &QueueSnapshot) -> crate::Result<Verdict> {
        let Some(key) = parse_fence_key(fence) else {
            tracing::warn!("Skipping fence with unrecognized key {}", fence);
            return Ok(Verdict::Malformed);
        };

        let (raw, record) = match self.fences.load_raw(key) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                self.fences.unregister(fence)?;
                // An acquire may have created the fence after the read
                if self.fences.is_fenced(key)? {
                    self.fences.register(fence)?;
                }
                return Ok(Verdict::Gone);
            }
            Err(crate::FencelineError::Json(e)) => {
                tracing::warn!("Skipping fence {} with unreadable value: {}", fence, e);
                return Ok(Verdict::Malformed);
            }
            Err(e) => return Err(e),
        };

        let Some(payload) = record.payload else {
            let age = (Utc::now() - record.created_at).to_std().unwrap_or_default();
            if self.fences.is_alive(key)? || age < self.fences.liveness_ttl() {
                return Ok(Verdict::Setup);
            }
            tracing::info!("Resetting fence {} stuck in setup", fence);
            return Ok(if self.fences.reset(key, &raw)? {
                Verdict::SetupReset
            } else {
                Verdict::Gone
            });
        };

        if snapshot.contains(&payload.task_id) {
            // The broker still knows the task; bridge the hand-off gap
            self.fences.renew_liveness(key)?;
            return Ok(Verdict::Alive);
        }
        if self.fences.is_alive(key)? {
            return Ok(Verdict::Alive);
        }

        tracing::warn!(
            "Fence {} is orphaned: task {} not queued and liveness expired (attempt {})",
            fence,
            payload.task_id,
            payload.attempt_id
        );
        let reason = format!(
            "Worker for task {} disappeared without finishing the attempt",
            payload.task_id
        );
        match self
            .storage
            .lock()
            .finish_attempt(payload.attempt_id, AttemptStatus::Failed, Some(&reason))
        {
            Ok(_) => {}
            Err(e) => tracing::error!(
                "Failed to mark attempt {} failed: {}",
                payload.attempt_id,
                e
            ),
        }

        Ok(if self.fences.reset(key, &raw)? {
            Verdict::Orphaned
        } else {
            Verdict::Gone
        })
    }

    /// Marks active attempts that no fence covers as FAILED
    fn reconcile_unfenced(&self) -> crate::Result<usize> {
        let active = self
            .storage
            .lock()
            .list_attempts_by_status(&[AttemptStatus::NotStarted, AttemptStatus::InProgress])?;

        let mut reconciled = 0;
        for attempt in active {
            if self.is_fenced_by(&attempt)? {
                continue;
            }

            // The scheduler fences before creating an attempt, so re-read both to
            // rule out a creation that completed after the first read
            let current = self.storage.lock().get_attempt(attempt.id)?;
            if !current.status.is_active() || self.is_fenced_by(&current)? {
                continue;
            }

            let finished = self.storage.lock().finish_attempt(
                attempt.id,
                AttemptStatus::Failed,
                Some("Attempt was active without a fence"),
            )?;
            if finished {
                tracing::warn!(
                    "Marked unfenced attempt {} for {} as failed",
                    attempt.id,
                    attempt.key()
                );
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    /// Returns true if the key's fence is in setup or names this attempt
    fn is_fenced_by(&self, attempt: &AttemptRecord) -> crate::Result<bool> {
        let key: RunKey = attempt.key();
        Ok(match self.fences.load(key) {
            Ok(Some(record)) => record
                .payload
                .map_or(true, |payload| payload.attempt_id == attempt.id),
            Ok(None) => false,
            // Unreadable fence values are left to a future layout
            Err(crate::FencelineError::Json(_)) => true,
            Err(e) => return Err(e),
        })
    }
}
