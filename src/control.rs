//! Operator-facing operations
//!
//! - `maybe_start`: start a run for a named source if it is due
//! - `cancel`: request a cooperative stop of an active attempt
//! - `get_status`: attempt record joined with its live fence signals
//! - heartbeats: TTL keys external dashboards read to tell live loops from dead ones

use crate::fence::keys::heartbeat_key;
use crate::fence::FenceManager;
use crate::scheduler::RunScheduler;
use crate::state::RunKey;
use crate::storage::{AttemptRecord, AttemptStore, SharedStorage};
use crate::FencelineError;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Snapshot of one attempt as seen by storage and the coordination cache
#[derive(Debug, Clone)]
pub struct AttemptStatusReport {
    pub attempt: AttemptRecord,
    /// The live fence for the attempt's key names this attempt
    pub fenced: bool,
    pub alive: bool,
    pub stage: Option<String>,
    /// Documents reported through the fence progress counter
    pub progress: Option<i64>,
    pub stop_requested: bool,
}

pub struct Control {
    storage: SharedStorage,
    fences: FenceManager,
}

impl Control {
    pub fn new(storage: SharedStorage, fences: FenceManager) -> Self {
        Self { storage, fences }
    }

    /// Starts a run for `source_name` against `generation_id` if it is due
    ///
    /// # Returns
    ///
    /// * `Ok(Some(attempt_id))` - A run was created and queued
    /// * `Ok(None)` - Not due, or another run holds the fence
    /// * `Err(FencelineError)` - The source is unknown or a collaborator failed
    pub fn maybe_start(
        &self,
        scheduler: &RunScheduler,
        source_name: &str,
        generation_id: i64,
    ) -> crate::Result<Option<i64>> {
        let source = self
            .storage
            .lock()
            .get_source_by_name(source_name)?
            .ok_or_else(|| FencelineError::UnknownSource(source_name.to_string()))?;
        scheduler.maybe_start(RunKey::new(source.id, generation_id))
    }

    /// Requests a cooperative stop of an attempt
    ///
    /// The worker observes the flag between yielded items and ends the attempt as
    /// CANCELED.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The stop flag was set for the attempt's run
    /// * `Ok(false)` - The attempt is already terminal or no longer fenced
    pub fn cancel(&self, attempt_id: i64) -> crate::Result<bool> {
        let attempt = self.storage.lock().get_attempt(attempt_id)?;
        if attempt.status.is_terminal() {
            tracing::info!(
                "Attempt {} is already {}, nothing to cancel",
                attempt_id,
                attempt.status
            );
            return Ok(false);
        }

        let key = attempt.key();
        if !self.is_fenced_by(key, attempt_id)? {
            tracing::warn!(
                "Attempt {} is {} but not fenced; the validator will reconcile it",
                attempt_id,
                attempt.status
            );
            return Ok(false);
        }

        self.fences.request_stop(key)?;
        tracing::info!("Stop requested for attempt {} ({})", attempt_id, key);
        Ok(true)
    }

    /// Reports an attempt's stored record and live signals
    pub fn get_status(&self, attempt_id: i64) -> crate::Result<AttemptStatusReport> {
        let attempt = self.storage.lock().get_attempt(attempt_id)?;
        let key = attempt.key();

        let payload = self
            .fences
            .load(key)?
            .and_then(|record| record.payload)
            .filter(|payload| payload.attempt_id == attempt_id);
        let fenced = payload.is_some();

        Ok(AttemptStatusReport {
            fenced,
            alive: fenced && self.fences.is_alive(key)?,
            stage: payload.and_then(|payload| payload.stage),
            progress: if fenced { self.fences.progress(key)? } else { None },
            stop_requested: fenced && self.fences.stop_requested(key)?,
            attempt,
        })
    }

    fn is_fenced_by(&self, key: RunKey, attempt_id: i64) -> crate::Result<bool> {
        Ok(self
            .fences
            .load(key)?
            .and_then(|record| record.payload)
            .is_some_and(|payload| payload.attempt_id == attempt_id))
    }

    /// Records that the loop `role` is alive, expiring after `ttl`
    pub fn write_heartbeat(&self, role: &str, ttl: Duration) -> crate::Result<()> {
        self.fences.cache().set(
            &heartbeat_key(role),
            &Utc::now().to_rfc3339(),
            Some(ttl),
        )?;
        Ok(())
    }

    /// Returns when `role` last beat, or None if its heartbeat expired
    pub fn read_heartbeat(&self, role: &str) -> crate::Result<Option<DateTime<Utc>>> {
        Ok(self
            .fences
            .cache()
            .get(&heartbeat_key(role))?
            .and_then(|value| DateTime::parse_from_rfc3339(&value).ok())
            .map(|ts| ts.with_timezone(&Utc)))
    }
}
