//! Liveness renewal and cooperative stop checks for one attempt

use crate::fence::{FenceHandle, FenceManager};
use crate::FencelineError;
use parking_lot::Mutex;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Keeps a run's liveness signal fresh while the crawl executes
///
/// A background thread renews liveness every third of its TTL. A failed renewal
/// is fatal, including one refused because the fence was torn down or now
/// belongs to another run: the next `should_stop` call returns `LivenessLost`
/// instead of letting the crawl continue unmonitored. The wall-clock hard
/// timeout is checked on the same path.
pub struct WorkerSupervisor {
    fences: FenceManager,
    handle: FenceHandle,
    fatal: Arc<Mutex<Option<String>>>,
    deadline: Instant,
    shutdown: Option<Sender<()>>,
    renewer: Option<JoinHandle<()>>,
}

impl WorkerSupervisor {
    /// Renews liveness once and starts the renewal thread
    ///
    /// # Arguments
    ///
    /// * `fences` - Fence manager for the run's cache
    /// * `handle` - Handle of the fence this worker owns
    /// * `hard_timeout` - Wall-clock limit for the attempt
    ///
    /// # Returns
    ///
    /// * `Ok(WorkerSupervisor)` - Liveness is fresh and renewal is running
    /// * `Err(FencelineError)` - The first renewal failed
    pub fn start(
        fences: FenceManager,
        handle: FenceHandle,
        hard_timeout: Duration,
    ) -> crate::Result<Self> {
        fences.renew(&handle)?;

        let interval = renewal_interval(fences.liveness_ttl());
        let fatal = Arc::new(Mutex::new(None));
        let (shutdown, stop_rx) = mpsc::channel::<()>();

        let renewer = {
            let fences = fences.clone();
            let handle = handle.clone();
            let fatal = Arc::clone(&fatal);
            std::thread::Builder::new()
                .name(format!("liveness-{}", handle.key))
                .spawn(move || loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = fences.renew(&handle) {
                                tracing::error!(
                                    "Liveness renewal failed for {}: {}",
                                    handle.key,
                                    e
                                );
                                *fatal.lock() = Some(match e {
                                    FencelineError::LivenessLost(reason) => reason,
                                    other => other.to_string(),
                                });
                                break;
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                })?
        };

        Ok(Self {
            fences,
            handle,
            fatal,
            deadline: Instant::now() + hard_timeout,
            shutdown: Some(shutdown),
            renewer: Some(renewer),
        })
    }

    pub fn handle(&self) -> &FenceHandle {
        &self.handle
    }

    /// Polled between yielded items
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Cancellation was requested; stop cleanly
    /// * `Ok(false)` - Keep going
    /// * `Err(LivenessLost)` - Renewal failed; the run must abort
    /// * `Err(Aborted)` - The hard timeout elapsed
    pub fn should_stop(&self) -> crate::Result<bool> {
        if let Some(reason) = self.fatal.lock().clone() {
            return Err(FencelineError::LivenessLost(reason));
        }
        if Instant::now() >= self.deadline {
            return Err(FencelineError::Aborted("hard timeout exceeded".to_string()));
        }
        self.fences.stop_requested(self.handle.key)
    }

    /// Adds processed documents to the run's progress counter
    pub fn report_progress(&self, delta: u64) -> crate::Result<i64> {
        self.fences.incr_progress(self.handle.key, delta as i64)
    }

    /// Stops the renewal thread and waits for it to exit
    pub fn finish(mut self) {
        self.stop_renewer();
    }

    fn stop_renewer(&mut self) {
        // Dropping the sender wakes the thread immediately
        self.shutdown.take();
        if let Some(renewer) = self.renewer.take() {
            if renewer.join().is_err() {
                tracing::error!("Liveness renewal thread for {} panicked", self.handle.key);
            }
        }
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        self.stop_renewer();
    }
}

/// Renewal cadence: a third of the TTL, never below 10ms
fn renewal_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(10))
}
