//! Retry decorator for connectors

use crate::config::WorkerConfig;
use crate::connector::traits::{Page, PageRequest, Source, SourceError, StageSpec};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// How transient connector errors are retried
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total calls made, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Computes the delay before retry number `retry` (0-based)
    ///
    /// Exponential in `retry`, capped at `max_delay`, with ±10% jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        if base == 0 {
            return Duration::ZERO;
        }

        let multiplier = 2_u64.saturating_pow(retry.min(20));
        let capped = base.saturating_mul(multiplier).min(max);

        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        let delay = ((capped as f64) * jitter) as u64;
        Duration::from_millis(delay.clamp(base, max.max(base)))
    }
}

/// Wraps a connector and retries its transient errors
///
/// Exhausted retries become scoped failures for page fetches (the container is
/// marked complete-with-error) and systemic failures for container discovery.
pub struct RetryingSource<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: Source> RetryingSource<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Runs `call` until it succeeds, fails non-transiently, or attempts run out
    ///
    /// # Returns
    ///
    /// * `Ok(T)` - The call succeeded
    /// * `Err((SourceError, bool))` - The final error, and whether retries were exhausted
    fn with_retry<T>(
        &self,
        operation: &str,
        mut call: impl FnMut() -> Result<T, SourceError>,
    ) -> Result<T, (SourceError, bool)> {
        let mut attempt = 0;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(SourceError::Transient(message)) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        warn!(
                            "{} on {} failed after {} attempts: {}",
                            operation,
                            self.inner.name(),
                            attempt,
                            message
                        );
                        return Err((SourceError::Transient(message), true));
                    }
                    let delay = self.policy.backoff(attempt - 1);
                    debug!(
                        "{} on {} hit transient error ({}), retrying in {:?}",
                        operation,
                        self.inner.name(),
                        message,
                        delay
                    );
                    std::thread::sleep(delay);
                }
                Err(other) => return Err((other, false)),
            }
        }
    }
}

impl<S: Source> Source for RetryingSource<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn stages(&self) -> Vec<StageSpec> {
        self.inner.stages()
    }

    fn discover_containers(&self, stage: &StageSpec) -> Result<Vec<String>, SourceError> {
        self.with_retry("container discovery", || self.inner.discover_containers(stage))
            .map_err(|(error, exhausted)| match error {
                SourceError::Transient(message) if exhausted => SourceError::Systemic(format!(
                    "discovering containers of stage {}: {}",
                    stage.name, message
                )),
                other => other,
            })
    }

    fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, SourceError> {
        self.with_retry("page fetch", || self.inner.fetch_page(request))
            .map_err(|(error, exhausted)| match error {
                SourceError::Transient(message) if exhausted => SourceError::Scoped {
                    container: request.container.to_string(),
                    message: format!(
                        "gave up after {} attempts: {}",
                        self.policy.max_attempts, message
                    ),
                },
                other => other,
            })
    }
}
