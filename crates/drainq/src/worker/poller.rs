//! Queue polling with retry on source failures
//!
//! Wraps `pop_wait` so that transport faults back off exponentially instead
//! of spinning, and become fatal after too many in a row.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace, warn};

use super::duration_millis;
use crate::source::{QueueError, QueueSource};

/// How the listener reacts when the queue source itself fails
///
/// # Example
///
/// ```
/// use drainq::SourceRetryPolicy;
/// use std::time::Duration;
///
/// let policy = SourceRetryPolicy::default()
///     .with_initial_backoff(Duration::from_millis(50))
///     .with_max_consecutive_failures(Some(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRetryPolicy {
    /// Delay after the first failure
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,

    /// Upper bound on the delay
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,

    /// Backoff multiplier per consecutive failure
    pub backoff_multiplier: f64,

    /// Jitter factor (0.0-1.0)
    pub jitter: f64,

    /// Consecutive failures after which the source is considered gone
    ///
    /// `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for SourceRetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: 0.1,
            max_consecutive_failures: Some(10),
        }
    }
}

impl SourceRetryPolicy {
    /// Set the delay after the first failure
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the maximum delay
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Set how many consecutive failures are tolerated
    pub fn with_max_consecutive_failures(mut self, max: Option<u32>) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    /// Delay before retrying after `failures` consecutive failures (1-based)
    pub fn delay_for_failure(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_backoff.as_secs_f64()
            * self.backoff_multiplier.powi(failures.saturating_sub(1) as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let jitter_offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether `failures` consecutive failures should stop the listener
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_consecutive_failures
            .is_some_and(|max| failures >= max)
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// The source kept failing past the retry policy
    #[error("queue source failed {attempts} times in a row: {source}")]
    SourceUnavailable {
        attempts: u32,
        #[source]
        source: QueueError,
    },
}

/// Pops payloads for one key, backing off on source failures
pub struct QueuePoller {
    source: Arc<dyn QueueSource>,
    key: String,
    timeout: Duration,
    policy: SourceRetryPolicy,
    consecutive_failures: u32,
    stop_rx: watch::Receiver<bool>,
}

impl QueuePoller {
    /// Create a new poller
    pub fn new(
        source: Arc<dyn QueueSource>,
        key: impl Into<String>,
        timeout: Duration,
        policy: SourceRetryPolicy,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            key: key.into(),
            timeout,
            policy,
            consecutive_failures: 0,
            stop_rx,
        }
    }

    /// Pop one payload
    ///
    /// Returns `Ok(None)` when `pop_wait` timed out, or after backing off from
    /// a tolerated source failure. Either way the caller should re-check its
    /// own state and poll again.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn poll(&mut self) -> Result<Option<Vec<u8>>, PollerError> {
        match self.source.pop_wait(&self.key, self.timeout).await {
            Ok(item) => {
                if self.consecutive_failures > 0 {
                    debug!(
                        failures = self.consecutive_failures,
                        "Queue source recovered"
                    );
                    self.consecutive_failures = 0;
                }
                if item.is_none() {
                    trace!("Poll timed out with no item");
                }
                Ok(item)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if self.policy.is_exhausted(self.consecutive_failures) {
                    return Err(PollerError::SourceUnavailable {
                        attempts: self.consecutive_failures,
                        source: e,
                    });
                }

                let delay = self.policy.delay_for_failure(self.consecutive_failures);
                warn!(
                    error = %e,
                    failures = self.consecutive_failures,
                    delay_ms = delay.as_millis() as u64,
                    "Queue source error, backing off"
                );
                self.wait(delay).await;
                Ok(None)
            }
        }
    }

    /// Consecutive failures since the last successful pop
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Sleep for `delay`, returning early if a stop is requested
    async fn wait(&mut self, delay: Duration) {
        if *self.stop_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.stop_rx.changed() => {
                debug!("Stop requested during backoff");
            }
        }
    }
}
