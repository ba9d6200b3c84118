//! Queue listener and worker pool
//!
//! This module provides:
//! - [`QueueListener`] - Control loop and lifecycle (start, drain, shutdown)
//! - [`WorkerPool`] - Bounded concurrent handler execution
//! - [`BackpressureState`] - Capacity gate driving pause/resume
//! - [`FailureTracker`] - First-wins record of handler failures
//! - [`QueuePoller`] - `pop_wait` with backoff on source failures
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     QueueListener                            │
//! │  ┌─────────────┐  ┌──────────────────┐  ┌────────────────┐  │
//! │  │ QueuePoller │─▶│   Task::decode   │─▶│  WorkerPool    │  │
//! │  │ (pop_wait)  │  │ (skip malformed) │  │  ::submit      │  │
//! │  └─────────────┘  └──────────────────┘  └───────┬────────┘  │
//! │         ▲                                        │           │
//! │         │                                        ▼           │
//! │  ┌──────┴──────────────────────────────────────────────┐    │
//! │  │  BackpressureState (semaphore)   FailureTracker     │    │
//! │  │  [Task 1] [Task 2] ... [Task N]  (first error wins)  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use drainq::worker::{ListenerConfig, QueueListener};
//!
//! let config = ListenerConfig::new("jobs")
//!     .with_max_workers(4)
//!     .with_poll_timeout(Duration::from_secs(1));
//!
//! let listener = Arc::new(QueueListener::new(source, config));
//! listener.register_handler(|task| async move {
//!     process(task).await
//! })?;
//!
//! let runner = tokio::spawn({
//!     let listener = Arc::clone(&listener);
//!     async move { listener.start().await }
//! });
//!
//! // Graceful shutdown: stop intake, wait for in-flight tasks
//! listener.shutdown(true).await;
//! runner.await??;
//! ```

mod backpressure;
mod config;
mod failure;
mod listener;
mod poller;
mod pool;
mod stats;

pub use backpressure::{BackpressureError, BackpressureState, SlotGuard};
pub use config::ListenerConfig;
pub use failure::FailureTracker;
pub use listener::{ListenerError, ListenerStatus, QueueListener, StopReason};
pub use poller::{PollerError, QueuePoller, SourceRetryPolicy};
pub use pool::{blocking_handler_fn, handler_fn, HandlerResult, TaskHandler, WorkerPool};
pub use stats::ListenerStats;

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
