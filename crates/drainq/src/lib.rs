//! # drainq
//!
//! A bounded-concurrency consumer for shared blocking work queues.
//!
//! ## Features
//!
//! - **Admission limit**: no more than `max_workers` handler invocations in flight
//! - **Backpressure**: intake pauses while the pool is saturated, then resumes
//!   (or halts for good, if configured that way)
//! - **Fail-fast shutdown**: the first handler error stops intake, in-flight work
//!   runs to completion, and the error is returned from [`QueueListener::start`]
//! - **Pluggable sources**: in-memory for tests, PostgreSQL for production
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      QueueSource                             │
//! │  (pop_wait with timeout: in-memory, PostgreSQL)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     QueueListener                            │
//! │  (waits for capacity, pops, decodes, submits; drains on exit)│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                              │
//! │  (semaphore-bounded tasks, first-wins failure tracking)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use drainq::prelude::*;
//!
//! let source = Arc::new(InMemoryQueueSource::new());
//! let listener = QueueListener::new(source, ListenerConfig::new("jobs").with_max_workers(8));
//!
//! listener.register_handler(|task| async move {
//!     let x = task.get("x").and_then(|v| v.as_i64()).unwrap_or_default();
//!     println!("got {x}");
//!     Ok(())
//! })?;
//!
//! // Blocks until shutdown, permanent pause, or the first handler failure
//! listener.start().await?;
//! ```

pub mod source;
pub mod task;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::source::{InMemoryQueueSource, PostgresQueueSource, QueueError, QueueSource};
    pub use crate::task::{DecodeError, Task};
    pub use crate::worker::{
        ListenerConfig, ListenerError, ListenerStats, ListenerStatus, QueueListener,
        SourceRetryPolicy, StopReason, WorkerPool,
    };
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use source::{InMemoryQueueSource, PostgresQueueSource, QueueError, QueueSource};
pub use task::{DecodeError, Task};
pub use worker::{
    BackpressureState, FailureTracker, ListenerConfig, ListenerError, ListenerStats,
    ListenerStatus, QueueListener, SourceRetryPolicy, StopReason, WorkerPool,
};
