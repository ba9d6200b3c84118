//! Queue sources
//!
//! This module provides:
//! - [`QueueSource`] trait for blocking pop / push against a shared queue
//! - [`InMemoryQueueSource`] for testing and single-process use
//! - [`PostgresQueueSource`] for production

mod memory;
mod postgres;
mod queue;

pub use memory::InMemoryQueueSource;
pub use postgres::{PostgresQueueSource, DEFAULT_REPOLL_INTERVAL};
pub use queue::{QueueError, QueueSource};
