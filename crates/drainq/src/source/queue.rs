//! QueueSource trait definition

use std::time::Duration;

use async_trait::async_trait;

/// Error type for queue source operations
///
/// The listener treats both variants as transport faults; see
/// [`SourceRetryPolicy`](crate::worker::SourceRetryPolicy) for how they are
/// retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// The backing store could not be reached
    #[error("queue source unavailable: {0}")]
    Unavailable(String),

    /// The backing store rejected the operation
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// A shared blocking queue exposed by an external store
///
/// Items are raw payloads; decoding happens in the listener. Implementations
/// must hand each payload to exactly one caller of `pop_wait`, in the order
/// they were pushed.
#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Pop the next payload for `key`, waiting up to `timeout` for one to arrive
    ///
    /// Returns `Ok(None)` when the timeout expires with the queue still empty.
    async fn pop_wait(&self, key: &str, timeout: Duration)
        -> Result<Option<Vec<u8>>, QueueError>;

    /// Append a payload to the tail of the queue for `key`
    async fn push(&self, key: &str, payload: Vec<u8>) -> Result<(), QueueError>;
}
