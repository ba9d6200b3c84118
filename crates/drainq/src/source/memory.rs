//! In-memory implementation of QueueSource for testing

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::queue::{QueueError, QueueSource};

/// In-memory implementation of QueueSource
///
/// Keeps one FIFO per key. `pop_wait` blocks on a [`Notify`] until a push
/// lands or the timeout expires, so it behaves like a real blocking pop
/// rather than a poll loop.
///
/// # Example
///
/// ```
/// use drainq::InMemoryQueueSource;
///
/// let source = InMemoryQueueSource::new();
/// source.push_json("jobs", &serde_json::json!({"x": 1}));
/// assert_eq!(source.len("jobs"), 1);
/// ```
pub struct InMemoryQueueSource {
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    pushed: Notify,
    injected_failures: AtomicU32,
}

impl InMemoryQueueSource {
    /// Create a new in-memory source
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            pushed: Notify::new(),
            injected_failures: AtomicU32::new(0),
        }
    }

    /// Append a raw payload without going through the async trait
    pub fn push_raw(&self, key: &str, payload: impl Into<Vec<u8>>) {
        self.queues
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(payload.into());
        self.pushed.notify_waiters();
    }

    /// Append a JSON-encoded payload
    pub fn push_json(&self, key: &str, value: &serde_json::Value) {
        self.push_raw(key, value.to_string());
    }

    /// Number of payloads waiting under `key`
    pub fn len(&self, key: &str) -> usize {
        self.queues.lock().get(key).map_or(0, VecDeque::len)
    }

    /// Whether no payloads are waiting under `key`
    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    /// Make the next `count` calls to `pop_wait` fail with
    /// [`QueueError::Unavailable`]
    pub fn fail_next_pops(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn try_pop(&self, key: &str) -> Option<Vec<u8>> {
        self.queues.lock().get_mut(key).and_then(VecDeque::pop_front)
    }
}

impl Default for InMemoryQueueSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueSource for InMemoryQueueSource {
    async fn pop_wait(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, QueueError> {
        if self.take_injected_failure() {
            return Err(QueueError::Unavailable("injected failure".into()));
        }

        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent push can't slip between
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.try_pop(key) {
                return Ok(Some(payload));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn push(&self, key: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        self.push_raw(key, payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_pop_returns_items_in_push_order() {
        let source = InMemoryQueueSource::new();
        source.push_raw("q", "a");
        source.push_raw("q", "b");

        let first = source.pop_wait("q", Duration::from_millis(10)).await.unwrap();
        let second = source.pop_wait("q", Duration::from_millis(10)).await.unwrap();

        assert_eq!(first.as_deref(), Some(&b"a"[..]));
        assert_eq!(second.as_deref(), Some(&b"b"[..]));
        assert!(source.is_empty("q"));
    }

    #[tokio::test]
    async fn test_pop_times_out_on_empty_queue() {
        let source = InMemoryQueueSource::new();
        let started = std::time::Instant::now();

        let item = source.pop_wait("q", Duration::from_millis(30)).await.unwrap();

        assert!(item.is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let source = Arc::new(InMemoryQueueSource::new());
        let popper = {
            let source = Arc::clone(&source);
            tokio::spawn(async move { source.pop_wait("q", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        source.push("q", b"late".to_vec()).await.unwrap();

        let item = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .expect("pop_wait should wake on push")
            .unwrap()
            .unwrap();
        assert_eq!(item.as_deref(), Some(&b"late"[..]));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let source = InMemoryQueueSource::new();
        source.push_raw("a", "1");

        let other = source.pop_wait("b", Duration::from_millis(5)).await.unwrap();

        assert!(other.is_none());
        assert_eq!(source.len("a"), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let source = InMemoryQueueSource::new();
        source.push_raw("q", "x");
        source.fail_next_pops(2);

        assert!(source.pop_wait("q", Duration::ZERO).await.is_err());
        assert!(source.pop_wait("q", Duration::ZERO).await.is_err());
        let item = source.pop_wait("q", Duration::ZERO).await.unwrap();
        assert_eq!(item.as_deref(), Some(&b"x"[..]));
    }
}
