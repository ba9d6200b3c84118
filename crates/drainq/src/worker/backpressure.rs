//! Backpressure management for the worker pool
//!
//! Tracks in-flight handler invocations against a fixed capacity and lets the
//! listener block until a slot frees up.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Backpressure-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    /// Invalid configuration
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),

    /// The gate was closed by a drain
    #[error("backpressure gate is closed")]
    Closed,
}

/// Backpressure state for a worker pool
///
/// Each in-flight invocation holds one semaphore permit, so
/// `saturated ⟺ in_flight >= max_workers` holds without a separate lock.
/// Completions wake waiters through the semaphore itself.
pub struct BackpressureState {
    slots: Arc<Semaphore>,
    max_workers: usize,
    current_load: AtomicUsize,
    peak_load: AtomicUsize,
    saturated: AtomicBool,
}

impl BackpressureState {
    /// Create a new backpressure state with `max_workers` slots
    pub fn new(max_workers: usize) -> Result<Self, BackpressureError> {
        if max_workers == 0 {
            return Err(BackpressureError::InvalidConfig(
                "max_workers must be at least 1".into(),
            ));
        }
        if max_workers > Semaphore::MAX_PERMITS || u32::try_from(max_workers).is_err() {
            return Err(BackpressureError::InvalidConfig(format!(
                "max_workers {max_workers} is too large"
            )));
        }

        Ok(Self {
            slots: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            current_load: AtomicUsize::new(0),
            peak_load: AtomicUsize::new(0),
            saturated: AtomicBool::new(false),
        })
    }

    /// Whether every slot is taken
    pub fn is_saturated(&self) -> bool {
        self.slots.available_permits() == 0
    }

    /// Get the current load
    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::SeqCst)
    }

    /// Highest load observed so far
    pub fn peak_load(&self) -> usize {
        self.peak_load.load(Ordering::SeqCst)
    }

    /// Get the maximum concurrency
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Get the number of available slots
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Block until at least one slot is free
    ///
    /// Returns immediately if capacity is already available. The slot is not
    /// reserved; the caller is expected to be the only one admitting work.
    pub async fn wait_for_capacity(&self) -> Result<(), BackpressureError> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| BackpressureError::Closed)?;
        drop(permit);
        Ok(())
    }

    /// Take a slot, waiting if none is free
    ///
    /// The returned guard releases the slot when dropped.
    pub async fn admit(self: &Arc<Self>) -> Result<SlotGuard, BackpressureError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| BackpressureError::Closed)?;
        Ok(self.occupy(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_admit(self: &Arc<Self>) -> Option<SlotGuard> {
        let permit = Arc::clone(&self.slots).try_acquire_owned().ok()?;
        Some(self.occupy(permit))
    }

    /// Wait until every slot is free, then close the gate
    ///
    /// After a drain no further work can be admitted.
    pub async fn drain(&self) {
        // Only fails if already closed, in which case there is nothing to wait for
        if let Ok(all) = self.slots.acquire_many(self.max_workers as u32).await {
            self.slots.close();
            drop(all);
        }
        debug!("Backpressure gate drained");
    }

    fn occupy(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> SlotGuard {
        let load = self.current_load.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_load.fetch_max(load, Ordering::SeqCst);
        if load >= self.max_workers && !self.saturated.swap(true, Ordering::SeqCst) {
            debug!(load, max_workers = self.max_workers, "Capacity exhausted");
        }
        SlotGuard {
            state: Arc::clone(self),
            _permit: permit,
        }
    }

    fn release(&self) {
        let load = self.current_load.fetch_sub(1, Ordering::SeqCst) - 1;
        if load < self.max_workers && self.saturated.swap(false, Ordering::SeqCst) {
            debug!(load, max_workers = self.max_workers, "Capacity available");
        }
    }
}

/// One occupied slot in a [`BackpressureState`]
///
/// The load counter is updated before the permit is returned, so anyone woken
/// by the release sees the new count.
pub struct SlotGuard {
    state: Arc<BackpressureState>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.state.release();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_rejects_zero_workers() {
        assert!(matches!(
            BackpressureState::new(0),
            Err(BackpressureError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_accepts_initially() {
        let state = BackpressureState::new(4).unwrap();
        assert!(!state.is_saturated());
        assert_eq!(state.available_slots(), 4);
        assert_eq!(state.current_load(), 0);
    }

    #[test]
    fn test_saturates_at_capacity() {
        let state = Arc::new(BackpressureState::new(2).unwrap());

        let a = state.try_admit().unwrap();
        assert!(!state.is_saturated());
        let b = state.try_admit().unwrap();
        assert!(state.is_saturated());
        assert!(state.try_admit().is_none());
        assert_eq!(state.current_load(), 2);

        drop(a);
        assert!(!state.is_saturated());
        assert_eq!(state.current_load(), 1);
        drop(b);
        assert_eq!(state.current_load(), 0);
        assert_eq!(state.peak_load(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_capacity_returns_immediately_when_free() {
        let state = BackpressureState::new(1).unwrap();
        tokio::time::timeout(Duration::from_millis(100), state.wait_for_capacity())
            .await
            .expect("should not block")
            .unwrap();
        assert_eq!(state.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_capacity_wakes_on_release() {
        let state = Arc::new(BackpressureState::new(1).unwrap());
        let slot = state.try_admit().unwrap();

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_for_capacity().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(slot);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_all_slots_then_closes() {
        let state = Arc::new(BackpressureState::new(2).unwrap());
        let a = state.try_admit().unwrap();
        let b = state.try_admit().unwrap();

        let drainer = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.drain().await })
        };

        drop(a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drainer.is_finished());

        drop(b);
        drainer.await.unwrap();

        assert!(state.try_admit().is_none());
        assert!(matches!(
            state.wait_for_capacity().await,
            Err(BackpressureError::Closed)
        ));
    }
}
