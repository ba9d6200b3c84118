//! First-wins failure recording

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Write-once record of the first handler failure
///
/// Later failures are counted but never replace the stored error, so the
/// error surfaced to the caller doesn't depend on how concurrent failures
/// happen to be scheduled after the first one lands.
#[derive(Default)]
pub struct FailureTracker {
    first: OnceLock<Arc<anyhow::Error>>,
    discarded: AtomicUsize,
}

impl FailureTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `err` if nothing is stored yet
    ///
    /// Returns `true` if this call stored it.
    pub fn record(&self, err: anyhow::Error) -> bool {
        let stored = self.first.set(Arc::new(err)).is_ok();
        if !stored {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
        stored
    }

    /// The stored error, if any
    pub fn get(&self) -> Option<Arc<anyhow::Error>> {
        self.first.get().cloned()
    }

    /// Whether a failure has been recorded
    pub fn is_set(&self) -> bool {
        self.first.get().is_some()
    }

    /// How many failures arrived after the first and were dropped
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }
}
