//! Run statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of what one listener run has done so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerStats {
    /// Tasks handed to the worker pool
    pub admitted: u64,
    /// Handler invocations that returned `Ok`
    pub succeeded: u64,
    /// Handler invocations that returned an error or panicked
    pub failed: u64,
    /// Payloads discarded because they didn't decode
    pub malformed: u64,
    /// Highest number of simultaneously running handlers
    pub peak_in_flight: u64,
}

#[derive(Default)]
pub(crate) struct StatsCounters {
    admitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
    peak_in_flight: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn task_admitted(&self, in_flight: usize) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
        self.peak_in_flight
            .fetch_max(in_flight as u64, Ordering::Relaxed);
    }

    pub(crate) fn task_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn payload_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }
}
