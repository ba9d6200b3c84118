//! Worker pool for task execution
//!
//! Runs handler invocations concurrently, bounded by the backpressure gate,
//! and routes every failure through the first-wins tracker.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::anyhow;
use futures::FutureExt;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use super::backpressure::{BackpressureError, BackpressureState};
use super::failure::FailureTracker;
use super::stats::{ListenerStats, StatsCounters};
use crate::task::Task;

/// Handler execution result
pub type HandlerResult = anyhow::Result<()>;

/// Task handler function type
pub type TaskHandler = Arc<
    dyn Fn(Task) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync,
>;

/// Wrap an async closure as a [`TaskHandler`]
pub fn handler_fn<F, Fut>(handler: F) -> TaskHandler
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |task| Box::pin(handler(task)))
}

/// Wrap a synchronous closure as a [`TaskHandler`]
///
/// Each invocation runs on tokio's blocking thread pool, so the closure may
/// sleep or do CPU-heavy work without stalling the listener.
pub fn blocking_handler_fn<F>(handler: F) -> TaskHandler
where
    F: Fn(Task) -> HandlerResult + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |task| {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || handler(task)).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(anyhow!(
                    "task handler panicked: {}",
                    panic_message(e.into_panic().as_ref())
                )),
                Err(e) => Err(anyhow!("blocking task handler was cancelled: {e}")),
            }
        })
    })
}

/// Bounded pool of concurrently running handler invocations
///
/// # Example
///
/// ```ignore
/// use drainq::worker::{handler_fn, WorkerPool};
///
/// let pool = WorkerPool::new(handler_fn(|task| async move { Ok(()) }), 4)?;
/// pool.submit(task).await?;
/// pool.drain().await;
/// ```
pub struct WorkerPool {
    handler: TaskHandler,
    backpressure: Arc<BackpressureState>,
    failures: Arc<FailureTracker>,
    tracker: TaskTracker,
    stats: Arc<StatsCounters>,
}

impl WorkerPool {
    /// Create a pool running at most `max_workers` handlers at once
    pub fn new(handler: TaskHandler, max_workers: usize) -> Result<Self, BackpressureError> {
        Self::with_parts(
            handler,
            max_workers,
            Arc::new(StatsCounters::default()),
            TaskTracker::new(),
        )
    }

    /// Build a pool that spawns onto `tracker`, so the owner can still wait
    /// for its tasks if the pool itself is dropped
    pub(crate) fn with_parts(
        handler: TaskHandler,
        max_workers: usize,
        stats: Arc<StatsCounters>,
        tracker: TaskTracker,
    ) -> Result<Self, BackpressureError> {
        Ok(Self {
            handler,
            backpressure: Arc::new(BackpressureState::new(max_workers)?),
            failures: Arc::new(FailureTracker::new()),
            tracker,
            stats,
        })
    }

    /// Dispatch a task to a worker
    ///
    /// Returns as soon as the task is spawned. Only waits if every slot is
    /// taken; the listener checks the gate first so that doesn't happen in
    /// normal operation. Fails once the pool has been drained.
    pub async fn submit(&self, task: Task) -> Result<(), BackpressureError> {
        let slot = self.backpressure.admit().await?;
        self.stats.task_admitted(self.backpressure.current_load());

        let handler = Arc::clone(&self.handler);
        let failures = Arc::clone(&self.failures);
        let stats = Arc::clone(&self.stats);

        self.tracker.spawn(async move {
            let outcome = AssertUnwindSafe(async move { handler(task).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(anyhow!(
                        "task handler panicked: {}",
                        panic_message(panic.as_ref())
                    ))
                });

            match outcome {
                Ok(()) => {
                    stats.task_succeeded();
                    debug!("Task completed");
                }
                Err(err) => {
                    stats.task_failed();
                    error!(error = %format!("{err:#}"), "Task handler failed");
                    if !failures.record(err) {
                        warn!("Failure discarded, an earlier failure is already recorded");
                    }
                }
            }

            // Failure is on record before the slot frees, so a woken listener sees it
            drop(slot);
        });

        Ok(())
    }

    /// Number of handler invocations currently running
    pub fn in_flight(&self) -> usize {
        self.backpressure.current_load()
    }

    /// Wait for every submitted invocation to finish, then close the pool
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.backpressure.drain().await;
    }

    /// The pool's backpressure gate
    pub fn backpressure(&self) -> &Arc<BackpressureState> {
        &self.backpressure
    }

    /// The pool's failure record
    pub fn failures(&self) -> &Arc<FailureTracker> {
        &self.failures
    }

    /// Counters for this pool
    pub fn stats(&self) -> ListenerStats {
        self.stats.snapshot()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn task(x: i64) -> Task {
        Task::decode(json!({ "x": x }).to_string().as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_runs_submitted_tasks() {
        let seen = Arc::new(AtomicUsize::new(0));
        let handler = {
            let seen = Arc::clone(&seen);
            handler_fn(move |_task| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let pool = WorkerPool::new(handler, 2).unwrap();

        for i in 0..5 {
            pool.submit(task(i)).await.unwrap();
        }
        pool.drain().await;

        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert_eq!(pool.in_flight(), 0);
        let stats = pool.stats();
        assert_eq!(stats.admitted, 5);
        assert_eq!(stats.succeeded, 5);
        assert!(stats.peak_in_flight <= 2);
    }

    #[tokio::test]
    async fn test_submit_after_drain_fails() {
        let pool = WorkerPool::new(handler_fn(|_| async { Ok(()) }), 1).unwrap();
        pool.drain().await;

        assert!(matches!(
            pool.submit(task(0)).await,
            Err(BackpressureError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_failure_recorded_and_others_complete() {
        let completed = Arc::new(AtomicUsize::new(0));
        let handler = {
            let completed = Arc::clone(&completed);
            handler_fn(move |task| {
                let completed = Arc::clone(&completed);
                async move {
                    if task.get("x") == Some(&json!(1)) {
                        anyhow::bail!("boom");
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let pool = WorkerPool::new(handler, 3).unwrap();

        for i in 0..3 {
            pool.submit(task(i)).await.unwrap();
        }
        pool.drain().await;

        assert_eq!(completed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.failures().get().unwrap().to_string(), "boom");
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_panic_is_recorded_as_failure() {
        let pool = WorkerPool::new(
            handler_fn(|task: Task| async move {
                if task.get("x").is_some() {
                    panic!("handler exploded");
                }
                Ok(())
            }),
            1,
        )
        .unwrap();

        pool.submit(task(0)).await.unwrap();
        pool.drain().await;

        let err = pool.failures().get().unwrap();
        assert_eq!(err.to_string(), "task handler panicked: handler exploded");
        assert_eq!(pool.backpressure().current_load(), 0);
    }

    #[tokio::test]
    async fn test_blocking_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let handler = {
            let seen = Arc::clone(&seen);
            blocking_handler_fn(move |_task| {
                std::thread::sleep(Duration::from_millis(10));
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let pool = WorkerPool::new(handler, 2).unwrap();

        for i in 0..4 {
            pool.submit(task(i)).await.unwrap();
        }
        pool.drain().await;

        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_blocking_handler_panic() {
        let pool = WorkerPool::new(
            blocking_handler_fn(|_| panic!("sync boom")),
            1,
        )
        .unwrap();

        pool.submit(task(0)).await.unwrap();
        pool.drain().await;

        assert_eq!(
            pool.failures().get().unwrap().to_string(),
            "task handler panicked: sync boom"
        );
    }
}
