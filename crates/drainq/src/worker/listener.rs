//! Queue listener: the admission loop and its lifecycle
//!
//! One listener drains one queue key. `start()` runs the loop on the calling
//! task and only returns once intake has stopped and every dispatched handler
//! has finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::config::ListenerConfig;
use super::poller::{PollerError, QueuePoller};
use super::pool::{blocking_handler_fn, handler_fn, HandlerResult, TaskHandler, WorkerPool};
use super::stats::{ListenerStats, StatsCounters};
use crate::source::QueueSource;
use crate::task::Task;

/// Listener status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    /// Polling the queue and admitting tasks
    Running,
    /// Every worker is busy; waiting for one to finish
    Paused,
    /// Intake stopped; waiting for in-flight tasks to complete
    Draining,
    /// Not running
    Stopped,
}

/// Why a run ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `shutdown()` was called
    Requested,
    /// The pool saturated while `resume_when_idle` was off
    Saturated,
}

/// Queue listener errors
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// `start()` called before a handler was registered
    #[error("no task handler registered")]
    NoHandler,

    /// A second handler registration was attempted
    #[error("a task handler is already registered")]
    HandlerAlreadyRegistered,

    /// `start()` called while a previous run is still active
    #[error("queue listener is already running")]
    AlreadyRunning,

    /// Configuration rejected before any dispatch
    #[error("invalid listener configuration: {0}")]
    InvalidConfig(String),

    /// The first handler failure of the run
    #[error("task handler failed: {0:#}")]
    Handler(Arc<anyhow::Error>),

    /// The queue source failed past its retry policy
    #[error(transparent)]
    Source(#[from] PollerError),
}

impl ListenerError {
    /// The handler's original error, if this is a handler failure
    pub fn handler_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Handler(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// How the admission loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Failed,
    Requested,
    Saturated,
}

/// Flags and in-flight set for one `start()` invocation
struct RunState {
    stop_tx: watch::Sender<bool>,
    stopped_tx: watch::Sender<bool>,
    tracker: TaskTracker,
}

impl RunState {
    fn new() -> Self {
        Self {
            stop_tx: watch::Sender::new(false),
            stopped_tx: watch::Sender::new(false),
            tracker: TaskTracker::new(),
        }
    }
}

/// Releases a run back to `Stopped`
struct RunRelease {
    status_tx: Arc<watch::Sender<ListenerStatus>>,
    current_run: Arc<Mutex<Option<Arc<RunState>>>>,
    run: Arc<RunState>,
}

impl RunRelease {
    fn finish(self) {
        self.status_tx.send_replace(ListenerStatus::Stopped);
        *self.current_run.lock() = None;
        self.run.stopped_tx.send_replace(true);
    }
}

/// Marks the run finished however `start()` exits
///
/// If the `start()` future is dropped while handlers are still running, the
/// run stays claimed (status `Draining`) until they finish, so the worker
/// cap holds across a restart and `shutdown(true)` still waits for them.
struct RunGuard {
    release: Option<RunRelease>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };

        let tracker = release.run.tracker.clone();
        if tracker.is_empty() {
            release.finish();
            return;
        }

        tracker.close();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                release.status_tx.send_replace(ListenerStatus::Draining);
                warn!(
                    in_flight = tracker.len(),
                    "Listener dropped mid-run, waiting for in-flight tasks in the background"
                );
                handle.spawn(async move {
                    tracker.wait().await;
                    release.finish();
                });
            }
            // No runtime left to drive the handlers
            Err(_) => release.finish(),
        }
    }
}

/// Bounded-concurrency consumer for one queue key
///
/// # Example
///
/// ```ignore
/// use drainq::prelude::*;
///
/// let listener = QueueListener::new(source, ListenerConfig::new("jobs").with_max_workers(2));
///
/// listener.register_handler(|task| async move {
///     let job: MyJob = task.parse()?;
///     job.run().await
/// })?;
///
/// match listener.start().await {
///     Ok(reason) => println!("stopped: {reason:?}"),
///     Err(e) => eprintln!("listener failed: {e}"),
/// }
/// ```
pub struct QueueListener {
    source: Arc<dyn QueueSource>,
    config: ListenerConfig,
    handler: RwLock<Option<TaskHandler>>,
    status_tx: Arc<watch::Sender<ListenerStatus>>,
    current_run: Arc<Mutex<Option<Arc<RunState>>>>,
    stop_pending: AtomicBool,
    stats: Mutex<Arc<StatsCounters>>,
}

impl QueueListener {
    /// Create a new listener
    pub fn new(source: Arc<dyn QueueSource>, config: ListenerConfig) -> Self {
        Self {
            source,
            config,
            handler: RwLock::new(None),
            status_tx: Arc::new(watch::Sender::new(ListenerStatus::Stopped)),
            current_run: Arc::new(Mutex::new(None)),
            stop_pending: AtomicBool::new(false),
            stats: Mutex::new(Arc::new(StatsCounters::default())),
        }
    }

    /// Register the task handler
    ///
    /// Exactly one handler may be registered.
    pub fn register_handler<F, Fut>(&self, handler: F) -> Result<(), ListenerError>
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.set_handler(handler_fn(handler))
    }

    /// Register a synchronous task handler
    ///
    /// Invocations run on the blocking thread pool.
    pub fn register_blocking_handler<F>(&self, handler: F) -> Result<(), ListenerError>
    where
        F: Fn(Task) -> HandlerResult + Send + Sync + 'static,
    {
        self.set_handler(blocking_handler_fn(handler))
    }

    fn set_handler(&self, handler: TaskHandler) -> Result<(), ListenerError> {
        let mut slot = self.handler.write();
        if slot.is_some() {
            return Err(ListenerError::HandlerAlreadyRegistered);
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Run the listener until it stops
    ///
    /// Returns once intake has stopped and all dispatched tasks have
    /// finished: `Ok` after `shutdown()` or a permanent saturation pause,
    /// `Err` with the first handler failure (or a dead source) otherwise.
    #[instrument(skip(self), fields(listener_id = %self.config.listener_id, queue_key = %self.config.queue_key))]
    pub async fn start(&self) -> Result<StopReason, ListenerError> {
        self.config
            .validate()
            .map_err(ListenerError::InvalidConfig)?;
        let handler = self
            .handler
            .read()
            .clone()
            .ok_or(ListenerError::NoHandler)?;

        let run = {
            let mut current = self.current_run.lock();
            if current.is_some() {
                return Err(ListenerError::AlreadyRunning);
            }
            let run = Arc::new(RunState::new());
            if self.stop_pending.swap(false, Ordering::SeqCst) {
                debug!("Shutdown was requested before start, stopping at once");
                run.stop_tx.send_replace(true);
            }
            *current = Some(Arc::clone(&run));
            run
        };
        let _guard = RunGuard {
            release: Some(RunRelease {
                status_tx: Arc::clone(&self.status_tx),
                current_run: Arc::clone(&self.current_run),
                run: Arc::clone(&run),
            }),
        };

        let stats = Arc::new(StatsCounters::default());
        *self.stats.lock() = Arc::clone(&stats);
        let pool = WorkerPool::with_parts(
            handler,
            self.config.max_workers,
            Arc::clone(&stats),
            run.tracker.clone(),
        )
        .map_err(|e| ListenerError::InvalidConfig(e.to_string()))?;
        let mut poller = QueuePoller::new(
            Arc::clone(&self.source),
            self.config.queue_key.clone(),
            self.config.poll_timeout,
            self.config.source_retry.clone(),
            run.stop_tx.subscribe(),
        );

        self.status_tx.send_replace(ListenerStatus::Running);
        info!(
            max_workers = self.config.max_workers,
            poll_timeout_ms = self.config.poll_timeout.as_millis() as u64,
            resume_when_idle = self.config.resume_when_idle,
            "Queue listener started"
        );

        let exit = self.listen(&pool, &run, &mut poller, &stats).await;

        self.status_tx.send_replace(ListenerStatus::Draining);
        info!(
            in_flight = pool.in_flight(),
            exit = ?exit.as_ref().ok(),
            "Intake stopped, draining in-flight tasks"
        );
        pool.drain().await;

        let stats = stats.snapshot();
        if let Some(err) = pool.failures().get() {
            error!(
                error = %format!("{err:#}"),
                discarded = pool.failures().discarded(),
                ?stats,
                "Queue listener stopped after handler failure"
            );
            return Err(ListenerError::Handler(err));
        }

        match exit {
            Ok(LoopExit::Saturated) => {
                info!(?stats, "Queue listener stopped after saturation");
                Ok(StopReason::Saturated)
            }
            Ok(LoopExit::Requested | LoopExit::Failed) => {
                info!(?stats, "Queue listener stopped");
                Ok(StopReason::Requested)
            }
            Err(e) => {
                error!(error = %e, ?stats, "Queue listener stopped, source unavailable");
                Err(e.into())
            }
        }
    }

    /// The admission loop
    async fn listen(
        &self,
        pool: &WorkerPool,
        run: &RunState,
        poller: &mut QueuePoller,
        stats: &StatsCounters,
    ) -> Result<LoopExit, PollerError> {
        let mut stop_rx = run.stop_tx.subscribe();
        let gate = pool.backpressure();

        loop {
            if pool.failures().is_set() {
                debug!("Handler failure recorded, stopping intake");
                return Ok(LoopExit::Failed);
            }

            if *stop_rx.borrow() {
                debug!("Stop requested, stopping intake");
                return Ok(LoopExit::Requested);
            }

            if gate.is_saturated() {
                self.status_tx.send_replace(ListenerStatus::Paused);
                debug!(in_flight = gate.current_load(), "Worker pool saturated, pausing intake");

                tokio::select! {
                    res = gate.wait_for_capacity() => {
                        if res.is_err() {
                            return Ok(LoopExit::Requested);
                        }
                    }
                    _ = stop_rx.changed() => continue,
                }

                if !self.config.resume_when_idle {
                    info!("Capacity freed but resume_when_idle is off, stopping intake");
                    return Ok(LoopExit::Saturated);
                }

                self.status_tx.send_replace(ListenerStatus::Running);
                debug!("Capacity available, resuming intake");
                continue;
            }

            let Some(raw) = poller.poll().await? else {
                continue;
            };

            match Task::decode(&raw) {
                Ok(task) => {
                    if let Err(e) = pool.submit(task).await {
                        warn!(error = %e, "Worker pool closed, stopping intake");
                        return Ok(LoopExit::Requested);
                    }
                }
                Err(e) => {
                    stats.payload_malformed();
                    warn!(
                        error = %e,
                        payload = %String::from_utf8_lossy(&raw),
                        "Discarding malformed payload"
                    );
                }
            }
        }
    }

    /// Stop intake, optionally waiting for in-flight tasks to finish
    ///
    /// Safe to call from any task while `start()` runs. When no run is active
    /// the request is kept, and the next `start()` stops before admitting
    /// anything; this covers a `start()` that was spawned but hasn't been
    /// polled yet. Don't pass `wait = true` from inside a handler: the drain
    /// would wait on the handler itself.
    pub async fn shutdown(&self, wait: bool) {
        let run = {
            let current = self.current_run.lock();
            match current.as_ref() {
                Some(run) => Arc::clone(run),
                None => {
                    if !self.stop_pending.swap(true, Ordering::SeqCst) {
                        debug!(
                            listener_id = %self.config.listener_id,
                            "Listener not running, stop kept for the next start"
                        );
                    }
                    return;
                }
            }
        };

        if !run.stop_tx.send_replace(true) {
            info!(listener_id = %self.config.listener_id, "Shutdown requested");
        }

        if wait {
            let mut stopped_rx = run.stopped_tx.subscribe();
            // Only errs if the run state is gone, which also means it's stopped
            let _ = stopped_rx.wait_for(|stopped| *stopped).await;
        }
    }

    /// Get current status
    pub fn status(&self) -> ListenerStatus {
        *self.status_tx.borrow()
    }

    /// Subscribe to status changes
    pub fn status_watch(&self) -> watch::Receiver<ListenerStatus> {
        self.status_tx.subscribe()
    }

    /// Whether a run is active
    pub fn is_running(&self) -> bool {
        self.current_run.lock().is_some()
    }

    /// Counters for the current or most recent run
    pub fn stats(&self) -> ListenerStats {
        self.stats.lock().snapshot()
    }

    /// Run until Ctrl-C, then shut down gracefully
    ///
    /// A convenience for binaries; behaves like [`start`](Self::start)
    /// otherwise, including returning the first handler failure.
    pub async fn start_until_ctrl_c(&self) -> Result<StopReason, ListenerError> {
        let run = self.start();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    info!(listener_id = %self.config.listener_id, "Received Ctrl-C, shutting down");
                    self.shutdown(false).await;
                }
                Err(e) => warn!(error = %e, "Unable to listen for Ctrl-C"),
            },
        }

        run.await
    }

    /// Get the listener configuration
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::source::InMemoryQueueSource;

    fn listener(config: ListenerConfig) -> QueueListener {
        QueueListener::new(Arc::new(InMemoryQueueSource::new()), config)
    }

    #[tokio::test]
    async fn test_start_without_handler() {
        let listener = listener(ListenerConfig::new("q"));
        assert!(matches!(
            listener.start().await,
            Err(ListenerError::NoHandler)
        ));
        assert_eq!(listener.status(), ListenerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_with_invalid_config() {
        let listener = listener(ListenerConfig::new("q").with_max_workers(0));
        listener.register_handler(|_| async { Ok(()) }).unwrap();
        assert!(matches!(
            listener.start().await,
            Err(ListenerError::InvalidConfig(_))
        ));
        assert!(!listener.is_running());
    }

    #[test]
    fn test_second_handler_rejected() {
        let listener = listener(ListenerConfig::new("q"));
        listener.register_handler(|_| async { Ok(()) }).unwrap();
        assert!(matches!(
            listener.register_blocking_handler(|_| Ok(())),
            Err(ListenerError::HandlerAlreadyRegistered)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_when_not_running_is_noop() {
        let listener = listener(ListenerConfig::new("q"));
        tokio::time::timeout(Duration::from_millis(100), listener.shutdown(true))
            .await
            .expect("shutdown should not block");
        assert_eq!(listener.status(), ListenerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_dropped_start_future_resets_state() {
        let listener = listener(ListenerConfig::new("q").with_poll_timeout(Duration::from_secs(10)));
        listener.register_handler(|_| async { Ok(()) }).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(30), listener.start()).await;
        assert!(result.is_err());

        assert!(!listener.is_running());
        assert_eq!(listener.status(), ListenerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_kept_for_next_run() {
        let listener = listener(ListenerConfig::new("q").with_poll_timeout(Duration::from_secs(10)));
        listener.register_handler(|_| async { Ok(()) }).unwrap();

        listener.shutdown(true).await;
        assert_eq!(listener.status(), ListenerStatus::Stopped);

        let reason = tokio::time::timeout(Duration::from_secs(1), listener.start())
            .await
            .expect("pending stop should end the run at once")
            .unwrap();
        assert_eq!(reason, StopReason::Requested);

        // The request was consumed; the next run keeps going
        let result = tokio::time::timeout(Duration::from_millis(50), listener.start()).await;
        assert!(result.is_err());
        assert!(!listener.is_running());
    }

    #[test]
    fn test_handler_error_accessor() {
        let err = ListenerError::Handler(Arc::new(anyhow::anyhow!("boom")));
        assert_eq!(err.handler_error().unwrap().to_string(), "boom");
        assert_eq!(err.to_string(), "task handler failed: boom");
        assert!(ListenerError::NoHandler.handler_error().is_none());
    }
}
