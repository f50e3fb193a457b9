//! Bounded inline retry plus an asynchronous retry-in-queue safety net.
//!
//! [`RetryService::try_action`] runs a fallible operation a small fixed number
//! of times in the caller's task. When that is not enough the caller hands a
//! [`DeferredAction`] to [`RetryService::retry_in_queue`]; a single background
//! task re-attempts every pending action on a fixed interval until it
//! succeeds, then calls [`DeferredAction::complete`] on the scheduler task.
//!
//! Pending actions are held in memory only. They survive neither a crash nor
//! a restart; [`ShutdownMode`] decides what a graceful stop does with them.
//! Every action the scheduler gives up on is told so through
//! [`DeferredAction::abandon`].

use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::action::ActionInfo;
use crate::config::{RetryConfig, ShutdownMode};
use crate::errors::RetryServiceError;

/// An operation the scheduler re-attempts until it succeeds.
#[async_trait]
pub trait DeferredAction: Send + 'static {
    /// Name used in log records.
    fn name(&self) -> &str;

    /// Makes one attempt. Must not panic; report failure by returning `false`.
    async fn attempt(&mut self) -> bool;

    /// Called exactly once, on the scheduler task, after a successful attempt.
    fn complete(self: Box<Self>);

    /// Called instead of [`complete`](Self::complete) when the scheduler
    /// stops before the action succeeded.
    fn abandon(self: Box<Self>);
}

/// A [`DeferredAction`] built from a closure and optional continuations.
pub struct RetryAction<F> {
    name: Cow<'static, str>,
    operation: F,
    on_success: Option<ActionInfo>,
    on_abandon: Option<ActionInfo>,
}

impl<F> RetryAction<F>
where
    F: FnMut() -> BoxFuture<'static, bool> + Send + 'static,
{
    /// Creates an action that re-runs `operation` until it returns `true`.
    pub fn new(name: impl Into<Cow<'static, str>>, operation: F) -> Self {
        Self {
            name: name.into(),
            operation,
            on_success: None,
            on_abandon: None,
        }
    }

    /// Runs `next` once the operation has succeeded.
    #[must_use]
    pub fn on_success(mut self, next: ActionInfo) -> Self {
        self.on_success = Some(next);
        self
    }

    /// Runs `next` if the scheduler stops before the operation succeeded.
    #[must_use]
    pub fn on_abandon(mut self, next: ActionInfo) -> Self {
        self.on_abandon = Some(next);
        self
    }
}

fn run_continuation(action: &str, continuation: Option<ActionInfo>) {
    if let Some(next) = continuation {
        let name = next.name().to_string();
        if !next.run(()) {
            warn!(%action, continuation = %name, "Retry continuation reported failure");
        }
    }
}

#[async_trait]
impl<F> DeferredAction for RetryAction<F>
where
    F: FnMut() -> BoxFuture<'static, bool> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&mut self) -> bool {
        (self.operation)().await
    }

    fn complete(self: Box<Self>) {
        let Self {
            name, on_success, ..
        } = *self;
        run_continuation(&name, on_success);
    }

    fn abandon(self: Box<Self>) {
        let Self {
            name, on_abandon, ..
        } = *self;
        run_continuation(&name, on_abandon);
    }
}

struct PendingAction {
    action: Box<dyn DeferredAction>,
    _permit: OwnedSemaphorePermit,
}

struct Shared {
    pending: Mutex<Vec<PendingAction>>,
    capacity: Arc<Semaphore>,
    total_capacity: usize,
    stopped: AtomicBool,
}

impl Shared {
    /// One scheduler pass: attempt every pending action once.
    async fn run_pass(&self) {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return;
        }
        debug!(pending = batch.len(), "Retrying deferred actions");

        let mut still_failing = Vec::with_capacity(batch.len());
        for mut pending in batch {
            if pending.action.attempt().await {
                debug!(action = pending.action.name(), "Deferred action succeeded");
                let PendingAction {
                    action,
                    _permit: permit,
                } = pending;
                drop(permit);
                action.complete();
            } else {
                still_failing.push(pending);
            }
        }

        let mut guard = self.pending.lock();
        let registered_meanwhile = std::mem::replace(&mut *guard, still_failing);
        guard.extend(registered_meanwhile);
    }

    /// Stops accepting actions and disposes of the pending set.
    ///
    /// Returns how many actions were dropped without succeeding.
    async fn stop(&self, mode: ShutdownMode) -> usize {
        let remaining = {
            let mut guard = self.pending.lock();
            self.stopped.store(true, Ordering::Release);
            std::mem::take(&mut *guard)
        };
        self.capacity.close();

        let mut dropped = 0;
        for mut pending in remaining {
            if mode == ShutdownMode::Drain && pending.action.attempt().await {
                pending.action.complete();
                continue;
            }
            warn!(action = pending.action.name(), ?mode, "Dropping deferred action on shutdown");
            pending.action.abandon();
            dropped += 1;
        }

        info!(?mode, dropped, "Retry scheduler stopped");
        dropped
    }
}

/// Runs fallible operations inline and re-attempts deferred ones in the background.
pub struct RetryService {
    shared: Arc<Shared>,
    config: RetryConfig,
    shutdown_signal: Mutex<Option<oneshot::Sender<ShutdownMode>>>,
    task_handle: Mutex<Option<JoinHandle<usize>>>,
}

impl RetryService {
    /// Starts the service and spawns its scheduler task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: RetryConfig) -> Self {
        let total_capacity = config.pending_capacity.into_inner();
        let shared = Arc::new(Shared {
            pending: Mutex::new(Vec::new()),
            capacity: Arc::new(Semaphore::new(total_capacity)),
            total_capacity,
            stopped: AtomicBool::new(false),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_scheduler(
            Arc::clone(&shared),
            config.retry_interval_ms.as_duration(),
            config.shutdown_mode,
            shutdown_rx,
        ));

        Self {
            shared,
            config,
            shutdown_signal: Mutex::new(Some(shutdown_tx)),
            task_handle: Mutex::new(Some(task)),
        }
    }

    /// The configuration the service was started with.
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` up to `max_attempts` times, stopping at the first success.
    ///
    /// Returns whether any attempt succeeded. The operation reports its own
    /// failures through its return value and must be safe to invoke again.
    pub async fn try_action<F, Fut>(&self, name: &str, mut operation: F, max_attempts: u32) -> bool
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = bool> + Send,
    {
        for attempt in 1..=max_attempts {
            if operation().await {
                if attempt > 1 {
                    debug!(action = name, attempt, "Action succeeded after inline retries");
                }
                return true;
            }
            debug!(action = name, attempt, max_attempts, "Inline attempt failed");
        }
        false
    }

    /// Registers `action` with the background scheduler.
    ///
    /// Returns as soon as the action is queued. When the pending set is at
    /// capacity this waits for a slot to free up.
    ///
    /// # Errors
    /// Returns [`RetryServiceError::Stopped`] once the scheduler has been shut down.
    #[instrument(skip_all, fields(action = action.name()))]
    pub async fn retry_in_queue(
        &self,
        action: Box<dyn DeferredAction>,
    ) -> Result<(), RetryServiceError> {
        let name = action.name().to_string();

        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(RetryServiceError::Stopped { action: name });
        }
        let Ok(permit) = Arc::clone(&self.shared.capacity).acquire_owned().await else {
            return Err(RetryServiceError::Stopped { action: name });
        };

        let mut pending = self.shared.pending.lock();
        if self.shared.stopped.load(Ordering::Acquire) {
            drop(pending);
            return Err(RetryServiceError::Stopped { action: name });
        }
        pending.push(PendingAction {
            action,
            _permit: permit,
        });
        debug!(pending = pending.len(), "Deferred action registered");
        Ok(())
    }

    /// Number of deferred actions that have not succeeded yet.
    pub fn pending_count(&self) -> usize {
        self.shared.total_capacity - self.shared.capacity.available_permits()
    }

    /// Whether the scheduler still accepts actions.
    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stops the scheduler with the configured [`ShutdownMode`].
    ///
    /// Dropping the service without calling this stops it the same way.
    pub async fn stop(&self) -> usize {
        self.shutdown(self.config.shutdown_mode).await
    }

    /// Stops the scheduler with `mode` and waits for it to finish.
    ///
    /// Returns the number of pending actions dropped without succeeding.
    /// Calling this more than once is harmless; later calls return 0.
    pub async fn shutdown(&self, mode: ShutdownMode) -> usize {
        let signal = self.shutdown_signal.lock().take();
        let handle = self.task_handle.lock().take();

        if let Some(signal) = signal {
            // The scheduler only exits early if its receiver was dropped.
            let _ = signal.send(mode);
        }

        match handle {
            Some(handle) => match handle.await {
                Ok(dropped) => dropped,
                Err(e) => {
                    error!(error = %e, "Retry scheduler task failed");
                    0
                }
            },
            None => 0,
        }
    }
}

impl std::fmt::Debug for RetryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryService")
            .field("config", &self.config)
            .field("pending", &self.pending_count())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn run_scheduler(
    shared: Arc<Shared>,
    period: Duration,
    configured_mode: ShutdownMode,
    mut shutdown_rx: oneshot::Receiver<ShutdownMode>,
) -> usize {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(?period, "Retry scheduler started");

    loop {
        tokio::select! {
            requested = &mut shutdown_rx => {
                // The sender is gone when the service was dropped.
                let mode = requested.unwrap_or(configured_mode);
                return shared.stop(mode).await;
            }
            _ = ticker.tick() => shared.run_pass().await,
        }
    }
}
