//! Bounded resubmission of commands that failed to take effect.
//!
//! [`CommandRetryService::retry_command`] drives one resolution of a failed
//! command through the following states:
//!
//! ```text
//! Attempting ──enqueued inline──────────────▶ Resolved(Success)
//!     │
//!     ├──inline attempts spent──▶ RetryScheduled ──enqueued later──▶ Resolved(Success)
//!     │
//!     └──budget spent───────────────────────────▶ Resolved(Exhausted)
//! ```
//!
//! Every successful enqueue increments the command's retried count exactly
//! once and then runs the caller's continuation with the updated
//! [`CommandInfo`]. An exhausted command is reported to the
//! [`CommandAsyncResultManager`] and never enqueued. So is a scheduled one
//! the scheduler gives up on when it stops.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::action::ActionInfo;
use crate::async_result::CommandAsyncResultManager;
use crate::command::{Command, CommandInfo};
use crate::errors::ErrorInfo;
use crate::queue::MessageQueue;
use crate::retry::{DeferredAction, RetryService};
use crate::types::CommandId;

const TRY_ENQUEUE_ACTION: &str = "TryEnqueueCommand";
const DEFERRED_ENQUEUE_ACTION: &str = "RetryEnqueueCommand";

/// The queue failed commands are resubmitted to.
pub type RetryQueue<C> = Arc<dyn MessageQueue<Arc<C>>>;

/// Where one resolution of a failed command stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Inline enqueue attempts are running.
    Attempting,
    /// The enqueue was handed to the background scheduler.
    RetryScheduled,
    /// The resolution is over.
    Resolved(Resolution),
}

/// How a resolution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The command is back on the retry queue.
    Success,
    /// The command failed terminally.
    Exhausted,
}

/// What [`CommandRetryService::retry_command`] did with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Enqueued inline; the continuation has already run.
    Enqueued,
    /// Inline attempts failed; the scheduler keeps trying and runs the
    /// continuation once the enqueue succeeds.
    Scheduled,
    /// The retry budget was already spent.
    Exhausted {
        /// Whether this call delivered the failure to the registry.
        reported: bool,
    },
    /// The scheduler was stopped so the enqueue could not be deferred.
    Abandoned {
        /// Whether this call delivered the failure to the registry.
        reported: bool,
    },
}

impl RetryOutcome {
    /// The state this outcome leaves the resolution in.
    pub const fn state(self) -> RetryState {
        match self {
            Self::Enqueued => RetryState::Resolved(Resolution::Success),
            Self::Scheduled => RetryState::RetryScheduled,
            Self::Exhausted { .. } | Self::Abandoned { .. } => {
                RetryState::Resolved(Resolution::Exhausted)
            }
        }
    }
}

/// Resubmits failed commands to a retry queue within their retry budget.
pub struct CommandRetryService<C: Command> {
    queue: RetryQueue<C>,
    retry_service: Arc<RetryService>,
    results: Arc<CommandAsyncResultManager>,
}

impl<C: Command> CommandRetryService<C> {
    /// Creates a service resubmitting to `queue`.
    pub fn new(
        queue: RetryQueue<C>,
        retry_service: Arc<RetryService>,
        results: Arc<CommandAsyncResultManager>,
    ) -> Self {
        Self {
            queue,
            retry_service,
            results,
        }
    }

    /// The registry terminal failures are reported to.
    pub const fn results(&self) -> &Arc<CommandAsyncResultManager> {
        &self.results
    }

    /// Resolves one failure of `command_info`.
    ///
    /// `error_info` is what made the command fail; it is only reported if
    /// the command cannot be resubmitted. `on_retried` runs exactly once, with
    /// the incremented [`CommandInfo`], after the command is back on the queue.
    #[instrument(
        skip_all,
        fields(
            command_type = command_info.command().type_name(),
            command_id = %command_info.command().id(),
        )
    )]
    pub async fn retry_command(
        &self,
        command_info: CommandInfo<C>,
        error_info: ErrorInfo,
        on_retried: ActionInfo<CommandInfo<C>>,
    ) -> RetryOutcome {
        let command = Arc::clone(command_info.command());

        if !command_info.can_retry() {
            warn!(
                retried_count = command_info.retried_count(),
                retry_count = %command.retry_count(),
                error = %error_info,
                "Command retry budget exhausted"
            );
            let reported = report_failure(&self.results, command.id(), error_info);
            return RetryOutcome::Exhausted { reported };
        }

        debug!(
            retried_count = command_info.retried_count(),
            error = %error_info,
            state = ?RetryState::Attempting,
            "Retrying command"
        );

        let queue = self.queue.as_ref();
        let message = &command;
        let inline_attempts = self.retry_service.config().inline_attempts.into_inner();
        let sent = self
            .retry_service
            .try_action(
                TRY_ENQUEUE_ACTION,
                || try_enqueue(queue, message),
                inline_attempts,
            )
            .await;

        if sent {
            after_retried(command_info, on_retried);
            return RetryOutcome::Enqueued;
        }

        let pending = PendingEnqueue {
            queue: Arc::clone(&self.queue),
            results: Arc::clone(&self.results),
            command_info,
            error_info: error_info.clone(),
            on_retried,
        };
        match self.retry_service.retry_in_queue(Box::new(pending)).await {
            Ok(()) => {
                debug!(state = ?RetryState::RetryScheduled, "Command enqueue deferred");
                RetryOutcome::Scheduled
            }
            Err(e) => {
                error!(error = %e, "Cannot defer command enqueue");
                let reported = report_failure(&self.results, command.id(), error_info);
                RetryOutcome::Abandoned { reported }
            }
        }
    }
}

impl<C: Command> std::fmt::Debug for CommandRetryService<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRetryService")
            .field("queue", &self.queue.name())
            .field("retry_service", &self.retry_service)
            .finish_non_exhaustive()
    }
}

/// Deferred enqueue handed to the scheduler once inline attempts are spent.
struct PendingEnqueue<C: Command> {
    queue: RetryQueue<C>,
    results: Arc<CommandAsyncResultManager>,
    command_info: CommandInfo<C>,
    // Reported if the scheduler stops first
    error_info: ErrorInfo,
    on_retried: ActionInfo<CommandInfo<C>>,
}

#[async_trait]
impl<C: Command> DeferredAction for PendingEnqueue<C> {
    fn name(&self) -> &str {
        DEFERRED_ENQUEUE_ACTION
    }

    async fn attempt(&mut self) -> bool {
        try_enqueue(self.queue.as_ref(), self.command_info.command()).await
    }

    fn complete(self: Box<Self>) {
        let Self {
            command_info,
            on_retried,
            ..
        } = *self;
        after_retried(command_info, on_retried);
    }

    fn abandon(self: Box<Self>) {
        let Self {
            results,
            command_info,
            error_info,
            ..
        } = *self;
        let command = command_info.command();
        let reported = report_failure(&results, command.id(), error_info);
        warn!(
            command_type = command.type_name(),
            command_id = %command.id(),
            reported,
            "Scheduled command retry abandoned"
        );
    }
}

fn report_failure(
    results: &CommandAsyncResultManager,
    command_id: CommandId,
    error_info: ErrorInfo,
) -> bool {
    let (message, fault) = error_info.into_parts();
    results.try_complete(command_id, message, fault)
}

async fn try_enqueue<C: Command>(queue: &dyn MessageQueue<Arc<C>>, command: &Arc<C>) -> bool {
    match queue.enqueue(Arc::clone(command)).await {
        Ok(()) => true,
        Err(e) => {
            error!(
                command_type = command.type_name(),
                command_id = %command.id(),
                queue = queue.name(),
                error = %e,
                "Failed to send command to retry queue"
            );
            false
        }
    }
}

fn after_retried<C: Command>(
    mut command_info: CommandInfo<C>,
    on_retried: ActionInfo<CommandInfo<C>>,
) {
    command_info.increase_retried_count();
    info!(
        command_type = command_info.command().type_name(),
        command_id = %command_info.command().id(),
        retried_count = command_info.retried_count(),
        "Sent command to retry queue"
    );

    let continuation = on_retried.name().to_string();
    if !on_retried.run(command_info) {
        warn!(%continuation, "Command retry continuation reported failure");
    }
}
