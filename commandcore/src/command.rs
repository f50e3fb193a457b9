//! Commands and the per-resolution retry bookkeeping around them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{AggregateRootId, CommandId, RetryCount};

/// An immutable unit of work submitted to the pipeline.
///
/// Commands are shared as `Arc<C>` between the dispatcher, the retry queue
/// and the orchestrator, so they must be `Send + Sync`.
pub trait Command: Send + Sync + 'static {
    /// Unique identifier of this command instance.
    fn id(&self) -> CommandId;

    /// The aggregate root this command targets, if it targets one.
    fn aggregate_root_id(&self) -> Option<&AggregateRootId>;

    /// How many times this command may be resubmitted to the retry queue.
    fn retry_count(&self) -> RetryCount {
        RetryCount::default()
    }

    /// Short type name used in log records.
    fn type_name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

/// Context information captured when a command was submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    /// Correlation ID for request tracing.
    pub correlation_id: String,
    /// User ID for auditing.
    pub user_id: Option<String>,
    /// Additional metadata for the submission.
    pub metadata: HashMap<String, String>,
}

impl CommandContext {
    /// Sets the correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Sets the user ID.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl Default for CommandContext {
    fn default() -> Self {
        Self {
            correlation_id: uuid::Uuid::now_v7().to_string(),
            user_id: None,
            metadata: HashMap::new(),
        }
    }
}

/// A command together with how many times it has already been requeued.
///
/// The retried count only ever grows, is only incremented by the
/// [`CommandRetryService`](crate::command_retry::CommandRetryService) after a
/// successful enqueue, and never exceeds [`Command::retry_count`].
/// `CommandRetryService::retry_command` takes the info by value, so one
/// instance can never be resolved twice at the same time.
#[derive(Debug)]
pub struct CommandInfo<C> {
    command: Arc<C>,
    retried_count: u32,
    context: CommandContext,
}

impl<C: Command> CommandInfo<C> {
    /// Wraps a freshly submitted command.
    pub fn new(command: Arc<C>) -> Self {
        Self::with_context(command, CommandContext::default())
    }

    /// Wraps a freshly submitted command with its submission context.
    pub const fn with_context(command: Arc<C>, context: CommandContext) -> Self {
        Self {
            command,
            retried_count: 0,
            context,
        }
    }

    /// Rebuilds the info of a command redelivered from the retry queue.
    ///
    /// `retried_count` is clamped to the command's retry budget.
    pub fn resume(command: Arc<C>, retried_count: u32, context: CommandContext) -> Self {
        let retried_count = retried_count.min(command.retry_count().into_inner());
        Self {
            command,
            retried_count,
            context,
        }
    }

    /// The wrapped command.
    pub const fn command(&self) -> &Arc<C> {
        &self.command
    }

    /// How many times the command has been sent to the retry queue.
    pub const fn retried_count(&self) -> u32 {
        self.retried_count
    }

    /// The submission context.
    pub const fn context(&self) -> &CommandContext {
        &self.context
    }

    /// Whether the command still has retry budget left.
    pub fn can_retry(&self) -> bool {
        self.retried_count < self.command.retry_count().into_inner()
    }

    pub(crate) fn increase_retried_count(&mut self) {
        debug_assert!(self.can_retry(), "retried count must stay within budget");
        self.retried_count += 1;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Minimal command used by unit tests across the crate.
    #[derive(Debug)]
    pub struct PlaceOrder {
        pub id: CommandId,
        pub aggregate_id: AggregateRootId,
        pub retry_count: RetryCount,
    }

    impl PlaceOrder {
        pub fn with_retry_count(retry_count: u32) -> Arc<Self> {
            Arc::new(Self {
                id: CommandId::new(),
                aggregate_id: AggregateRootId::try_new("order-1").unwrap(),
                retry_count: RetryCount::try_new(retry_count).unwrap(),
            })
        }
    }

    impl Command for PlaceOrder {
        fn id(&self) -> CommandId {
            self.id
        }

        fn aggregate_root_id(&self) -> Option<&AggregateRootId> {
            Some(&self.aggregate_id)
        }

        fn retry_count(&self) -> RetryCount {
            self.retry_count
        }
    }
}
