//! Error types for `CommandCore`.
//!
//! The taxonomy mirrors how each failure is handled by the pipeline:
//!
//! - **`TransportError`**: a queue rejected a message. Always retried, never
//!   surfaced past the orchestrator.
//! - **`EventStoreError`**: tagged append failure. `DuplicateCommand` is treated
//!   as success, `ConcurrencyConflict` is handed back to the caller, everything
//!   else is an unknown store fault reported as terminal.
//! - **`RetryServiceError`**: the deferred retry scheduler could not take a new
//!   action.
//! - **`AsyncResultError`** / **`ContextError`**: misuse of the result registry
//!   or of an [`EventStreamContext`](crate::event_stream::EventStreamContext).
//!
//! [`ErrorInfo`] pairs a human readable message with the [`Fault`] that caused
//! it and is what eventually reaches the async result registry.

use std::sync::Arc;

use thiserror::Error;

use crate::types::{AggregateRootId, AggregateRootType, CommandId, StreamVersion};

/// A message queue failed to accept a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The queue backend cannot be reached.
    #[error("queue '{queue}' unavailable: {reason}")]
    Unavailable {
        /// Name of the queue
        queue: String,
        /// Backend supplied reason
        reason: String,
    },

    /// The queue refused the message because it is at capacity.
    #[error("queue '{queue}' is full")]
    Full {
        /// Name of the queue
        queue: String,
    },

    /// The queue has been closed and no longer accepts messages.
    #[error("queue '{queue}' is closed")]
    Closed {
        /// Name of the queue
        queue: String,
    },
}

/// Errors returned by [`EventStore`](crate::event_store::EventStore) operations.
///
/// `append` failures are classified with
/// [`classify_append_error`](crate::event_store::classify_append_error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventStoreError {
    /// The originating command already committed a stream for this aggregate.
    #[error(
        "command {command_id} already committed version {existing_version} of {aggregate_type} '{aggregate_id}'"
    )]
    DuplicateCommand {
        /// Aggregate the stream targeted
        aggregate_id: AggregateRootId,
        /// Type of that aggregate
        aggregate_type: AggregateRootType,
        /// The replayed command
        command_id: CommandId,
        /// Version the command committed the first time
        existing_version: StreamVersion,
    },

    /// Another command already occupies the target version.
    #[error(
        "version {version} of {aggregate_type} '{aggregate_id}' already committed by command {winning_command_id}"
    )]
    ConcurrencyConflict {
        /// Aggregate the stream targeted
        aggregate_id: AggregateRootId,
        /// Type of that aggregate
        aggregate_type: AggregateRootType,
        /// The contested version
        version: StreamVersion,
        /// Command whose stream won the race
        winning_command_id: CommandId,
    },

    /// The target version would leave a hole in the aggregate's log.
    #[error(
        "version {attempted} of {aggregate_type} '{aggregate_id}' skips ahead of expected version {expected}"
    )]
    VersionGap {
        /// Aggregate the stream targeted
        aggregate_id: AggregateRootId,
        /// Type of that aggregate
        aggregate_type: AggregateRootType,
        /// The next version the store would accept
        expected: StreamVersion,
        /// The version that was submitted
        attempted: StreamVersion,
    },

    /// The storage backend could not be reached.
    #[error("event store unavailable: {0}")]
    Unavailable(String),

    /// An unexpected backend failure.
    #[error("unknown event store error: {0}")]
    Unknown(String),
}

/// Errors raised by the deferred retry scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryServiceError {
    /// The scheduler has been shut down and accepts no new actions.
    #[error("retry scheduler stopped; action '{action}' was not registered")]
    Stopped {
        /// Name of the rejected action
        action: String,
    },
}

/// Errors raised by the async result registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsyncResultError {
    /// A completion handle already exists for this command.
    #[error("command {0} is already awaiting a result")]
    AlreadyRegistered(CommandId),

    /// The command was already completed and cannot be resolved again.
    #[error("command {0} has already been completed")]
    AlreadyCompleted(CommandId),
}

/// Errors raised when mutating an event stream context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// Only concurrency conflicts may be recorded as the context's conflict.
    #[error("{0} cannot be set as a concurrency conflict")]
    NotAConcurrencyConflict(String),
}

/// The tagged cause attached to an [`ErrorInfo`].
#[derive(Debug, Clone, Error)]
pub enum Fault {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// A queue operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The command's own handler failed.
    #[error("command failed: {0}")]
    Command(Arc<dyn std::error::Error + Send + Sync>),
}

impl Fault {
    /// Wraps an arbitrary handler error.
    pub fn command<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Command(Arc::new(error))
    }

    /// Short name of the fault kind, used in log records and context errors.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Store(EventStoreError::DuplicateCommand { .. }) => "DuplicateCommand",
            Self::Store(EventStoreError::ConcurrencyConflict { .. }) => "ConcurrencyConflict",
            Self::Store(_) => "EventStoreError",
            Self::Transport(_) => "TransportError",
            Self::Command(_) => "CommandError",
        }
    }

    /// Whether this fault is an optimistic concurrency conflict.
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            Self::Store(EventStoreError::ConcurrencyConflict { .. })
        )
    }
}

/// A human readable message together with the fault that caused it.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    message: String,
    fault: Fault,
}

impl ErrorInfo {
    /// Creates a new error info.
    pub fn new(message: impl Into<String>, fault: impl Into<Fault>) -> Self {
        Self {
            message: message.into(),
            fault: fault.into(),
        }
    }

    /// Uses the fault's display text as the message.
    pub fn from_fault(fault: impl Into<Fault>) -> Self {
        let fault = fault.into();
        Self {
            message: fault.to_string(),
            fault,
        }
    }

    /// The message reported to the caller.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The underlying cause.
    pub const fn fault(&self) -> &Fault {
        &self.fault
    }

    /// Splits into message and fault.
    pub fn into_parts(self) -> (String, Fault) {
        (self.message, self.fault)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.fault)
    }
}

/// Type alias for event store results.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// Type alias for queue results.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate() -> (AggregateRootId, AggregateRootType) {
        (
            AggregateRootId::try_new("account-1").unwrap(),
            AggregateRootType::try_new("Account").unwrap(),
        )
    }

    #[test]
    fn store_error_messages_are_descriptive() {
        let (aggregate_id, aggregate_type) = aggregate();
        let err = EventStoreError::VersionGap {
            aggregate_id,
            aggregate_type,
            expected: StreamVersion::try_new(3).unwrap(),
            attempted: StreamVersion::try_new(5).unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "version 5 of Account 'account-1' skips ahead of expected version 3"
        );
    }

    #[test]
    fn transport_error_messages_are_descriptive() {
        let err = TransportError::Unavailable {
            queue: "retry".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "queue 'retry' unavailable: connection refused"
        );
    }

    #[test]
    fn fault_kind_distinguishes_conflicts() {
        let (aggregate_id, aggregate_type) = aggregate();
        let conflict = Fault::from(EventStoreError::ConcurrencyConflict {
            aggregate_id,
            aggregate_type,
            version: StreamVersion::initial(),
            winning_command_id: CommandId::new(),
        });
        assert!(conflict.is_concurrency_conflict());
        assert_eq!(conflict.kind(), "ConcurrencyConflict");

        let unknown = Fault::from(EventStoreError::Unknown("disk full".to_string()));
        assert!(!unknown.is_concurrency_conflict());
        assert_eq!(unknown.kind(), "EventStoreError");

        let command = Fault::command(std::io::Error::other("boom"));
        assert_eq!(command.kind(), "CommandError");
        assert_eq!(command.to_string(), "command failed: boom");
    }

    #[test]
    fn error_info_from_fault_uses_display_text() {
        let info = ErrorInfo::from_fault(EventStoreError::Unavailable("down".to_string()));
        assert_eq!(info.message(), "event store unavailable: down");
        let (message, fault) = info.into_parts();
        assert_eq!(message, "event store unavailable: down");
        assert_eq!(fault.kind(), "EventStoreError");
    }
}
