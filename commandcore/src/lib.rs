//! `CommandCore` - consistency and retry core for event-sourced command pipelines
//!
//! This library covers what happens after a command has been applied to an
//! aggregate root:
//!
//! - the resulting [`EventStream`] is appended to an [`EventStore`] and append
//!   failures are classified into duplicate replays, optimistic concurrency
//!   conflicts and unknown faults ([`EventCommitter`]);
//! - commands that failed are resubmitted to a retry queue within their retry
//!   budget, inline first and through a background scheduler afterwards
//!   ([`CommandRetryService`], [`RetryService`]);
//! - terminal outcomes are delivered exactly once to whoever awaits the
//!   command ([`CommandAsyncResultManager`]).
//!
//! Storage engines and transports plug in through the [`EventStore`] and
//! [`MessageQueue`] traits. Log records are emitted with `tracing`; installing
//! a subscriber is left to the host application.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod action;
pub mod async_result;
pub mod command;
pub mod command_retry;
pub mod committer;
pub mod config;
pub mod errors;
pub mod event_store;
pub mod event_stream;
pub mod queue;
pub mod retry;
pub mod types;

pub use action::ActionInfo;
pub use async_result::{CommandAsyncResultManager, CommandResult, CommandStatus};
pub use command::{Command, CommandContext, CommandInfo};
pub use command_retry::{CommandRetryService, Resolution, RetryOutcome, RetryQueue, RetryState};
pub use committer::{CommitOutcome, DispatchOutcome, EventCommitter};
pub use config::{InlineAttempts, PendingCapacity, RetryConfig, RetryIntervalMs, ShutdownMode};
pub use errors::{
    AsyncResultError, ContextError, ErrorInfo, EventStoreError, EventStoreResult, Fault,
    RetryServiceError, TransportError, TransportResult,
};
pub use event_store::{classify_append_error, AppendErrorClass, EventStore};
pub use event_stream::{EventStream, EventStreamContext, EventStreamQueue};
pub use queue::MessageQueue;
pub use retry::{DeferredAction, RetryAction, RetryService};
pub use types::{
    AggregateRootId, AggregateRootType, CommandId, RetryCount, StreamVersion, Timestamp,
};
