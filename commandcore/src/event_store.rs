//! Event store abstraction for the `CommandCore` pipeline.
//!
//! The store is an append-only log of [`EventStream`]s addressed by aggregate
//! id, aggregate type and stream version. Any storage engine satisfying the
//! four operations of [`EventStore`] and the invariants below is
//! interchangeable:
//!
//! - for a given aggregate id + type, committed versions form a gap-free
//!   sequence starting at 1;
//! - a command id produces at most one committed stream per aggregate;
//! - concurrent appends to the same version serialise so exactly one wins.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::{EventStoreError, EventStoreResult};
use crate::event_stream::EventStream;
use crate::types::{AggregateRootId, AggregateRootType, CommandId, StreamVersion};

/// The event store port.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// The event payload type this store handles.
    type Event: Send + Sync;

    /// Commits `stream` at its target version.
    ///
    /// # Errors
    /// * `EventStoreError::DuplicateCommand` - the stream's command already
    ///   committed a stream for this aggregate; the caller proceeds as if this
    ///   append succeeded
    /// * `EventStoreError::ConcurrencyConflict` - another command's stream
    ///   occupies the target version
    /// * `EventStoreError::VersionGap` - the target version skips ahead of the
    ///   aggregate's next version
    /// * `EventStoreError::Unavailable` / `Unknown` - backend failure
    async fn append(&self, stream: &EventStream<Self::Event>) -> EventStoreResult<()>;

    /// Checks whether `command_id` already committed `version` for the aggregate.
    ///
    /// Lets a caller skip re-applying a command without waiting for `append`
    /// to fail.
    async fn is_event_stream_exist(
        &self,
        aggregate_root_id: &AggregateRootId,
        aggregate_root_type: &AggregateRootType,
        version: StreamVersion,
        command_id: CommandId,
    ) -> EventStoreResult<bool>;

    /// Returns the committed streams with `min_version <= version <= max_version`
    /// in ascending version order.
    async fn query(
        &self,
        aggregate_root_id: &AggregateRootId,
        aggregate_root_type: &AggregateRootType,
        min_version: StreamVersion,
        max_version: StreamVersion,
    ) -> EventStoreResult<Vec<EventStream<Self::Event>>>;

    /// Scans every committed stream.
    ///
    /// Intended for rebuild and migration tooling, not the hot path. The
    /// returned stream is lazy and finite; streams of one aggregate appear in
    /// ascending version order.
    fn query_all(&self) -> BoxStream<'_, EventStoreResult<EventStream<Self::Event>>>;
}

/// How a failed `append` must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendErrorClass {
    /// The command already had its effect; treat the append as successful.
    Duplicate,
    /// A genuine version race; the caller must refetch and re-derive.
    ConcurrencyConflict,
    /// Anything else; surfaced as a terminal failure.
    Unknown,
}

/// Classifies an `append` failure.
pub const fn classify_append_error(error: &EventStoreError) -> AppendErrorClass {
    match error {
        EventStoreError::DuplicateCommand { .. } => AppendErrorClass::Duplicate,
        EventStoreError::ConcurrencyConflict { .. } => AppendErrorClass::ConcurrencyConflict,
        EventStoreError::VersionGap { .. }
        | EventStoreError::Unavailable(_)
        | EventStoreError::Unknown(_) => AppendErrorClass::Unknown,
    }
}
