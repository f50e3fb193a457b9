//! Event streams and the per-append context that carries them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{ContextError, ErrorInfo};
use crate::queue::MessageQueue;
use crate::types::{AggregateRootId, AggregateRootType, CommandId, StreamVersion, Timestamp};

/// The ordered batch of events one command produced against one aggregate.
///
/// A stream is the atomic unit appended to the
/// [`EventStore`](crate::event_store::EventStore) and is immutable once
/// committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStream<E> {
    aggregate_root_id: AggregateRootId,
    aggregate_root_type: AggregateRootType,
    version: StreamVersion,
    command_id: CommandId,
    timestamp: Timestamp,
    events: Vec<E>,
}

impl<E> EventStream<E> {
    /// Creates a new event stream stamped with the current time.
    pub fn new(
        aggregate_root_id: AggregateRootId,
        aggregate_root_type: AggregateRootType,
        version: StreamVersion,
        command_id: CommandId,
        events: Vec<E>,
    ) -> Self {
        Self {
            aggregate_root_id,
            aggregate_root_type,
            version,
            command_id,
            timestamp: Timestamp::now(),
            events,
        }
    }

    /// The aggregate this stream belongs to.
    pub const fn aggregate_root_id(&self) -> &AggregateRootId {
        &self.aggregate_root_id
    }

    /// The aggregate's type.
    pub const fn aggregate_root_type(&self) -> &AggregateRootType {
        &self.aggregate_root_type
    }

    /// The version this stream occupies.
    pub const fn version(&self) -> StreamVersion {
        self.version
    }

    /// The command that produced this stream.
    pub const fn command_id(&self) -> CommandId {
        self.command_id
    }

    /// When the stream was produced.
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The events, in the order they were raised.
    pub fn events(&self) -> &[E] {
        &self.events
    }
}

/// Destination queue for committed event streams.
pub type EventStreamQueue<E> = Arc<dyn MessageQueue<EventStream<E>>>;

/// Transient wrapper used while one stream is being appended.
///
/// Pairs the stream with the queue it must be dispatched to once durable, and
/// records the concurrency conflict if the append lost a version race.
pub struct EventStreamContext<E> {
    event_stream: EventStream<E>,
    queue: EventStreamQueue<E>,
    error_info: Option<ErrorInfo>,
}

impl<E> EventStreamContext<E>
where
    E: Send + 'static,
{
    /// Creates a context for a stream about to be appended.
    pub fn new(event_stream: EventStream<E>, queue: EventStreamQueue<E>) -> Self {
        Self {
            event_stream,
            queue,
            error_info: None,
        }
    }

    /// The stream being appended.
    pub const fn event_stream(&self) -> &EventStream<E> {
        &self.event_stream
    }

    /// Where the stream goes once committed.
    pub const fn queue(&self) -> &EventStreamQueue<E> {
        &self.queue
    }

    /// Whether the append lost an optimistic concurrency race.
    pub const fn has_concurrent_error(&self) -> bool {
        self.error_info.is_some()
    }

    /// The recorded concurrency conflict, if any.
    pub const fn error_info(&self) -> Option<&ErrorInfo> {
        self.error_info.as_ref()
    }

    /// Records that the append lost a version race.
    ///
    /// # Errors
    /// Returns [`ContextError::NotAConcurrencyConflict`] and leaves the context
    /// untouched when `error_info` does not carry a concurrency conflict, so a
    /// different fault can never be mistaken for a resolvable race.
    pub fn set_concurrency_conflict(&mut self, error_info: ErrorInfo) -> Result<(), ContextError> {
        if !error_info.fault().is_concurrency_conflict() {
            return Err(ContextError::NotAConcurrencyConflict(
                error_info.fault().kind().to_string(),
            ));
        }
        self.error_info = Some(error_info);
        Ok(())
    }

    /// Consumes the context, returning the stream and its destination queue.
    pub fn into_parts(self) -> (EventStream<E>, EventStreamQueue<E>) {
        (self.event_stream, self.queue)
    }
}

impl<E: fmt::Debug> fmt::Debug for EventStreamContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStreamContext")
            .field("event_stream", &self.event_stream)
            .field("queue", &self.queue.name())
            .field("error_info", &self.error_info)
            .finish()
    }
}
