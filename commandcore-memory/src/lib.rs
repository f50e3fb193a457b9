//! In-memory adapters for the `CommandCore` consistency and retry core
//!
//! This crate provides an in-memory implementation of the `EventStore` trait
//! and of the `MessageQueue` trait from the commandcore crate, useful for
//! testing and development scenarios where persistence is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod queue;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use commandcore::errors::{EventStoreError, EventStoreResult};
use commandcore::event_store::EventStore;
use commandcore::event_stream::EventStream;
use commandcore::types::{AggregateRootId, AggregateRootType, CommandId, StreamVersion};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

pub use queue::InMemoryMessageQueue;

type AggregateKey = (AggregateRootType, AggregateRootId);

/// Committed streams of one aggregate plus the commands that produced them.
struct AggregateLog<E> {
    // Ascending, gap-free from version 1
    streams: Vec<EventStream<E>>,
    commands: HashMap<CommandId, StreamVersion>,
}

impl<E> Default for AggregateLog<E> {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            commands: HashMap::new(),
        }
    }
}

impl<E> AggregateLog<E> {
    fn next_version(&self) -> StreamVersion {
        self.streams
            .last()
            .map_or_else(StreamVersion::initial, |last| last.version().next())
    }

    /// Checks that `stream` may be appended as the next version.
    fn check(&self, stream: &EventStream<E>) -> EventStoreResult<()> {
        if let Some(existing_version) = self.commands.get(&stream.command_id()) {
            return Err(EventStoreError::DuplicateCommand {
                aggregate_id: stream.aggregate_root_id().clone(),
                aggregate_type: stream.aggregate_root_type().clone(),
                command_id: stream.command_id(),
                existing_version: *existing_version,
            });
        }

        if let Some(winner) = self
            .streams
            .iter()
            .find(|committed| committed.version() == stream.version())
        {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id: stream.aggregate_root_id().clone(),
                aggregate_type: stream.aggregate_root_type().clone(),
                version: stream.version(),
                winning_command_id: winner.command_id(),
            });
        }

        let expected = self.next_version();
        if stream.version() != expected {
            return Err(EventStoreError::VersionGap {
                aggregate_id: stream.aggregate_root_id().clone(),
                aggregate_type: stream.aggregate_root_type().clone(),
                expected,
                attempted: stream.version(),
            });
        }

        Ok(())
    }

    fn record(&mut self, stream: EventStream<E>) {
        self.commands.insert(stream.command_id(), stream.version());
        self.streams.push(stream);
    }
}

/// Thread-safe in-memory event store for testing
///
/// Appends are serialised by a single write lock, so of two concurrent
/// appends to the same version exactly one wins.
#[derive(Clone)]
pub struct InMemoryEventStore<E>
where
    E: Send + Sync + Clone + 'static,
{
    logs: Arc<RwLock<HashMap<AggregateKey, AggregateLog<E>>>>,
    // Failures returned by upcoming appends, oldest first
    injected_failures: Arc<Mutex<VecDeque<EventStoreError>>>,
}

impl<E> InMemoryEventStore<E>
where
    E: Send + Sync + Clone + 'static,
{
    /// Create a new empty in-memory event store
    pub fn new() -> Self {
        Self {
            logs: Arc::new(RwLock::new(HashMap::new())),
            injected_failures: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Makes the next `append` fail with `error` without touching the log.
    pub fn fail_next_append(&self, error: EventStoreError) {
        self.injected_failures.lock().push_back(error);
    }

    /// Number of committed streams across all aggregates.
    pub fn stream_count(&self) -> usize {
        self.logs.read().values().map(|log| log.streams.len()).sum()
    }

    /// The next version `append` accepts for an aggregate.
    pub fn next_version(
        &self,
        aggregate_root_id: &AggregateRootId,
        aggregate_root_type: &AggregateRootType,
    ) -> StreamVersion {
        self.logs
            .read()
            .get(&(aggregate_root_type.clone(), aggregate_root_id.clone()))
            .map_or_else(StreamVersion::initial, AggregateLog::next_version)
    }
}

impl<E> Default for InMemoryEventStore<E>
where
    E: Send + Sync + Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E> EventStore for InMemoryEventStore<E>
where
    E: Send + Sync + Clone + 'static,
{
    type Event = E;

    async fn append(&self, stream: &EventStream<Self::Event>) -> EventStoreResult<()> {
        if let Some(error) = self.injected_failures.lock().pop_front() {
            return Err(error);
        }

        let key = (
            stream.aggregate_root_type().clone(),
            stream.aggregate_root_id().clone(),
        );
        {
            let mut logs = self.logs.write();
            match logs.get(&key) {
                Some(log) => log.check(stream)?,
                None => AggregateLog::default().check(stream)?,
            }
            logs.entry(key).or_default().record(stream.clone());
        }

        debug!(
            aggregate_root_type = %stream.aggregate_root_type(),
            aggregate_root_id = %stream.aggregate_root_id(),
            version = %stream.version(),
            command_id = %stream.command_id(),
            timestamp = %stream.timestamp(),
            "Event stream appended"
        );
        Ok(())
    }

    async fn is_event_stream_exist(
        &self,
        aggregate_root_id: &AggregateRootId,
        aggregate_root_type: &AggregateRootType,
        version: StreamVersion,
        command_id: CommandId,
    ) -> EventStoreResult<bool> {
        let exists = self
            .logs
            .read()
            .get(&(aggregate_root_type.clone(), aggregate_root_id.clone()))
            .and_then(|log| log.commands.get(&command_id))
            .is_some_and(|committed| *committed == version);
        Ok(exists)
    }

    async fn query(
        &self,
        aggregate_root_id: &AggregateRootId,
        aggregate_root_type: &AggregateRootType,
        min_version: StreamVersion,
        max_version: StreamVersion,
    ) -> EventStoreResult<Vec<EventStream<Self::Event>>> {
        let streams: Vec<_> = self
            .logs
            .read()
            .get(&(aggregate_root_type.clone(), aggregate_root_id.clone()))
            .map(|log| {
                log.streams
                    .iter()
                    .filter(|s| s.version() >= min_version && s.version() <= max_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        trace!(%aggregate_root_id, %min_version, %max_version, "Queried event streams");
        Ok(streams)
    }

    fn query_all(&self) -> BoxStream<'_, EventStoreResult<EventStream<Self::Event>>> {
        // Snapshot under the read lock; the lock is not held while the caller consumes.
        let snapshot: Vec<_> = self
            .logs
            .read()
            .values()
            .flat_map(|log| log.streams.iter().cloned())
            .collect();
        stream::iter(snapshot.into_iter().map(Ok)).boxed()
    }
}
