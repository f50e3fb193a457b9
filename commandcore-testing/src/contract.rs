//! Event store contract scenarios.
//!
//! Each scenario builds a fresh store with `make_store`, works on aggregate
//! ids unique to the run (so a shared backend can run scenarios in parallel)
//! and returns a [`ContractTestFailure`] describing the first violated
//! expectation.

use std::fmt;
use std::sync::Arc;

use commandcore::errors::EventStoreError;
use commandcore::event_store::EventStore;
use commandcore::event_stream::EventStream;
use commandcore::types::{AggregateRootId, AggregateRootType, CommandId, StreamVersion};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A violated contract expectation.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: EventStoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }

    /// The scenario that failed.
    pub const fn scenario(&self) -> &'static str {
        self.scenario
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

/// Event payload used by every scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractTestEvent {
    /// Aggregate the event was produced for
    pub aggregate_id: AggregateRootId,
    /// Position of the event within its scenario
    pub sequence: u64,
}

fn contract_aggregate(
    scenario: &'static str,
    label: &str,
) -> Result<(AggregateRootId, AggregateRootType), ContractTestFailure> {
    let raw = format!("contract::{scenario}::{label}::{}", Uuid::now_v7());
    let id = AggregateRootId::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("unable to construct aggregate id `{raw}`: {error}"),
        )
    })?;
    let ty = AggregateRootType::try_new("ContractAggregate").map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("unable to construct aggregate type: {error}"))
    })?;
    Ok((id, ty))
}

fn contract_version(scenario: &'static str, version: u64) -> Result<StreamVersion, ContractTestFailure> {
    StreamVersion::try_new(version).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("invalid version {version}: {error}"))
    })
}

fn contract_stream(
    scenario: &'static str,
    aggregate: &(AggregateRootId, AggregateRootType),
    version: u64,
    command_id: CommandId,
) -> Result<EventStream<ContractTestEvent>, ContractTestFailure> {
    let (id, ty) = aggregate;
    Ok(EventStream::new(
        id.clone(),
        ty.clone(),
        contract_version(scenario, version)?,
        command_id,
        vec![ContractTestEvent {
            aggregate_id: id.clone(),
            sequence: version,
        }],
    ))
}

async fn append_ok<S>(
    scenario: &'static str,
    store: &S,
    stream: &EventStream<ContractTestEvent>,
) -> ContractTestResult
where
    S: EventStore<Event = ContractTestEvent>,
{
    store
        .append(stream)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "append", error))
}

async fn query_versions<S>(
    scenario: &'static str,
    store: &S,
    aggregate: &(AggregateRootId, AggregateRootType),
    min: u64,
    max: u64,
) -> Result<Vec<u64>, ContractTestFailure>
where
    S: EventStore<Event = ContractTestEvent>,
{
    let (id, ty) = aggregate;
    let streams = store
        .query(
            id,
            ty,
            contract_version(scenario, min)?,
            contract_version(scenario, max)?,
        )
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "query", error))?;
    Ok(streams.iter().map(|s| s.version().into_inner()).collect())
}

/// Committed streams come back from `query` in ascending version order,
/// restricted to the requested range.
pub async fn test_append_and_query<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore<Event = ContractTestEvent> + 'static,
{
    const SCENARIO: &str = "append_and_query";

    let store = make_store();
    let aggregate = contract_aggregate(SCENARIO, "ordered")?;
    for version in 1..=3 {
        let stream = contract_stream(SCENARIO, &aggregate, version, CommandId::new())?;
        append_ok(SCENARIO, &store, &stream).await?;
    }

    let all = query_versions(SCENARIO, &store, &aggregate, 1, 3).await?;
    if all != [1, 2, 3] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected versions [1, 2, 3], observed {all:?}"),
        ));
    }

    let middle = query_versions(SCENARIO, &store, &aggregate, 2, 2).await?;
    if middle != [2] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected only version 2 in range 2..=2, observed {middle:?}"),
        ));
    }

    let beyond = query_versions(SCENARIO, &store, &aggregate, 4, 10).await?;
    if !beyond.is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected no versions beyond the log, observed {beyond:?}"),
        ));
    }

    Ok(())
}

/// Replaying a command is reported as `DuplicateCommand`, whatever version
/// the replay targets, and leaves the log untouched.
pub async fn test_duplicate_command_is_idempotent<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore<Event = ContractTestEvent> + 'static,
{
    const SCENARIO: &str = "duplicate_command_is_idempotent";

    let store = make_store();
    let aggregate = contract_aggregate(SCENARIO, "replayed")?;
    let command_id = CommandId::new();
    append_ok(
        SCENARIO,
        &store,
        &contract_stream(SCENARIO, &aggregate, 1, command_id)?,
    )
    .await?;

    for version in [1, 2] {
        let replay = contract_stream(SCENARIO, &aggregate, version, command_id)?;
        match store.append(&replay).await {
            Err(EventStoreError::DuplicateCommand {
                existing_version, ..
            }) if existing_version.into_inner() == 1 => {}
            Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "append", error)),
            Ok(()) => {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!("replay at version {version} was appended"),
                ))
            }
        }
    }

    let versions = query_versions(SCENARIO, &store, &aggregate, 1, 5).await?;
    if versions != [1] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("replays changed the log: {versions:?}"),
        ));
    }

    let (id, ty) = &aggregate;
    let exists = store
        .is_event_stream_exist(id, ty, StreamVersion::initial(), command_id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "is_event_stream_exist", error))?;
    if !exists {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "committed stream not reported by is_event_stream_exist",
        ));
    }

    Ok(())
}

/// Of two concurrent appends to the same version exactly one wins; the loser
/// gets `ConcurrencyConflict` and the log stays gap-free.
pub async fn test_concurrent_version_conflicts<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore<Event = ContractTestEvent> + 'static,
{
    const SCENARIO: &str = "concurrent_version_conflicts";

    let store = Arc::new(make_store());
    let aggregate = contract_aggregate(SCENARIO, "contested")?;
    let left = contract_stream(SCENARIO, &aggregate, 1, CommandId::new())?;
    let right = contract_stream(SCENARIO, &aggregate, 1, CommandId::new())?;

    let left_task = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.append(&left).await })
    };
    let right_task = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.append(&right).await })
    };
    let results = [left_task.await, right_task.await];

    let mut winners = 0;
    let mut conflicts = 0;
    for result in results {
        match result {
            Ok(Ok(())) => winners += 1,
            Ok(Err(EventStoreError::ConcurrencyConflict { .. })) => conflicts += 1,
            Ok(Err(error)) => return Err(ContractTestFailure::store_error(SCENARIO, "append", error)),
            Err(join_error) => {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!("append task failed: {join_error}"),
                ))
            }
        }
    }
    if (winners, conflicts) != (1, 1) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected one winner and one conflict, observed {winners} and {conflicts}"),
        ));
    }

    append_ok(
        SCENARIO,
        store.as_ref(),
        &contract_stream(SCENARIO, &aggregate, 2, CommandId::new())?,
    )
    .await?;
    let versions = query_versions(SCENARIO, store.as_ref(), &aggregate, 1, 5).await?;
    if versions != [1, 2] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected gap-free versions [1, 2], observed {versions:?}"),
        ));
    }

    Ok(())
}

/// A version that skips ahead of the log is rejected.
pub async fn test_version_gap_rejected<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore<Event = ContractTestEvent> + 'static,
{
    const SCENARIO: &str = "version_gap_rejected";

    let store = make_store();
    let aggregate = contract_aggregate(SCENARIO, "gapped")?;
    let ahead = contract_stream(SCENARIO, &aggregate, 2, CommandId::new())?;

    match store.append(&ahead).await {
        Err(EventStoreError::VersionGap { .. }) => {}
        Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "append", error)),
        Ok(()) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "version 2 was appended to an empty log",
            ))
        }
    }

    append_ok(
        SCENARIO,
        &store,
        &contract_stream(SCENARIO, &aggregate, 1, CommandId::new())?,
    )
    .await
}

/// Command idempotency is scoped to one aggregate: the same command may
/// commit once per aggregate it touches.
pub async fn test_aggregate_isolation<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore<Event = ContractTestEvent> + 'static,
{
    const SCENARIO: &str = "aggregate_isolation";

    let store = make_store();
    let left = contract_aggregate(SCENARIO, "left")?;
    let right = contract_aggregate(SCENARIO, "right")?;
    let command_id = CommandId::new();

    append_ok(SCENARIO, &store, &contract_stream(SCENARIO, &left, 1, command_id)?).await?;
    append_ok(SCENARIO, &store, &contract_stream(SCENARIO, &right, 1, command_id)?).await?;

    let left_versions = query_versions(SCENARIO, &store, &left, 1, 5).await?;
    let right_versions = query_versions(SCENARIO, &store, &right, 1, 5).await?;
    if left_versions != [1] || right_versions != [1] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected one stream per aggregate, observed {left_versions:?} and {right_versions:?}"),
        ));
    }

    let (id, ty) = &right;
    let unknown = store
        .is_event_stream_exist(id, ty, StreamVersion::initial(), CommandId::new())
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "is_event_stream_exist", error))?;
    if unknown {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "is_event_stream_exist reported a command that never committed",
        ));
    }

    Ok(())
}

/// `query_all` yields every committed stream, each aggregate in ascending
/// version order.
pub async fn test_query_all<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore<Event = ContractTestEvent> + 'static,
{
    const SCENARIO: &str = "query_all";

    let store = make_store();
    let first = contract_aggregate(SCENARIO, "first")?;
    let second = contract_aggregate(SCENARIO, "second")?;
    for version in 1..=3 {
        append_ok(
            SCENARIO,
            &store,
            &contract_stream(SCENARIO, &first, version, CommandId::new())?,
        )
        .await?;
    }
    append_ok(
        SCENARIO,
        &store,
        &contract_stream(SCENARIO, &second, 1, CommandId::new())?,
    )
    .await?;

    let all: Vec<EventStream<ContractTestEvent>> = store
        .query_all()
        .try_collect()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "query_all", error))?;

    let versions_of = |aggregate: &(AggregateRootId, AggregateRootType)| -> Vec<u64> {
        all.iter()
            .filter(|s| s.aggregate_root_id() == &aggregate.0)
            .map(|s| s.version().into_inner())
            .collect()
    };
    let first_versions = versions_of(&first);
    let second_versions = versions_of(&second);
    if first_versions != [1, 2, 3] || second_versions != [1] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("query_all returned {first_versions:?} and {second_versions:?}"),
        ));
    }

    Ok(())
}

/// Generates one `#[tokio::test]` per contract scenario.
///
/// `make_store` must build a store whose event type is [`ContractTestEvent`].
#[macro_export]
macro_rules! event_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        mod $suite {
            use $crate::contract::{
                test_aggregate_isolation, test_append_and_query,
                test_concurrent_version_conflicts, test_duplicate_command_is_idempotent,
                test_query_all, test_version_gap_rejected,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn append_and_query_contract() {
                test_append_and_query($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn duplicate_command_is_idempotent_contract() {
                test_duplicate_command_is_idempotent($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_version_conflicts_contract() {
                test_concurrent_version_conflicts($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn version_gap_rejected_contract() {
                test_version_gap_rejected($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn aggregate_isolation_contract() {
                test_aggregate_isolation($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn query_all_contract() {
                test_query_all($make_store)
                    .await
                    .expect("event store contract failed");
            }
        }
    };
}

pub use event_store_contract_tests;
