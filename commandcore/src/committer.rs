//! Commits one event stream and hands it on to its dispatch queue.
//!
//! [`EventCommitter::commit`] is where the store contract and the conflict
//! classifier meet:
//!
//! 1. a stream the command already committed is not appended again;
//! 2. a successful or duplicate append is dispatched to the context's queue,
//!    inline first and through the retry scheduler if the queue keeps failing;
//! 3. a lost version race marks the context and hands it back to the caller;
//! 4. any other store failure is reported to the async result registry.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use crate::action::ActionInfo;
use crate::async_result::CommandAsyncResultManager;
use crate::errors::{ErrorInfo, EventStoreError};
use crate::event_store::{classify_append_error, AppendErrorClass, EventStore};
use crate::event_stream::{EventStream, EventStreamContext};
use crate::queue::MessageQueue;
use crate::retry::{RetryAction, RetryService};
use crate::types::CommandId;

const DISPATCH_ACTION: &str = "DispatchEventStream";
const DEFERRED_DISPATCH_ACTION: &str = "RetryDispatchEventStream";

/// What happened to a committed stream's dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The queue accepted the stream inline.
    Sent,
    /// The retry scheduler keeps offering the stream to the queue.
    Deferred,
    /// The scheduler was stopped; the stream is committed but was not dispatched.
    Dropped,
}

/// Result of [`EventCommitter::commit`].
#[derive(Debug)]
pub enum CommitOutcome<E> {
    /// The stream was appended.
    Committed {
        /// Dispatch of the new stream
        dispatch: DispatchOutcome,
    },
    /// The command had already committed this stream.
    AlreadyCommitted {
        /// Dispatch of the existing stream
        dispatch: DispatchOutcome,
    },
    /// Another command won the target version. The context carries the
    /// conflict; the caller refetches the aggregate and re-derives.
    Conflict(EventStreamContext<E>),
    /// The store failed for an unexpected reason; already reported to the registry.
    Failed {
        /// The reported failure
        error_info: ErrorInfo,
    },
}

/// Appends event streams, classifies append failures and dispatches commits.
pub struct EventCommitter<S> {
    store: Arc<S>,
    results: Arc<CommandAsyncResultManager>,
    retry_service: Arc<RetryService>,
}

impl<S> EventCommitter<S>
where
    S: EventStore + 'static,
    S::Event: Clone + Send + Sync + 'static,
{
    /// Creates a committer over `store`.
    pub fn new(
        store: Arc<S>,
        results: Arc<CommandAsyncResultManager>,
        retry_service: Arc<RetryService>,
    ) -> Self {
        Self {
            store,
            results,
            retry_service,
        }
    }

    /// The underlying store.
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Commits the stream carried by `context`.
    #[instrument(
        skip_all,
        fields(
            aggregate_root_type = %context.event_stream().aggregate_root_type(),
            aggregate_root_id = %context.event_stream().aggregate_root_id(),
            version = %context.event_stream().version(),
            command_id = %context.event_stream().command_id(),
        )
    )]
    pub async fn commit(
        &self,
        mut context: EventStreamContext<S::Event>,
    ) -> CommitOutcome<S::Event> {
        let command_id = context.event_stream().command_id();

        let exists = {
            let stream = context.event_stream();
            self.store
                .is_event_stream_exist(
                    stream.aggregate_root_id(),
                    stream.aggregate_root_type(),
                    stream.version(),
                    command_id,
                )
                .await
        };
        match exists {
            Ok(true) => {
                debug!("Event stream already committed");
                return CommitOutcome::AlreadyCommitted {
                    dispatch: self.dispatch(context).await,
                };
            }
            Ok(false) => {}
            Err(e) => return self.fail(command_id, e),
        }

        let appended = self.store.append(context.event_stream()).await;
        let Err(e) = appended else {
            debug!("Event stream committed");
            return CommitOutcome::Committed {
                dispatch: self.dispatch(context).await,
            };
        };

        match classify_append_error(&e) {
            AppendErrorClass::Duplicate => {
                info!(error = %e, "Duplicate command append treated as committed");
                CommitOutcome::AlreadyCommitted {
                    dispatch: self.dispatch(context).await,
                }
            }
            AppendErrorClass::ConcurrencyConflict => {
                let error_info = ErrorInfo::from_fault(e);
                if let Err(context_error) = context.set_concurrency_conflict(error_info.clone()) {
                    error!(error = %context_error, "Cannot mark event stream context");
                    return self.report(command_id, error_info);
                }
                warn!("Event stream lost a version race");
                CommitOutcome::Conflict(context)
            }
            AppendErrorClass::Unknown => self.fail(command_id, e),
        }
    }

    fn fail(&self, command_id: CommandId, error: EventStoreError) -> CommitOutcome<S::Event> {
        error!(error = %error, "Event store failure");
        self.report(command_id, ErrorInfo::from_fault(error))
    }

    fn report(&self, command_id: CommandId, error_info: ErrorInfo) -> CommitOutcome<S::Event> {
        let (message, fault) = error_info.clone().into_parts();
        if !self.results.try_complete(command_id, message, fault) {
            debug!("No pending result for failed command");
        }
        CommitOutcome::Failed { error_info }
    }

    async fn dispatch(&self, context: EventStreamContext<S::Event>) -> DispatchOutcome {
        let (stream, queue) = context.into_parts();
        let command_id = stream.command_id();
        let inline_attempts = self.retry_service.config().inline_attempts.into_inner();

        let (target, message) = (queue.as_ref(), &stream);
        let sent = self
            .retry_service
            .try_action(
                DISPATCH_ACTION,
                || send_stream(target, message),
                inline_attempts,
            )
            .await;
        if sent {
            self.results.try_complete_success(command_id);
            return DispatchOutcome::Sent;
        }

        // The stream is durable, so the command succeeded whether or not the
        // dispatch ever goes through.
        let action = RetryAction::new(DEFERRED_DISPATCH_ACTION, move || {
            let queue = Arc::clone(&queue);
            let stream = stream.clone();
            async move { send_stream(queue.as_ref(), &stream).await }.boxed()
        })
        .on_success(complete_command(&self.results, command_id))
        .on_abandon(complete_command(&self.results, command_id));

        match self.retry_service.retry_in_queue(Box::new(action)).await {
            Ok(()) => DispatchOutcome::Deferred,
            Err(e) => {
                error!(error = %e, "Cannot defer event stream dispatch");
                self.results.try_complete_success(command_id);
                DispatchOutcome::Dropped
            }
        }
    }
}

impl<S> std::fmt::Debug for EventCommitter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCommitter")
            .field("results", &self.results)
            .field("retry_service", &self.retry_service)
            .finish_non_exhaustive()
    }
}

fn complete_command(results: &Arc<CommandAsyncResultManager>, command_id: CommandId) -> ActionInfo {
    let results = Arc::clone(results);
    ActionInfo::new("CompleteCommand", move |()| {
        results.try_complete_success(command_id);
        true
    })
}

async fn send_stream<E>(queue: &dyn MessageQueue<EventStream<E>>, stream: &EventStream<E>) -> bool
where
    E: Clone + Send + Sync + 'static,
{
    match queue.enqueue(stream.clone()).await {
        Ok(()) => true,
        Err(e) => {
            error!(
                queue = queue.name(),
                aggregate_root_id = %stream.aggregate_root_id(),
                version = %stream.version(),
                error = %e,
                "Failed to dispatch event stream"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_result::CommandStatus;
    use crate::config::{RetryConfig, RetryIntervalMs, ShutdownMode};
    use crate::errors::EventStoreResult;
    use crate::event_stream::EventStreamQueue;
    use crate::queue::test_support::ScriptedQueue;
    use crate::types::{AggregateRootId, AggregateRootType, StreamVersion};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tracing_test::traced_test;

    /// Store whose answers are fixed up front.
    #[derive(Default)]
    struct ScriptedStore {
        exists: bool,
        append_error: Mutex<Option<EventStoreError>>,
        appends: Mutex<Vec<EventStream<String>>>,
    }

    impl ScriptedStore {
        fn failing_with(error: EventStoreError) -> Self {
            Self {
                append_error: Mutex::new(Some(error)),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl EventStore for ScriptedStore {
        type Event = String;

        async fn append(&self, stream: &EventStream<String>) -> EventStoreResult<()> {
            if let Some(error) = self.append_error.lock().take() {
                return Err(error);
            }
            self.appends.lock().push(stream.clone());
            Ok(())
        }

        async fn is_event_stream_exist(
            &self,
            _aggregate_root_id: &AggregateRootId,
            _aggregate_root_type: &AggregateRootType,
            _version: StreamVersion,
            _command_id: CommandId,
        ) -> EventStoreResult<bool> {
            Ok(self.exists)
        }

        async fn query(
            &self,
            _aggregate_root_id: &AggregateRootId,
            _aggregate_root_type: &AggregateRootType,
            _min_version: StreamVersion,
            _max_version: StreamVersion,
        ) -> EventStoreResult<Vec<EventStream<String>>> {
            Ok(self.appends.lock().clone())
        }

        fn query_all(&self) -> BoxStream<'_, EventStoreResult<EventStream<String>>> {
            futures::stream::iter(self.appends.lock().clone().into_iter().map(Ok)).boxed()
        }
    }

    fn stream(command_id: CommandId) -> EventStream<String> {
        EventStream::new(
            AggregateRootId::try_new("order-1").unwrap(),
            AggregateRootType::try_new("Order").unwrap(),
            StreamVersion::initial(),
            command_id,
            vec!["OrderPlaced".to_string()],
        )
    }

    fn committer(
        store: ScriptedStore,
    ) -> (EventCommitter<ScriptedStore>, Arc<CommandAsyncResultManager>) {
        let results = Arc::new(CommandAsyncResultManager::new());
        let retry_service = Arc::new(RetryService::start(
            RetryConfig::default().with_retry_interval(RetryIntervalMs::try_new(10).unwrap()),
        ));
        (
            EventCommitter::new(Arc::new(store), Arc::clone(&results), retry_service),
            results,
        )
    }

    fn context(
        command_id: CommandId,
        queue: &Arc<ScriptedQueue<EventStream<String>>>,
    ) -> EventStreamContext<String> {
        EventStreamContext::new(
            stream(command_id),
            Arc::clone(queue) as EventStreamQueue<String>,
        )
    }

    #[tokio::test]
    async fn appended_stream_is_dispatched_and_completed() {
        let (committer, results) = committer(ScriptedStore::default());
        let queue = ScriptedQueue::failing(0);
        let command_id = CommandId::new();
        let rx = results.register(command_id).unwrap();

        let outcome = committer.commit(context(command_id, &queue)).await;

        assert!(matches!(
            outcome,
            CommitOutcome::Committed {
                dispatch: DispatchOutcome::Sent
            }
        ));
        assert_eq!(queue.accepted(), 1);
        assert_eq!(committer.store().appends.lock().len(), 1);
        assert!(rx.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn existing_stream_is_not_appended_again() {
        let (committer, _results) = committer(ScriptedStore {
            exists: true,
            ..ScriptedStore::default()
        });
        let queue = ScriptedQueue::failing(0);

        let outcome = committer.commit(context(CommandId::new(), &queue)).await;

        assert!(matches!(outcome, CommitOutcome::AlreadyCommitted { .. }));
        assert!(committer.store().appends.lock().is_empty());
        assert_eq!(queue.accepted(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn duplicate_append_is_treated_as_committed() {
        let command_id = CommandId::new();
        let (committer, _results) =
            committer(ScriptedStore::failing_with(EventStoreError::DuplicateCommand {
                aggregate_id: AggregateRootId::try_new("order-1").unwrap(),
                aggregate_type: AggregateRootType::try_new("Order").unwrap(),
                command_id,
                existing_version: StreamVersion::initial(),
            }));
        let queue = ScriptedQueue::failing(0);

        let outcome = committer.commit(context(command_id, &queue)).await;

        assert!(matches!(
            outcome,
            CommitOutcome::AlreadyCommitted {
                dispatch: DispatchOutcome::Sent
            }
        ));
        assert!(logs_contain("Duplicate command append treated as committed"));
    }

    #[tokio::test]
    async fn lost_race_returns_marked_context() {
        let (committer, results) =
            committer(ScriptedStore::failing_with(EventStoreError::ConcurrencyConflict {
                aggregate_id: AggregateRootId::try_new("order-1").unwrap(),
                aggregate_type: AggregateRootType::try_new("Order").unwrap(),
                version: StreamVersion::initial(),
                winning_command_id: CommandId::new(),
            }));
        let queue = ScriptedQueue::failing(0);
        let command_id = CommandId::new();
        let _rx = results.register(command_id).unwrap();

        let CommitOutcome::Conflict(context) = committer.commit(context(command_id, &queue)).await
        else {
            panic!("expected a conflict");
        };

        assert!(context.has_concurrent_error());
        assert_eq!(
            context.error_info().unwrap().fault().kind(),
            "ConcurrencyConflict"
        );
        assert_eq!(queue.attempts(), 0);
        assert!(results.is_pending(command_id));
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_failure_reaches_the_registry() {
        let (committer, results) = committer(ScriptedStore::failing_with(
            EventStoreError::Unknown("disk full".to_string()),
        ));
        let queue = ScriptedQueue::failing(0);
        let command_id = CommandId::new();
        let rx = results.register(command_id).unwrap();

        let outcome = committer.commit(context(command_id, &queue)).await;

        let CommitOutcome::Failed { error_info } = outcome else {
            panic!("expected a failure");
        };
        assert_eq!(error_info.fault().kind(), "EventStoreError");
        let result = rx.await.unwrap();
        assert_eq!(result.status, CommandStatus::Failed);
        assert!(result.error_message.unwrap().contains("disk full"));
        assert_eq!(queue.attempts(), 0);
        assert!(logs_contain("Event store failure"));
    }

    #[tokio::test]
    async fn failing_queue_defers_dispatch() {
        let (committer, results) = committer(ScriptedStore::default());
        let queue = ScriptedQueue::failing(3);
        let command_id = CommandId::new();
        let rx = results.register(command_id).unwrap();

        let outcome = committer.commit(context(command_id, &queue)).await;
        assert!(matches!(
            outcome,
            CommitOutcome::Committed {
                dispatch: DispatchOutcome::Deferred
            }
        ));

        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("deferred dispatch should complete the command")
            .unwrap();
        assert!(result.is_success());
        assert_eq!(queue.accepted(), 1);
        assert_eq!(queue.attempts(), 4);
    }

    #[tokio::test]
    async fn stopping_the_scheduler_still_completes_a_deferred_dispatch() {
        let results = Arc::new(CommandAsyncResultManager::new());
        let retry_service = Arc::new(RetryService::start(
            RetryConfig::default().with_retry_interval(RetryIntervalMs::try_new(600_000).unwrap()),
        ));
        let committer = EventCommitter::new(
            Arc::new(ScriptedStore::default()),
            Arc::clone(&results),
            Arc::clone(&retry_service),
        );
        let queue = ScriptedQueue::failing(usize::MAX);
        let command_id = CommandId::new();
        let rx = results.register(command_id).unwrap();

        let outcome = committer.commit(context(command_id, &queue)).await;
        assert!(matches!(
            outcome,
            CommitOutcome::Committed {
                dispatch: DispatchOutcome::Deferred
            }
        ));
        assert!(results.is_pending(command_id));

        assert_eq!(retry_service.shutdown(ShutdownMode::Abandon).await, 1);

        assert!(rx.await.unwrap().is_success());
        assert_eq!(queue.accepted(), 0);
    }
}
