//! In-memory message queue with fault injection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use commandcore::errors::{TransportError, TransportResult};
use commandcore::queue::MessageQueue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A queue that keeps accepted messages in memory.
///
/// Failures can be scripted with [`fail_next`](Self::fail_next),
/// [`set_available`](Self::set_available) and [`close`](Self::close) to drive
/// retry paths in tests.
pub struct InMemoryMessageQueue<M> {
    name: String,
    capacity: Option<usize>,
    messages: Mutex<Vec<M>>,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    available: AtomicBool,
    closed: AtomicBool,
    accepted: Notify,
}

impl<M> InMemoryMessageQueue<M> {
    /// Creates an unbounded queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            messages: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            accepted: Notify::new(),
        }
    }

    /// Creates a queue that reports itself full after `capacity` messages.
    pub fn bounded(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new(name)
        }
    }

    /// Rejects the next `count` messages as unavailable.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Makes the queue reject (`false`) or accept (`true`) every message.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Closes the queue for good.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Number of `enqueue` calls, accepted or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of accepted messages.
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Whether no message was accepted.
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Removes and returns the accepted messages.
    pub fn drain(&self) -> Vec<M> {
        std::mem::take(&mut *self.messages.lock())
    }

    /// Waits until at least `count` messages have been accepted.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.accepted.notified();
            if self.len() >= count {
                return;
            }
            notified.await;
        }
    }

    fn rejection(&self) -> Option<TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Some(TransportError::Closed {
                queue: self.name.clone(),
            });
        }
        if !self.available.load(Ordering::SeqCst) {
            return Some(TransportError::Unavailable {
                queue: self.name.clone(),
                reason: "queue marked unavailable".to_string(),
            });
        }
        let scripted = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted {
            return Some(TransportError::Unavailable {
                queue: self.name.clone(),
                reason: "injected failure".to_string(),
            });
        }
        None
    }
}

impl<M> std::fmt::Debug for InMemoryMessageQueue<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMessageQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<M: Send + 'static> MessageQueue<M> for InMemoryMessageQueue<M> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, message: M) -> TransportResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.rejection() {
            warn!(queue = %self.name, error = %error, "Message rejected");
            return Err(error);
        }

        let len = {
            let mut messages = self.messages.lock();
            if self.capacity.is_some_and(|capacity| messages.len() >= capacity) {
                return Err(TransportError::Full {
                    queue: self.name.clone(),
                });
            }
            messages.push(message);
            messages.len()
        };
        self.accepted.notify_waiters();
        debug!(queue = %self.name, len, "Message accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn accepts_and_drains_in_order() {
        let queue = InMemoryMessageQueue::new("commands");
        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();

        assert_eq!(queue.drain(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed() {
        let queue = InMemoryMessageQueue::new("commands");
        queue.fail_next(2);

        assert!(queue.enqueue("a").await.is_err());
        assert!(queue.enqueue("a").await.is_err());
        queue.enqueue("a").await.unwrap();

        assert_eq!(queue.attempts(), 3);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_and_closed_queues_reject() {
        let queue = InMemoryMessageQueue::new("commands");
        queue.set_available(false);
        assert!(matches!(
            queue.enqueue(()).await,
            Err(TransportError::Unavailable { .. })
        ));

        queue.set_available(true);
        queue.close();
        assert!(matches!(
            queue.enqueue(()).await,
            Err(TransportError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn bounded_queue_reports_full() {
        let queue = InMemoryMessageQueue::bounded("commands", 1);
        queue.enqueue(1).await.unwrap();
        assert_eq!(
            queue.enqueue(2).await.unwrap_err(),
            TransportError::Full {
                queue: "commands".to_string()
            }
        );
    }

    #[tokio::test]
    async fn wait_for_returns_once_messages_arrive() {
        let queue = Arc::new(InMemoryMessageQueue::new("commands"));
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(7).await.unwrap();
        });

        tokio::time::timeout(Duration::from_secs(5), queue.wait_for(1))
            .await
            .unwrap();
        assert_eq!(queue.len(), 1);
    }
}
