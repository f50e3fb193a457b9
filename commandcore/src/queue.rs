//! Message queue port.
//!
//! The retry command queue and the event stream dispatch queues are both
//! expressed through [`MessageQueue`]. Any transport (in-process channel,
//! broker client, ...) that satisfies this contract is interchangeable.

use async_trait::async_trait;

use crate::errors::TransportResult;

/// A queue that accepts messages for later processing.
///
/// Implementations must tolerate concurrent `enqueue` calls from independent
/// command attempts. Callers treat every error as retryable, so `enqueue`
/// must be safe to invoke again after a failure.
#[async_trait]
pub trait MessageQueue<M>: Send + Sync {
    /// Name of the queue, used in log records and transport errors.
    fn name(&self) -> &str;

    /// Hands a message to the queue.
    ///
    /// # Errors
    /// Returns a [`TransportError`](crate::errors::TransportError) when the
    /// backend is unavailable, full or closed.
    async fn enqueue(&self, message: M) -> TransportResult<()>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::MessageQueue;
    use crate::errors::{TransportError, TransportResult};

    /// Queue that rejects its first `failures` messages and accepts the rest.
    pub struct ScriptedQueue<M> {
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
        accepted: Mutex<Vec<M>>,
    }

    impl<M> ScriptedQueue<M> {
        pub fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicUsize::new(failures),
                attempts: AtomicUsize::new(0),
                accepted: Mutex::new(Vec::new()),
            })
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn accepted(&self) -> usize {
            self.accepted.lock().len()
        }
    }

    #[async_trait]
    impl<M: Send + 'static> MessageQueue<M> for ScriptedQueue<M> {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn enqueue(&self, message: M) -> TransportResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let rejected = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if rejected {
                return Err(TransportError::Unavailable {
                    queue: "scripted".to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
            self.accepted.lock().push(message);
            Ok(())
        }
    }
}
