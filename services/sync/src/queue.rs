use std::{collections::VecDeque, fmt, time::Duration};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::SyncError;

/// A message received from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Queue-assigned message id, for logging.
    pub id: String,

    /// Handle used to delete this delivery.
    pub receipt: String,

    /// Raw message body, expected to be a JSON envelope.
    pub body: String,
}

/// A long-polling message queue with at-least-once delivery.
#[async_trait::async_trait]
pub trait MessageQueue: fmt::Debug + Send + Sync {
    /// The name of the queue implementation.
    fn name(&self) -> &'static str;

    /// Wait up to `wait` for at most `max` messages.
    ///
    /// Received messages stay invisible to other receivers until deleted or
    /// until the queue makes them visible again.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Message>, SyncError>;

    /// Acknowledge a delivery, removing the message from the queue.
    async fn delete(&self, receipt: &str) -> Result<(), SyncError>;
}

#[async_trait::async_trait]
impl<Q> MessageQueue for std::sync::Arc<Q>
where
    Q: MessageQueue + ?Sized,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Message>, SyncError> {
        (**self).receive(max, wait).await
    }

    async fn delete(&self, receipt: &str) -> Result<(), SyncError> {
        (**self).delete(receipt).await
    }
}

#[derive(Debug, Default)]
struct Queues {
    ready: VecDeque<Message>,
    in_flight: Vec<Message>,
    failures: usize,
}

/// In-process queue, for tests and local runs.
///
/// Messages move to an in-flight set when received and stay there until
/// deleted or explicitly released with [`MemoryQueue::release_in_flight`],
/// which stands in for a visibility timeout.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    queues: Mutex<Queues>,
    notify: Notify,
}

impl MemoryQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message body, returning its id.
    pub fn send(&self, body: impl Into<String>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.queues.lock().ready.push_back(Message {
            id: id.clone(),
            receipt: String::new(),
            body: body.into(),
        });
        self.notify.notify_waiters();
        id
    }

    /// Make the next `count` receive calls fail.
    pub fn fail_receives(&self, count: usize) {
        self.queues.lock().failures = count;
    }

    /// Messages waiting to be received.
    pub fn ready(&self) -> usize {
        self.queues.lock().ready.len()
    }

    /// Messages received but not yet deleted.
    pub fn in_flight(&self) -> usize {
        self.queues.lock().in_flight.len()
    }

    /// Return every in-flight message to the ready queue.
    pub fn release_in_flight(&self) {
        let mut queues = self.queues.lock();
        let released: Vec<_> = queues.in_flight.drain(..).collect();
        for message in released.into_iter().rev() {
            queues.ready.push_front(message);
        }
        drop(queues);
        self.notify.notify_waiters();
    }

    fn take(&self, max: usize) -> Result<Vec<Message>, SyncError> {
        let mut queues = self.queues.lock();
        if queues.failures > 0 {
            queues.failures -= 1;
            return Err(SyncError::Queue {
                operation: "receive",
                source: "injected receive failure".into(),
            });
        }

        let count = max.min(queues.ready.len());
        let mut batch = Vec::with_capacity(count);
        for mut message in queues.ready.drain(..count).collect::<Vec<_>>() {
            message.receipt = uuid::Uuid::new_v4().to_string();
            queues.in_flight.push(message.clone());
            batch.push(message);
        }
        Ok(batch)
    }
}

#[async_trait::async_trait]
impl MessageQueue for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Message>, SyncError> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let batch = self.take(max)?;
        if !batch.is_empty() || wait.is_zero() {
            return Ok(batch);
        }

        let _ = tokio::time::timeout(wait, notified).await;
        self.take(max)
    }

    async fn delete(&self, receipt: &str) -> Result<(), SyncError> {
        let mut queues = self.queues.lock();
        let before = queues.in_flight.len();
        queues.in_flight.retain(|message| message.receipt != receipt);
        if queues.in_flight.len() == before {
            return Err(SyncError::Queue {
                operation: "delete",
                source: format!("unknown receipt handle {receipt}").into(),
            });
        }
        Ok(())
    }
}
