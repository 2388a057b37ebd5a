//! Background task that applies snapshot notifications.

use std::{sync::Arc, time::Duration};

use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::location::ObjectLocation;
use crate::object::ObjectStore;
use crate::queue::{Message, MessageQueue};
use crate::reload::Reload;

/// Largest batch a single receive may ask for.
pub const MAX_BATCH: usize = 10;

/// Longest long-poll wait.
pub const MAX_WAIT: Duration = Duration::from_secs(20);

/// Delay before polling again after a failed receive.
pub const RECEIVE_BACKOFF: Duration = Duration::from_secs(5);

/// Listener settings as read from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListenerConfig {
    /// Messages per receive, 1 to 10. Defaults to 1.
    #[serde(default)]
    pub max_messages: Option<usize>,

    /// Long-poll wait in seconds, 0 to 20. Defaults to 20.
    #[serde(default)]
    pub wait_seconds: Option<u64>,
}

impl ListenerConfig {
    /// Batch size, clamped to what the queue accepts.
    pub fn max_messages(&self) -> usize {
        self.max_messages.unwrap_or(1).clamp(1, MAX_BATCH)
    }

    /// Long-poll wait, clamped to what the queue accepts.
    pub fn wait(&self) -> Duration {
        self.wait_seconds
            .map(Duration::from_secs)
            .unwrap_or(MAX_WAIT)
            .min(MAX_WAIT)
    }
}

/// Queue message body.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(alias = "s3_uri")]
    location: String,
}

/// Polls a queue for snapshot notifications, stages each snapshot next to
/// the store's file and asks the store to install it.
///
/// Delivery is at-least-once: a message is deleted only after the download
/// and install both succeed. Failed messages are left for the queue to
/// redeliver.
#[derive(Debug)]
pub struct QueueListener<Q, O, R> {
    queue: Q,
    objects: O,
    reload: R,
    target: Utf8PathBuf,
    max_messages: usize,
    wait: Duration,
    backoff: Duration,
}

impl<Q, O, R> QueueListener<Q, O, R>
where
    Q: MessageQueue + 'static,
    O: ObjectStore + 'static,
    R: Reload + 'static,
{
    /// A listener that installs snapshots referenced by messages on `queue`
    /// at `target`, using the default polling parameters.
    pub fn new(queue: Q, objects: O, reload: R, target: impl Into<Utf8PathBuf>) -> Self {
        let defaults = ListenerConfig::default();
        Self {
            queue,
            objects,
            reload,
            target: target.into(),
            max_messages: defaults.max_messages(),
            wait: defaults.wait(),
            backoff: RECEIVE_BACKOFF,
        }
    }

    /// Apply batch size and wait settings.
    pub fn with_config(mut self, config: &ListenerConfig) -> Self {
        self.max_messages = config.max_messages();
        self.wait = config.wait();
        self
    }

    /// Override the delay after a failed receive.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start polling on the current runtime.
    ///
    /// The loop exits once `cancel` fires. A message that is already being
    /// processed is finished first.
    pub fn spawn(self, cancel: CancellationToken) -> ListenerHandle {
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { self.run(cancel).await }
        });
        ListenerHandle { cancel, task }
    }

    /// Poll until `cancel` fires.
    #[tracing::instrument(skip_all, fields(queue = self.queue.name(), objects = self.objects.name(), target = %self.target))]
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            max_messages = self.max_messages,
            wait = ?self.wait,
            "starting queue listener"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.poll_once().await {
                Ok(processed) => {
                    if processed > 0 {
                        tracing::trace!(processed, "processed batch");
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, backoff = ?self.backoff, "receive failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }

        tracing::info!("queue listener stopped");
    }

    /// Receive one batch and process every message in it.
    ///
    /// Returns the number of messages that were applied and deleted. Only a
    /// failed receive is an error; per-message failures are logged.
    pub async fn poll_once(&self) -> Result<usize, SyncError> {
        let messages = self.queue.receive(self.max_messages, self.wait).await?;
        let mut applied = 0;

        for message in messages {
            match self.process(&message).await {
                Ok(location) => {
                    tracing::info!(id = %message.id, %location, "applied snapshot");
                }
                Err(error) => {
                    tracing::error!(
                        id = %message.id,
                        %error,
                        permanent = error.is_permanent(),
                        "failed to process message, leaving it for redelivery"
                    );
                    continue;
                }
            }

            match self.queue.delete(&message.receipt).await {
                Ok(()) => applied += 1,
                Err(error) => {
                    tracing::error!(id = %message.id, %error, "failed to delete message")
                }
            }
        }

        Ok(applied)
    }

    async fn process(&self, message: &Message) -> Result<ObjectLocation, SyncError> {
        tracing::debug!(id = %message.id, "received message");
        let envelope: Envelope = serde_json::from_str(&message.body).map_err(SyncError::Message)?;
        let location: ObjectLocation = envelope.location.parse()?;

        let staged = self.objects.download_staged(&location, &self.target).await?;
        self.reload.install(staged, &self.target).await?;
        Ok(location)
    }
}

/// Owns a running listener task.
#[derive(Debug)]
pub struct ListenerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the loop to stop and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(error) = self.task.await {
            tracing::error!(%error, "queue listener task failed");
        }
    }
}

/// A listener over boxed components, as built from configuration.
pub type DynQueueListener =
    QueueListener<Arc<dyn MessageQueue>, Arc<dyn ObjectStore>, Arc<dyn Reload>>;
