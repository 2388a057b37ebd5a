//! # Registry snapshot sync
//!
//! Keeps an embedded registry file up to date from object storage. A queue
//! carries notifications of the form `{"location": "s3://bucket/key"}`; for
//! each one the listener downloads the object into a staging file and the
//! store swaps it in for its own file and state.
//!
//! ```no_run
//! use registry_sync::{MemoryObjectStore, MemoryQueue, QueueListener};
//! use std::sync::Arc;
//! use store::JsonFileStore;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = JsonFileStore::open("/var/lib/registry/servers.json").await?;
//! let queue = Arc::new(MemoryQueue::new());
//! let objects = Arc::new(MemoryObjectStore::new());
//!
//! let handle = QueueListener::new(queue, objects, store.clone(), store.path())
//!     .spawn(CancellationToken::new());
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

use serde::Deserialize;

mod error;
mod listener;
mod location;
mod object;
mod queue;
mod reload;
#[cfg(feature = "aws")]
mod s3;
#[cfg(feature = "aws")]
mod sqs;

pub use error::{BoxError, SyncError};
pub use listener::{
    DynQueueListener, ListenerConfig, ListenerHandle, QueueListener, MAX_BATCH, MAX_WAIT,
    RECEIVE_BACKOFF,
};
pub use location::ObjectLocation;
pub use object::{MemoryObjectStore, ObjectStore, Staged, Writer};
pub use queue::{MemoryQueue, Message, MessageQueue};
pub use reload::{reload_fn, Reload, ReloadFn};
#[cfg(feature = "aws")]
pub use s3::S3ObjectStore;
#[cfg(feature = "aws")]
pub use sqs::SqsQueue;

/// Sync settings for the registry service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncConfig {
    /// Whether to run the listener at all.
    #[serde(default)]
    pub enabled: bool,

    /// The queue to poll.
    #[serde(default)]
    pub queue_url: Option<String>,

    /// Polling parameters.
    #[serde(flatten)]
    pub listener: ListenerConfig,
}

#[cfg(feature = "aws")]
impl SyncConfig {
    /// Start a listener on SQS and S3 that refreshes `store`.
    ///
    /// Returns `None` when sync is disabled.
    #[tracing::instrument(skip_all)]
    pub async fn spawn(
        &self,
        store: &store::JsonFileStore,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Option<ListenerHandle> {
        if !self.enabled {
            return None;
        }
        let Some(url) = self.queue_url.as_deref() else {
            tracing::error!("sync is enabled without a queue url");
            return None;
        };

        let queue = SqsQueue::from_env(url).await;
        let objects = S3ObjectStore::from_env().await;
        let listener = QueueListener::new(queue, objects, store.clone(), store.path())
            .with_config(&self.listener);
        Some(listener.spawn(cancel))
    }
}
