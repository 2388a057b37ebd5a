//! Error types for the sync pipeline

use camino::Utf8PathBuf;

/// A boxed error from an external client.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while moving a registry snapshot from object storage to disk.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The object reference is not one of the supported shapes.
    #[error("invalid object reference {reference:?}: {reason}")]
    InvalidReference {
        /// The reference as received.
        reference: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// The queue message body could not be decoded.
    #[error("malformed queue message: {0}")]
    Message(#[source] serde_json::Error),

    /// The referenced object does not exist.
    #[error("object s3://{bucket}/{key} not found")]
    ObjectNotFound {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },

    /// The object store failed to serve the object.
    #[error("{engine} download of s3://{bucket}/{key} failed")]
    Download {
        /// Object store name.
        engine: &'static str,
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying client error.
        #[source]
        source: BoxError,
    },

    /// Writing the downloaded object to disk failed.
    #[error("writing {path}")]
    Io {
        /// The file being written.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The message queue rejected a call.
    #[error("queue {operation} failed")]
    Queue {
        /// The queue operation, `receive` or `delete`.
        operation: &'static str,
        /// Underlying client error.
        #[source]
        source: BoxError,
    },

    /// The store could not load the downloaded snapshot.
    #[error("reload failed")]
    Reload(#[source] BoxError),
}

impl SyncError {
    pub(crate) fn invalid(reference: &str, reason: &'static str) -> Self {
        SyncError::InvalidReference {
            reference: reference.to_owned(),
            reason,
        }
    }

    pub(crate) fn io(path: impl Into<Utf8PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| SyncError::Io { path, source }
    }

    /// Whether the failure is a property of the message itself, so that
    /// redelivery cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidReference { .. } | SyncError::Message(_)
        )
    }
}

impl From<store::StoreError> for SyncError {
    fn from(error: store::StoreError) -> Self {
        SyncError::Reload(Box::new(error))
    }
}
