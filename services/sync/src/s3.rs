use aws_sdk_s3::operation::get_object::GetObjectError;
use tokio::io;

use crate::error::SyncError;
use crate::location::ObjectLocation;
use crate::object::{ObjectStore, Writer};

/// Object store backed by Amazon S3.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    /// Build a client from the ambient AWS configuration (environment,
    /// profile, or instance metadata).
    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config))
    }

    /// Wrap an existing S3 client.
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    fn name(&self) -> &'static str {
        "s3"
    }

    #[tracing::instrument(skip(self, location, writer), fields(%location))]
    async fn download(
        &self,
        location: &ObjectLocation,
        writer: &mut Writer<'_>,
    ) -> Result<u64, SyncError> {
        let failed = |source: crate::error::BoxError| SyncError::Download {
            engine: "s3",
            bucket: location.bucket.clone(),
            key: location.key.clone(),
            source,
        };

        let object = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|error| match error.into_service_error() {
                GetObjectError::NoSuchKey(_) => SyncError::ObjectNotFound {
                    bucket: location.bucket.clone(),
                    key: location.key.clone(),
                },
                other => failed(other.into()),
            })?;

        let body = object.body.into_async_read();
        tokio::pin!(body);
        let written = io::copy(&mut body, writer)
            .await
            .map_err(|error| failed(error.into()))?;
        tracing::trace!(bytes = written, "copied object body");
        Ok(written)
    }
}
