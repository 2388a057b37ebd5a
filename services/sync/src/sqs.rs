use std::time::Duration;

use crate::error::SyncError;
use crate::queue::{Message, MessageQueue};

/// Amazon SQS queue.
#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    url: String,
}

impl SqsQueue {
    /// Build a client for `url` from the ambient AWS configuration.
    pub async fn from_env(url: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_sqs::Client::new(&config), url)
    }

    /// Poll the queue at `url` with an existing SQS client.
    pub fn new(client: aws_sdk_sqs::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// The queue URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl MessageQueue for SqsQueue {
    fn name(&self) -> &'static str {
        "sqs"
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Message>, SyncError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.url)
            .max_number_of_messages(i32::try_from(max).unwrap_or(10))
            .wait_time_seconds(i32::try_from(wait.as_secs()).unwrap_or(20))
            .send()
            .await
            .map_err(|error| SyncError::Queue {
                operation: "receive",
                source: error.into(),
            })?;

        Ok(output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|message| {
                let Some(receipt) = message.receipt_handle else {
                    tracing::warn!(id = ?message.message_id, "message without receipt handle");
                    return None;
                };
                Some(Message {
                    id: message.message_id.unwrap_or_default(),
                    receipt,
                    body: message.body.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn delete(&self, receipt: &str) -> Result<(), SyncError> {
        self.client
            .delete_message()
            .queue_url(&self.url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|error| SyncError::Queue {
                operation: "delete",
                source: error.into(),
            })?;
        Ok(())
    }
}
