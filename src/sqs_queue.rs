use crate::queue::{QueueDepth, ReceivedMessage, SendBatchResult, SendEntry, WorkQueue, SEND_BATCH_LIMIT};
use crate::WarcannonError;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::types::{QueueAttributeName, SendMessageBatchRequestEntry};
use aws_sdk_sqs::Client;
use tracing::warn;

/// SQS-backed work queue.
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    wait_seconds: i32,
}

impl SqsQueue {
    pub async fn connect(queue_url: &str, region: &str) -> Result<Self, WarcannonError> {
        if queue_url.is_empty() {
            return Err(WarcannonError::Config("queue url not set".to_string()));
        }
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Ok(Self {
            client: Client::new(&config),
            queue_url: queue_url.to_string(),
            wait_seconds: 2,
        })
    }

    /// Long-poll duration for receives.
    pub fn with_wait_seconds(mut self, wait_seconds: i32) -> Self {
        self.wait_seconds = wait_seconds.clamp(0, 20);
        self
    }
}

#[async_trait]
impl WorkQueue for SqsQueue {
    async fn receive(&self) -> Result<Option<ReceivedMessage>, WarcannonError> {
        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(self.wait_seconds)
            .send()
            .await
            .map_err(|e| WarcannonError::Queue(format!("SQS receive: {}", e)))?;

        let Some(message) = resp.messages().first() else {
            return Ok(None);
        };
        let receipt_handle = message
            .receipt_handle()
            .ok_or_else(|| WarcannonError::Queue("SQS message without receipt handle".to_string()))?;
        Ok(Some(ReceivedMessage {
            receipt_handle: receipt_handle.to_string(),
            body: message.body().unwrap_or_default().to_string(),
        }))
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), WarcannonError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| WarcannonError::Queue(format!("SQS delete: {}", e)))?;
        Ok(())
    }

    async fn send_batch(&self, entries: Vec<SendEntry>) -> Result<SendBatchResult, WarcannonError> {
        if entries.len() > SEND_BATCH_LIMIT {
            return Err(WarcannonError::Queue(format!(
                "batch of {} exceeds limit {}",
                entries.len(),
                SEND_BATCH_LIMIT
            )));
        }
        let requests = entries
            .into_iter()
            .map(|e| {
                SendMessageBatchRequestEntry::builder()
                    .id(e.id)
                    .message_body(e.body)
                    .build()
                    .map_err(|err| WarcannonError::Queue(format!("SQS entry: {}", err)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let resp = self
            .client
            .send_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(requests))
            .send()
            .await
            .map_err(|e| WarcannonError::Queue(format!("SQS send batch: {}", e)))?;

        let rejected: Vec<String> = resp
            .failed()
            .iter()
            .map(|f| {
                warn!(id = f.id(), code = f.code(), message = ?f.message(), "SQS rejected entry");
                f.id().to_string()
            })
            .collect();
        Ok(SendBatchResult {
            accepted: resp.successful().len(),
            rejected,
        })
    }

    async fn depth(&self) -> Result<QueueDepth, WarcannonError> {
        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| WarcannonError::Queue(format!("SQS attributes: {}", e)))?;

        // A missing count must not read as an empty queue.
        let read = |name: QueueAttributeName| -> Result<u64, WarcannonError> {
            resp.attributes()
                .and_then(|a| a.get(&name))
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| WarcannonError::Queue(format!("SQS attribute {} missing", name.as_str())))
        };
        Ok(QueueDepth {
            visible: read(QueueAttributeName::ApproximateNumberOfMessages)?,
            in_flight: read(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)?,
        })
    }
}
