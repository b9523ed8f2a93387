//! Job intake from the managed queue.

use crate::config::{AckPolicy, QueueConfig};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue receive failed: {0}")]
    Receive(String),
    #[error("Queue delete failed: {0}")]
    Delete(String),
    #[error("Queue visibility change failed: {0}")]
    Visibility(String),
}

/// A raw message as handed out by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub receipt_handle: String,
    pub body: String,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Receives up to `max` messages, hiding them for `visibility_seconds`.
    async fn receive(
        &self,
        max: usize,
        wait_seconds: i32,
        visibility_seconds: i32,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    async fn delete_batch(&self, receipt_handles: &[String]) -> Result<(), QueueError>;

    async fn change_visibility(&self, receipt_handles: &[String], seconds: i32) -> Result<(), QueueError>;
}

/// One unit of work: a user's uploaded photo.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub uid: String,
    pub image_url: String,
    /// The full decoded message body, including fields this worker does not
    /// interpret.
    pub body: Map<String, Value>,
}

impl Job {
    /// Decodes a message body. Bodies that are a JSON string holding JSON are
    /// decoded twice.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut value: Value = serde_json::from_str(raw).ok()?;
        if let Value::String(inner) = &value {
            value = serde_json::from_str(inner).ok()?;
        }
        let Value::Object(body) = value else {
            return None;
        };

        let uid = body.get("uid")?.as_str()?.to_string();
        let image_url = body.get("imageUrl")?.as_str()?.to_string();
        if uid.is_empty() || image_url.is_empty() {
            return None;
        }

        Some(Self {
            uid,
            image_url,
            body,
        })
    }

    /// `<second-to-last>/<last>` path segments of the image URL.
    pub fn object_key(&self) -> Option<String> {
        let mut segments = self.image_url.trim_end_matches('/').rsplit('/');
        let name = segments.next().filter(|s| !s.is_empty())?;
        let parent = segments.next().filter(|s| !s.is_empty())?;
        Some(format!("{parent}/{name}"))
    }

    /// Last path segment of the image URL.
    pub fn file_name(&self) -> Option<&str> {
        self.image_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
    }
}

/// Jobs drained in one receive round together with every receipt handle,
/// malformed messages included.
#[derive(Debug, Default)]
pub struct JobBatch {
    pub jobs: Vec<Job>,
    pub receipts: Vec<String>,
}

impl JobBatch {
    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }
}

pub struct JobSource {
    queue: Arc<dyn MessageQueue>,
    config: QueueConfig,
}

impl JobSource {
    pub fn new(queue: Arc<dyn MessageQueue>, config: QueueConfig) -> Self {
        Self { queue, config }
    }

    pub fn ack_policy(&self) -> AckPolicy {
        self.config.ack_policy
    }

    /// Receives until `batch_size` messages are held or a call returns none.
    /// Depending on the ack policy the batch is deleted right away or hidden
    /// for the processing window.
    pub async fn receive_batch(&self) -> Result<JobBatch, QueueError> {
        let mut batch = JobBatch::default();

        while batch.receipts.len() < self.config.batch_size {
            let messages = self
                .queue
                .receive(
                    self.config.batch_size - batch.receipts.len(),
                    self.config.wait_seconds,
                    self.config.visibility_timeout_seconds,
                )
                .await?;
            if messages.is_empty() {
                break;
            }

            for message in messages {
                match Job::parse(&message.body) {
                    Some(job) => batch.jobs.push(job),
                    None => warn!("Dropping malformed message body: {}", message.body),
                }
                batch.receipts.push(message.receipt_handle);
            }
        }

        if batch.is_empty() {
            return Ok(batch);
        }
        info!(
            "Received {} message(s), {} valid job(s)",
            batch.receipts.len(),
            batch.jobs.len()
        );

        match self.config.ack_policy {
            AckPolicy::OnReceipt => self.queue.delete_batch(&batch.receipts).await?,
            AckPolicy::AfterReconcile => {
                self.queue
                    .change_visibility(&batch.receipts, self.config.processing_visibility_seconds)
                    .await?
            }
        }
        Ok(batch)
    }

    /// Re-hides a deferred batch every half processing window until the
    /// returned lease is dropped. `None` when messages were already deleted.
    pub fn hold(&self, batch: &JobBatch) -> Option<VisibilityLease> {
        if self.config.ack_policy != AckPolicy::AfterReconcile || batch.is_empty() {
            return None;
        }
        let seconds = self.config.processing_visibility_seconds;
        let period = Duration::from_secs(u64::from(seconds.max(2).unsigned_abs() / 2));
        let queue = self.queue.clone();
        let receipts = batch.receipts.clone();

        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticks.tick().await;
                match queue.change_visibility(&receipts, seconds).await {
                    Ok(()) => debug!("Renewed {} message(s) for {seconds}s", receipts.len()),
                    Err(e) => warn!("Could not renew message visibility: {e}"),
                }
            }
        });
        Some(VisibilityLease { task })
    }

    /// Deletes a reconciled batch when acknowledgement was deferred.
    pub async fn acknowledge(&self, batch: &JobBatch) -> Result<(), QueueError> {
        if self.config.ack_policy == AckPolicy::AfterReconcile && !batch.is_empty() {
            self.queue.delete_batch(&batch.receipts).await?;
            debug!("Acknowledged {} message(s)", batch.receipts.len());
        }
        Ok(())
    }
}

/// Background visibility renewal for one in-flight batch.
pub struct VisibilityLease {
    task: JoinHandle<()>,
}

impl Drop for VisibilityLease {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(feature = "queue")]
pub use sqs::SqsQueue;

#[cfg(feature = "queue")]
mod sqs {
    use super::{MessageQueue, QueueError, QueueMessage};
    use async_trait::async_trait;
    use aws_sdk_sqs::types::{ChangeMessageVisibilityBatchRequestEntry, DeleteMessageBatchRequestEntry};
    use aws_sdk_sqs::Client;

    /// Batch calls accept at most this many entries.
    const MAX_BATCH_ENTRIES: usize = 10;

    pub struct SqsQueue {
        client: Client,
        queue_url: String,
    }

    impl SqsQueue {
        pub async fn connect(queue_url: &str, region: &str) -> Self {
            let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_config::Region::new(region.to_string()))
                .load()
                .await;
            Self {
                client: Client::new(&config),
                queue_url: queue_url.to_string(),
            }
        }
    }

    #[async_trait]
    impl MessageQueue for SqsQueue {
        async fn receive(
            &self,
            max: usize,
            wait_seconds: i32,
            visibility_seconds: i32,
        ) -> Result<Vec<QueueMessage>, QueueError> {
            let output = self
                .client
                .receive_message()
                .queue_url(&self.queue_url)
                .max_number_of_messages(max.min(MAX_BATCH_ENTRIES) as i32)
                .wait_time_seconds(wait_seconds)
                .visibility_timeout(visibility_seconds)
                .message_attribute_names("All")
                .send()
                .await
                .map_err(|e| QueueError::Receive(e.to_string()))?;

            Ok(output
                .messages()
                .iter()
                .filter_map(|m| {
                    Some(QueueMessage {
                        receipt_handle: m.receipt_handle()?.to_string(),
                        body: m.body().unwrap_or_default().to_string(),
                    })
                })
                .collect())
        }

        async fn delete_batch(&self, receipt_handles: &[String]) -> Result<(), QueueError> {
            for chunk in receipt_handles.chunks(MAX_BATCH_ENTRIES) {
                let entries = chunk
                    .iter()
                    .enumerate()
                    .map(|(i, handle)| {
                        DeleteMessageBatchRequestEntry::builder()
                            .id(i.to_string())
                            .receipt_handle(handle)
                            .build()
                            .map_err(|e| QueueError::Delete(e.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                let output = self
                    .client
                    .delete_message_batch()
                    .queue_url(&self.queue_url)
                    .set_entries(Some(entries))
                    .send()
                    .await
                    .map_err(|e| QueueError::Delete(e.to_string()))?;

                if let Some(failed) = output.failed().first() {
                    return Err(QueueError::Delete(format!(
                        "{} of {} entries failed, first: {}",
                        output.failed().len(),
                        chunk.len(),
                        failed.message().unwrap_or(failed.code())
                    )));
                }
            }
            Ok(())
        }

        async fn change_visibility(&self, receipt_handles: &[String], seconds: i32) -> Result<(), QueueError> {
            for chunk in receipt_handles.chunks(MAX_BATCH_ENTRIES) {
                let entries = chunk
                    .iter()
                    .enumerate()
                    .map(|(i, handle)| {
                        ChangeMessageVisibilityBatchRequestEntry::builder()
                            .id(i.to_string())
                            .receipt_handle(handle)
                            .visibility_timeout(seconds)
                            .build()
                            .map_err(|e| QueueError::Visibility(e.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                self.client
                    .change_message_visibility_batch()
                    .queue_url(&self.queue_url)
                    .set_entries(Some(entries))
                    .send()
                    .await
                    .map_err(|e| QueueError::Visibility(e.to_string()))?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_util::FakeQueue;

    fn config(batch_size: usize, ack_policy: AckPolicy) -> QueueConfig {
        QueueConfig {
            batch_size,
            ack_policy,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_plain_and_double_encoded() {
        let plain = r#"{"uid":"u1","imageUrl":"https://cdn/x/u1/a.jpg","caption":"hi"}"#;
        let job = Job::parse(plain);
        assert_eq!(job.as_ref().map(|j| j.uid.as_str()), Some("u1"));
        assert_eq!(
            job.as_ref().and_then(|j| j.body.get("caption")).and_then(|v| v.as_str()),
            Some("hi")
        );

        let double = serde_json::to_string(plain).unwrap_or_default();
        assert_eq!(Job::parse(&double), job);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Job::parse("not json").is_none());
        assert!(Job::parse(r#"{"uid":"u1"}"#).is_none());
        assert!(Job::parse(r#"{"uid":"","imageUrl":"a/b"}"#).is_none());
        assert!(Job::parse(r#"["uid","imageUrl"]"#).is_none());
    }

    #[test]
    fn test_object_key_uses_last_two_segments() {
        let job = Job::parse(r#"{"uid":"u","imageUrl":"https://cdn.example.com/uploads/user7/pic.jpg"}"#);
        assert_eq!(job.as_ref().and_then(Job::object_key).as_deref(), Some("user7/pic.jpg"));
        assert_eq!(job.as_ref().and_then(Job::file_name), Some("pic.jpg"));

        let short = Job::parse(r#"{"uid":"u","imageUrl":"pic.jpg"}"#);
        assert_eq!(short.as_ref().and_then(Job::object_key), None);
    }

    #[tokio::test]
    async fn test_receive_accumulates_up_to_batch_size() -> Result<(), QueueError> {
        let queue = Arc::new(FakeQueue::with_bodies(&[
            r#"{"uid":"a","imageUrl":"x/a/1.jpg"}"#,
            r#"{"uid":"b","imageUrl":"x/b/2.jpg"}"#,
            "garbage",
            r#"{"uid":"d","imageUrl":"x/d/4.jpg"}"#,
        ]));
        queue.set_max_per_call(1);
        let source = JobSource::new(queue.clone(), config(3, AckPolicy::OnReceipt));

        let batch = source.receive_batch().await?;
        assert_eq!(batch.receipts.len(), 3);
        assert_eq!(batch.jobs.len(), 2);
        assert_eq!(queue.deleted().len(), 3);
        assert_eq!(queue.pending(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_deferred_ack_hides_then_deletes() -> Result<(), QueueError> {
        let queue = Arc::new(FakeQueue::with_bodies(&[r#"{"uid":"a","imageUrl":"x/a/1.jpg"}"#]));
        let source = JobSource::new(queue.clone(), config(3, AckPolicy::AfterReconcile));

        let batch = source.receive_batch().await?;
        assert_eq!(batch.jobs.len(), 1);
        assert!(queue.deleted().is_empty());
        assert_eq!(queue.visibility_changes(), vec![(1, 900)]);

        source.acknowledge(&batch).await?;
        assert_eq!(queue.deleted().len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_renews_until_dropped() -> Result<(), QueueError> {
        let queue = Arc::new(FakeQueue::with_bodies(&[r#"{"uid":"a","imageUrl":"x/a/1.jpg"}"#]));
        let source = JobSource::new(queue.clone(), config(3, AckPolicy::AfterReconcile));
        let batch = source.receive_batch().await?;

        let lease = source.hold(&batch);
        assert!(lease.is_some());
        tokio::time::sleep(Duration::from_secs(1000)).await;
        assert_eq!(queue.visibility_changes(), vec![(1, 900); 3]);

        drop(lease);
        tokio::time::sleep(Duration::from_secs(2000)).await;
        assert_eq!(queue.visibility_changes().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_hold_is_noop_after_delete_on_receipt() -> Result<(), QueueError> {
        let queue = Arc::new(FakeQueue::with_bodies(&[r#"{"uid":"a","imageUrl":"x/a/1.jpg"}"#]));
        let source = JobSource::new(queue.clone(), config(3, AckPolicy::OnReceipt));
        let batch = source.receive_batch().await?;
        assert!(source.hold(&batch).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_queue() -> Result<(), QueueError> {
        let queue = Arc::new(FakeQueue::with_bodies(&[]));
        let source = JobSource::new(queue.clone(), config(3, AckPolicy::OnReceipt));
        let batch = source.receive_batch().await?;
        assert!(batch.is_empty());
        assert_eq!(queue.receive_calls(), 1);
        assert!(queue.deleted().is_empty());
        Ok(())
    }
}
