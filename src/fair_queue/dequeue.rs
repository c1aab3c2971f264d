use std::time::Duration;

use slatedb::WriteBatch;
use tokio::time::Instant;

use crate::codec::member_codec::{decode_worker_queue_entry, WorkerQueueEntry};
use crate::message::StoredMessage;

use super::{FairQueue, FairQueueError};

/// A message delivered to a worker.
#[derive(Debug, Clone)]
pub struct DequeuedMessage {
    pub message_id: String,
    pub entry: WorkerQueueEntry,
    /// The stored record, when one exists. Entries drained from the legacy
    /// master queue may arrive without one.
    pub message: Option<StoredMessage>,
}

impl FairQueue {
    /// Blocking pop from one worker queue, bounded by `timeout`. Returns
    /// `None` when the timeout elapses with no deliverable entry.
    ///
    /// Accepts both wire encodings from the same queue, so consumers keep
    /// draining entries written before a format migration.
    pub async fn dequeue_message_from_worker_queue(
        &self,
        consumer_id: &str,
        worker_queue: &str,
        timeout: Duration,
    ) -> Result<Option<DequeuedMessage>, FairQueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(entry) = self.broker.claim_one(worker_queue) {
                // Durable removal before delivery: once this commits, no
                // other process can claim the same entry.
                let mut batch = WriteBatch::new();
                batch.delete(entry.key.as_bytes());
                if let Err(e) = self.db.write(batch).await {
                    self.broker.requeue(entry);
                    return Err(e.into());
                }
                self.broker.ack_durable(&entry.key);

                let decoded = match decode_worker_queue_entry(&entry.raw) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        tracing::warn!(
                            consumer_id = %consumer_id,
                            worker_queue = %worker_queue,
                            error = %e,
                            "skipping malformed worker-queue entry"
                        );
                        continue;
                    }
                };

                let message_id = decoded.run_id().to_string();
                let message = self.read_message(&message_id).await?;

                tracing::debug!(
                    consumer_id = %consumer_id,
                    worker_queue = %worker_queue,
                    message_id = %message_id,
                    "dequeued message"
                );
                return Ok(Some(DequeuedMessage {
                    message_id,
                    entry: decoded,
                    message,
                }));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.broker.wakeup();
            tokio::time::sleep(Duration::from_millis(self.config.dequeue_poll_interval_ms)).await;
        }
    }
}
