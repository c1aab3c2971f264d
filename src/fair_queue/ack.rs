use slatedb::WriteBatch;

use crate::codec::member_codec::{encode_queue_member, EncodedQueueMember};
use crate::codec::encode_stored_message;
use crate::keys::{message_id_key, message_key};
use crate::message::QueueDescriptor;

use super::{FairQueue, FairQueueError, WireFormat};

/// Result of a nack attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Message re-queued for redelivery at the requested time.
    Requeued,
    /// No stored record exists for the id; nothing to requeue.
    Unknown,
}

impl FairQueue {
    /// Terminal completion: release every concurrency slot and delete the
    /// stored record. Silently a no-op for the record when none exists,
    /// which covers entries that never had one (migration drains).
    pub async fn acknowledge_message(
        &self,
        descriptor: &QueueDescriptor,
        message_id: &str,
    ) -> Result<(), FairQueueError> {
        let mut batch = WriteBatch::new();
        let released = self
            .concurrency
            .release(&mut batch, descriptor, message_id)
            .await?;
        batch.delete(message_id_key(message_id).as_bytes());

        if let Err(e) = self.db.write(batch).await {
            self.concurrency.rollback_release(&released, message_id);
            return Err(e.into());
        }

        crate::metrics::MESSAGES_ACKNOWLEDGED
            .with_label_values(&[&descriptor.tenant_id])
            .inc();
        tracing::debug!(
            tenant = %descriptor.tenant_id,
            queue = %descriptor.id,
            message_id = %message_id,
            "acknowledged message"
        );
        Ok(())
    }

    /// Failed attempt: bump the attempt counter, re-insert the member with
    /// score `retry_at_ms`, release the concurrency slots, and re-populate
    /// the indexes in case the queue had drained.
    pub async fn nack_message(
        &self,
        descriptor: &QueueDescriptor,
        message_id: &str,
        retry_at_ms: i64,
    ) -> Result<NackOutcome, FairQueueError> {
        let Some(mut stored) = self.read_message(message_id).await? else {
            // Still release: the slot must not leak when the record is gone.
            let mut batch = WriteBatch::new();
            let released = self
                .concurrency
                .release(&mut batch, descriptor, message_id)
                .await?;
            if let Err(e) = self.db.write(batch).await {
                self.concurrency.rollback_release(&released, message_id);
                return Err(e.into());
            }
            return Ok(NackOutcome::Unknown);
        };

        stored.attempt += 1;
        stored.timestamp_ms = retry_at_ms;

        let member = match self.config.wire_format {
            WireFormat::Legacy => message_id.to_string(),
            WireFormat::Optimized => encode_queue_member(&EncodedQueueMember {
                run_id: stored.id.clone(),
                worker_queue: stored.worker_queue.clone(),
                attempt: stored.attempt,
                environment_type: stored.environment_type,
            }),
        };

        let mut batch = WriteBatch::new();
        let released = self
            .concurrency
            .release(&mut batch, descriptor, message_id)
            .await?;
        batch.put(
            message_key(
                &descriptor.tenant_id,
                &descriptor.id,
                retry_at_ms,
                message_id,
            )
            .as_bytes(),
            member.as_bytes(),
        );
        batch.put(
            message_id_key(message_id).as_bytes(),
            &encode_stored_message(&stored)?,
        );
        self.ensure_indexed(&mut batch, descriptor, retry_at_ms).await?;

        if let Err(e) = self.db.write(batch).await {
            self.concurrency.rollback_release(&released, message_id);
            return Err(e.into());
        }

        crate::metrics::MESSAGES_NACKED
            .with_label_values(&[&descriptor.tenant_id])
            .inc();
        tracing::debug!(
            tenant = %descriptor.tenant_id,
            queue = %descriptor.id,
            message_id = %message_id,
            attempt = stored.attempt,
            retry_at_ms,
            "nacked message"
        );
        Ok(NackOutcome::Requeued)
    }
}
