use slatedb::WriteBatch;

use crate::codec::member_codec::{encode_queue_member, validate_wire_name, EncodedQueueMember};
use crate::codec::encode_stored_message;
use crate::keys::{message_id_key, message_key};
use crate::message::{EnvironmentType, QueueDescriptor, StoredMessage};

use super::{FairQueue, FairQueueError, WireFormat};

/// One admission request.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub descriptor: QueueDescriptor,
    pub message_id: String,
    pub payload: Vec<u8>,
    pub worker_queue: String,
    pub environment_type: EnvironmentType,
    /// Arrival time override for tests and delayed retries; defaults to now.
    pub timestamp_ms: Option<i64>,
}

impl FairQueue {
    /// Admit one message: the queue member, its stored record, and both index
    /// levels commit in a single batch, so no member is ever visible without
    /// an index entry.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<(), FairQueueError> {
        let mut batch = WriteBatch::new();
        self.stage_enqueue(&mut batch, &request).await?;
        self.db.write(batch).await?;
        Ok(())
    }

    /// Admit several messages in one atomic batch.
    pub async fn enqueue_batch(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<(), FairQueueError> {
        if requests.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for request in &requests {
            self.stage_enqueue(&mut batch, request).await?;
        }
        self.db.write(batch).await?;
        Ok(())
    }

    async fn stage_enqueue(
        &self,
        batch: &mut WriteBatch,
        request: &EnqueueRequest,
    ) -> Result<(), FairQueueError> {
        validate_wire_name(&request.message_id)?;
        validate_wire_name(&request.worker_queue)?;
        validate_wire_name(&request.descriptor.id)?;

        let timestamp_ms = request.timestamp_ms.unwrap_or_else(crate::now_epoch_ms);
        let descriptor = &request.descriptor;

        let member = match self.config.wire_format {
            WireFormat::Legacy => request.message_id.clone(),
            WireFormat::Optimized => encode_queue_member(&EncodedQueueMember {
                run_id: request.message_id.clone(),
                worker_queue: request.worker_queue.clone(),
                attempt: 0,
                environment_type: request.environment_type,
            }),
        };

        let stored = StoredMessage {
            id: request.message_id.clone(),
            queue_id: descriptor.id.clone(),
            tenant_id: descriptor.tenant_id.clone(),
            payload: request.payload.clone(),
            timestamp_ms,
            attempt: 0,
            worker_queue: request.worker_queue.clone(),
            environment_type: request.environment_type,
            metadata: descriptor.metadata.clone(),
        };

        batch.put(
            message_key(
                &descriptor.tenant_id,
                &descriptor.id,
                timestamp_ms,
                &request.message_id,
            )
            .as_bytes(),
            member.as_bytes(),
        );
        batch.put(
            message_id_key(&request.message_id).as_bytes(),
            &encode_stored_message(&stored)?,
        );

        self.ensure_indexed(batch, descriptor, timestamp_ms).await?;

        crate::metrics::MESSAGES_ENQUEUED
            .with_label_values(&[&descriptor.tenant_id])
            .inc();
        tracing::debug!(
            tenant = %descriptor.tenant_id,
            queue = %descriptor.id,
            message_id = %request.message_id,
            "enqueued message"
        );
        Ok(())
    }
}
