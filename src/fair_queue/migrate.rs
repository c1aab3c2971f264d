use std::str;

use slatedb::{DbIterator, WriteBatch};

use crate::codec::decode_stored_message;
use crate::keys::{end_bound, master_queue_prefix};
use crate::message::QueueDescriptor;

use super::{EnqueueRequest, FairQueue, FairQueueError};

impl FairQueue {
    /// Opportunistically drain the pre-migration single-level master queue,
    /// feeding discovered entries through the current enqueue path so
    /// messages written before the two-level index deploy are not stranded.
    ///
    /// Malformed entries are deleted and logged rather than retried forever.
    pub async fn drain_legacy_master_queue(&self, max: usize) -> Result<usize, FairQueueError> {
        let prefix = master_queue_prefix();
        let end = end_bound(&prefix);
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(prefix.into_bytes()..end).await?;

        let mut drained = 0;
        while drained < max {
            let Some(kv) = iter.next().await? else { break };
            let key = kv.key.to_vec();

            match decode_stored_message(&kv.value) {
                Ok(stored) => {
                    let mut descriptor =
                        QueueDescriptor::new(&stored.queue_id, &stored.tenant_id);
                    descriptor.metadata = stored.metadata.clone();
                    self.enqueue(EnqueueRequest {
                        descriptor,
                        message_id: stored.id.clone(),
                        payload: stored.payload.clone(),
                        worker_queue: stored.worker_queue.clone(),
                        environment_type: stored.environment_type,
                        timestamp_ms: Some(stored.timestamp_ms),
                    })
                    .await?;
                    drained += 1;
                }
                Err(e) => {
                    let key_str = str::from_utf8(&key).unwrap_or("<non-utf8>");
                    tracing::warn!(key = %key_str, error = %e, "dropping malformed master-queue entry");
                }
            }

            let mut batch = WriteBatch::new();
            batch.delete(&key);
            self.db.write(batch).await?;
        }

        if drained > 0 {
            tracing::info!(drained, "drained legacy master queue entries");
        }
        Ok(drained)
    }
}
