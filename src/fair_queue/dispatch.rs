use std::str;

use slatedb::{DbIterator, WriteBatch};

use crate::codec::member_codec::{
    decode_queue_member, encode_worker_queue_entry, EncodedWorkerQueueEntry, QueueMember,
};
use crate::concurrency::{Capacity, TENANT_GROUP};
use crate::keys::{
    dispatch_shard_prefix, end_bound, message_queue_prefix, parse_score_after_prefix,
    tenant_queue_prefix, worker_queue_key, DISPATCH_SHARD_COUNT,
};
use crate::message::QueueDescriptor;
use crate::scheduler::{DispatchPlan, QueueCandidate, TenantCandidate};

use super::{FairQueue, FairQueueError};

/// Result of one dispatch round over a parent queue shard.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    /// Message ids moved onto worker queues, in dispatch order.
    pub dispatched: Vec<String>,
    /// Tenants skipped because every group was at capacity.
    pub blocked_tenants: Vec<String>,
}

impl FairQueue {
    /// Produce the DRR-ordered plan for one consumer poll of one dispatch
    /// shard, without moving anything.
    pub async fn distribute_fair_queues_from_parent_queue(
        &self,
        shard: u32,
        consumer_id: &str,
    ) -> Result<DispatchPlan, FairQueueError> {
        let candidates = self.build_candidates(shard).await?;
        Ok(self
            .scheduler
            .plan_round(&dispatch_shard_prefix(shard), consumer_id, candidates))
    }

    /// One full dispatch round: plan the shard, then move members from each
    /// planned queue onto their worker queues, honoring concurrency.
    pub async fn process_parent_queue(
        &self,
        shard: u32,
        consumer_id: &str,
    ) -> Result<DispatchOutcome, FairQueueError> {
        let plan = self
            .distribute_fair_queues_from_parent_queue(shard, consumer_id)
            .await?;

        let mut outcome = DispatchOutcome::default();
        for entry in plan.entries {
            let mut tenant_moved = false;
            for queue_id in &entry.queue_ids {
                let descriptor = self
                    .load_descriptor(&entry.tenant_id, queue_id)
                    .await?
                    .unwrap_or_else(|| QueueDescriptor::new(queue_id, &entry.tenant_id));
                let moved = self
                    .dequeue_from_queue(&descriptor, self.config.dispatch_batch_size)
                    .await?;
                tenant_moved |= !moved.is_empty();
                outcome.dispatched.extend(moved);
            }
            if !tenant_moved {
                outcome.blocked_tenants.push(entry.tenant_id);
            }
        }

        if !outcome.dispatched.is_empty() {
            self.broker.wakeup();
        }
        Ok(outcome)
    }

    /// Run one dispatch round over every shard. Convenience for single
    /// dispatcher deployments and tests.
    pub async fn process_all_shards(
        &self,
        consumer_id: &str,
    ) -> Result<DispatchOutcome, FairQueueError> {
        let mut outcome = DispatchOutcome::default();
        for shard in 0..DISPATCH_SHARD_COUNT {
            let shard_outcome = self.process_parent_queue(shard, consumer_id).await?;
            outcome.dispatched.extend(shard_outcome.dispatched);
            outcome.blocked_tenants.extend(shard_outcome.blocked_tenants);
        }
        Ok(outcome)
    }

    /// Move up to `max` members from the head of one queue onto their worker
    /// queues. Stops early when the queue's concurrency groups fill up.
    pub async fn dequeue_from_queue(
        &self,
        descriptor: &QueueDescriptor,
        max: usize,
    ) -> Result<Vec<String>, FairQueueError> {
        let mut moved = Vec::new();

        for _ in 0..max {
            let Some((member_key, raw_member)) = self.peek_oldest_member(descriptor).await? else {
                break;
            };
            let member = decode_queue_member(&raw_member)?;
            let message_id = member.run_id().to_string();

            let now = crate::now_epoch_ms();
            let mut batch = WriteBatch::new();
            if !self
                .concurrency
                .reserve(&mut batch, descriptor, &message_id, now)
                .await?
            {
                break; // queue blocked, leave remaining members in place
            }

            // Resolve the worker queue and attempt for the outgoing entry.
            let worker_entry = match &member {
                QueueMember::Optimized(m) => {
                    let mut fields = EncodedWorkerQueueEntry {
                        run_id: m.run_id.clone(),
                        worker_queue: m.worker_queue.clone(),
                        attempt: m.attempt,
                        environment_type: m.environment_type,
                        queue_key: descriptor.id.clone(),
                        timestamp_ms: now,
                    };
                    // Nack bumps the stored record; carry the latest attempt.
                    if let Some(stored) = self.read_message(&message_id).await? {
                        fields.attempt = stored.attempt;
                    }
                    (fields.worker_queue.clone(), encode_worker_queue_entry(&fields))
                }
                QueueMember::Legacy(run_id) => {
                    let Some(stored) = self.read_message(&message_id).await? else {
                        // Stranded legacy member with no record: drop it.
                        tracing::warn!(
                            tenant = %descriptor.tenant_id,
                            queue = %descriptor.id,
                            message_id = %message_id,
                            "dropping legacy member without a stored record"
                        );
                        self.concurrency.rollback_reserve(descriptor, &message_id);
                        let mut drop_batch = WriteBatch::new();
                        drop_batch.delete(member_key.as_bytes());
                        self.db.write(drop_batch).await?;
                        continue;
                    };
                    (stored.worker_queue.clone(), run_id.clone())
                }
            };

            let seq = self
                .worker_seq
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            batch.delete(member_key.as_bytes());
            batch.put(
                worker_queue_key(&worker_entry.0, now, seq).as_bytes(),
                worker_entry.1.as_bytes(),
            );

            if let Err(e) = self.db.write(batch).await {
                self.concurrency.rollback_reserve(descriptor, &message_id);
                return Err(e.into());
            }

            crate::metrics::MESSAGES_DISPATCHED
                .with_label_values(&[&descriptor.tenant_id])
                .inc();
            let prefix = message_queue_prefix(&descriptor.tenant_id, &descriptor.id);
            if let Some(enqueued_ms) = parse_score_after_prefix(&member_key, &prefix) {
                let waited = ((now - enqueued_ms).max(0) as f64) / 1000.0;
                crate::metrics::QUEUE_WAIT_TIME.observe(waited);
            }
            moved.push(message_id);
        }

        if !moved.is_empty() {
            self.trim_if_drained(descriptor).await?;
        }
        Ok(moved)
    }

    /// Oldest member of one queue, by score order.
    async fn peek_oldest_member(
        &self,
        descriptor: &QueueDescriptor,
    ) -> Result<Option<(String, String)>, FairQueueError> {
        let prefix = message_queue_prefix(&descriptor.tenant_id, &descriptor.id);
        let end = end_bound(&prefix);
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(prefix.into_bytes()..end).await?;
        let Some(kv) = iter.next().await? else {
            return Ok(None);
        };
        let Ok(key) = str::from_utf8(&kv.key) else {
            return Ok(None);
        };
        let Ok(value) = str::from_utf8(&kv.value) else {
            return Ok(None);
        };
        Ok(Some((key.to_string(), value.to_string())))
    }

    /// Rebuild the descriptor a dequeued queue was enqueued with, so group
    /// extraction sees the same metadata. Falls back to the bare identity if
    /// the queue has no readable members.
    async fn load_descriptor(
        &self,
        tenant: &str,
        queue: &str,
    ) -> Result<Option<QueueDescriptor>, FairQueueError> {
        let probe = QueueDescriptor::new(queue, tenant);
        let Some((_, raw)) = self.peek_oldest_member(&probe).await? else {
            return Ok(None);
        };
        let member = decode_queue_member(&raw)?;
        let Some(stored) = self.read_message(member.run_id()).await? else {
            return Ok(Some(probe));
        };
        let mut descriptor = QueueDescriptor::new(queue, tenant);
        descriptor.metadata = stored.metadata;
        Ok(Some(descriptor))
    }

    /// Snapshot every tenant with due work in one shard, with the
    /// concurrency state the scheduler weighs.
    pub(crate) async fn build_candidates(
        &self,
        shard: u32,
    ) -> Result<Vec<TenantCandidate>, FairQueueError> {
        let now = crate::now_epoch_ms();
        let prefix = dispatch_shard_prefix(shard);
        let end = end_bound(&prefix);
        let mut iter: DbIterator = self
            .db
            .scan::<Vec<u8>, _>(prefix.clone().into_bytes()..end)
            .await?;

        let limit = self.scheduler.config().parent_queue_limit;
        let mut tenants: Vec<(String, i64)> = Vec::new();
        while tenants.len() < limit {
            let Some(kv) = iter.next().await? else { break };
            let Ok(key) = str::from_utf8(&kv.key) else {
                continue;
            };
            let Some(score) = parse_score_after_prefix(key, &prefix) else {
                continue;
            };
            if score > now {
                break; // score order, nothing further is due
            }
            let tenant = crate::keys::last_segment(key).to_string();
            tenants.push((tenant, score));
        }

        let tenant_gated = self
            .concurrency
            .group_names()
            .iter()
            .any(|g| g == TENANT_GROUP);

        let mut candidates = Vec::with_capacity(tenants.len());
        for (tenant_id, oldest_score_ms) in tenants {
            let (concurrency_limit, available_capacity) = if tenant_gated {
                let state = self.concurrency.get_state(TENANT_GROUP, &tenant_id).await?;
                (
                    state.limit,
                    Capacity::Available(state.limit.saturating_sub(state.current)),
                )
            } else {
                (0, Capacity::Unbounded)
            };
            let queues = self.tenant_queues(&tenant_id).await?;
            candidates.push(TenantCandidate {
                tenant_id,
                oldest_score_ms,
                concurrency_limit,
                available_capacity,
                queues,
            });
        }
        Ok(candidates)
    }

    async fn tenant_queues(
        &self,
        tenant: &str,
    ) -> Result<Vec<QueueCandidate>, FairQueueError> {
        let prefix = tenant_queue_prefix(tenant);
        let end = end_bound(&prefix);
        let mut iter: DbIterator = self
            .db
            .scan::<Vec<u8>, _>(prefix.clone().into_bytes()..end)
            .await?;

        let mut queues = Vec::new();
        loop {
            let Some(kv) = iter.next().await? else { break };
            let Ok(key) = str::from_utf8(&kv.key) else {
                continue;
            };
            let Some(score_ms) = parse_score_after_prefix(key, &prefix) else {
                continue;
            };
            queues.push(QueueCandidate {
                queue_id: crate::keys::last_segment(key).to_string(),
                score_ms,
            });
        }
        Ok(queues)
    }
}
