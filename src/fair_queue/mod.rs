//! The queueing engine: durable per-tenant queues, a two-level dispatch
//! index, DRR-ordered dispatch onto worker queues, and at-least-once worker
//! delivery.
//!
//! Layout:
//! - `enqueue`: admission and index maintenance
//! - `dispatch`: DRR planning and queue-to-worker-queue movement
//! - `dequeue`: blocking pop from worker queues
//! - `ack`: acknowledge and nack
//! - `migrate`: opportunistic drain of the pre-migration master queue
//! - `broker`: in-memory worker-queue buffer fed by a background scanner
//!
//! One process owns dispatch for its shards at a time (leader-elected by the
//! embedding service); within that process, write batches plus the
//! concurrency manager's mutex give check-and-commit atomicity. In-memory
//! state is updated before durable writes and rolled back on write failure.

mod ack;
pub mod broker;
mod dequeue;
mod dispatch;
mod enqueue;
mod migrate;

pub use ack::NackOutcome;
pub use dequeue::DequeuedMessage;
pub use dispatch::DispatchOutcome;
pub use enqueue::EnqueueRequest;

use std::str;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use slatedb::{Db, DbIterator, WriteBatch};

use crate::codec::{decode_stored_message, CodecError};
use crate::concurrency::{ConcurrencyError, ConcurrencyManager};
use crate::keys::{
    dispatch_key, dispatch_member_key, dispatch_shard_for_tenant, end_bound, message_id_key,
    message_queue_prefix, tenant_queue_key, tenant_queue_member_key, tenant_queue_prefix,
};
use crate::message::{QueueDescriptor, StoredMessage};
use crate::scheduler::DrrScheduler;
use broker::WorkerQueueBroker;

#[derive(Debug, thiserror::Error)]
pub enum FairQueueError {
    #[error(transparent)]
    Slate(#[from] slatedb::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
    #[error("queue engine is stopped")]
    Stopped,
}

/// Which wire encoding newly enqueued members use. Decoding always accepts
/// both, so queues carry mixed encodings safely during a migration window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Legacy,
    Optimized,
}

#[derive(Debug, Clone)]
pub struct FairQueueConfig {
    pub wire_format: WireFormat,
    /// Poll interval while blocked on an empty worker queue.
    pub dequeue_poll_interval_ms: u64,
    /// Members moved per queue per dispatch round.
    pub dispatch_batch_size: usize,
}

impl Default for FairQueueConfig {
    fn default() -> Self {
        Self {
            wire_format: WireFormat::Optimized,
            dequeue_poll_interval_ms: 10,
            dispatch_batch_size: 10,
        }
    }
}

pub struct FairQueue {
    pub(crate) db: Arc<Db>,
    pub(crate) concurrency: Arc<ConcurrencyManager>,
    pub(crate) scheduler: DrrScheduler,
    pub(crate) broker: Arc<WorkerQueueBroker>,
    pub(crate) config: FairQueueConfig,
    pub(crate) worker_seq: AtomicU64,
    started: AtomicBool,
}

impl FairQueue {
    pub fn new(
        db: Arc<Db>,
        concurrency: Arc<ConcurrencyManager>,
        scheduler: DrrScheduler,
        config: FairQueueConfig,
    ) -> Arc<Self> {
        let broker = WorkerQueueBroker::new(Arc::clone(&db));
        Arc::new(Self {
            db,
            concurrency,
            scheduler,
            broker,
            config,
            worker_seq: AtomicU64::new(0),
            started: AtomicBool::new(false),
        })
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyManager> {
        &self.concurrency
    }

    pub fn scheduler(&self) -> &DrrScheduler {
        &self.scheduler
    }

    /// Start the worker-queue broker. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker.start();
    }

    /// Stop background work. Buffered but unclaimed entries stay durable and
    /// are redelivered after a restart.
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        tracing::debug!(
            buffered = self.broker.buffer_len(),
            inflight = self.broker.inflight_len(),
            "stopping worker-queue broker"
        );
        self.broker.stop();
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub async fn message_exists(&self, message_id: &str) -> Result<bool, FairQueueError> {
        Ok(self
            .db
            .get(message_id_key(message_id).as_bytes())
            .await?
            .is_some())
    }

    pub async fn read_message(
        &self,
        message_id: &str,
    ) -> Result<Option<StoredMessage>, FairQueueError> {
        let Some(bytes) = self.db.get(message_id_key(message_id).as_bytes()).await? else {
            return Ok(None);
        };
        Ok(Some(decode_stored_message(&bytes)?))
    }

    /// Count of pending members in one queue.
    pub async fn queue_length(
        &self,
        descriptor: &QueueDescriptor,
    ) -> Result<u64, FairQueueError> {
        let prefix = message_queue_prefix(&descriptor.tenant_id, &descriptor.id);
        let end = end_bound(&prefix);
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(prefix.into_bytes()..end).await?;
        let mut count = 0u64;
        while iter.next().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Index maintenance
    // -----------------------------------------------------------------------

    /// Add the queue to the tenant-queue index and the tenant to its dispatch
    /// shard, unless already present. Existing entries keep their (older)
    /// score so index order tracks oldest pending work.
    pub(crate) async fn ensure_indexed(
        &self,
        batch: &mut WriteBatch,
        descriptor: &QueueDescriptor,
        score_ms: i64,
    ) -> Result<(), FairQueueError> {
        let tenant = &descriptor.tenant_id;
        let queue = &descriptor.id;

        let tqm = tenant_queue_member_key(tenant, queue);
        if self.db.get(tqm.as_bytes()).await?.is_none() {
            let score = format!("{:020}", score_ms.max(0) as u64);
            batch.put(
                tenant_queue_key(tenant, score_ms, queue).as_bytes(),
                &[] as &[u8],
            );
            batch.put(tqm.as_bytes(), score.as_bytes());
        }

        let shard = dispatch_shard_for_tenant(tenant);
        let dim = dispatch_member_key(shard, tenant);
        if self.db.get(dim.as_bytes()).await?.is_none() {
            let score = format!("{:020}", score_ms.max(0) as u64);
            batch.put(dispatch_key(shard, score_ms, tenant).as_bytes(), &[] as &[u8]);
            batch.put(dim.as_bytes(), score.as_bytes());
        }
        Ok(())
    }

    /// Conditionally remove a drained queue from the indexes: re-check
    /// emptiness after the member removals committed, so a concurrent
    /// enqueue that raced the drain keeps its index entry.
    pub(crate) async fn trim_if_drained(
        &self,
        descriptor: &QueueDescriptor,
    ) -> Result<(), FairQueueError> {
        let tenant = &descriptor.tenant_id;
        let queue = &descriptor.id;

        let prefix = message_queue_prefix(tenant, queue);
        let end = end_bound(&prefix);
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(prefix.into_bytes()..end).await?;
        if iter.next().await?.is_some() {
            return Ok(()); // not drained
        }

        let mut batch = WriteBatch::new();
        let tqm = tenant_queue_member_key(tenant, queue);
        if let Some(score_bytes) = self.db.get(tqm.as_bytes()).await? {
            if let Ok(score_str) = str::from_utf8(&score_bytes) {
                batch.delete(format!("tq/{}/{}/{}", tenant, score_str, queue).as_bytes());
            }
            batch.delete(tqm.as_bytes());
        }
        self.db.write(batch).await?;

        // Tenant-level trim: only when the last queue left the index.
        let tq_prefix = tenant_queue_prefix(tenant);
        let tq_end = end_bound(&tq_prefix);
        let mut iter: DbIterator = self
            .db
            .scan::<Vec<u8>, _>(tq_prefix.into_bytes()..tq_end)
            .await?;
        if iter.next().await?.is_some() {
            return Ok(());
        }

        let shard = dispatch_shard_for_tenant(tenant);
        let dim = dispatch_member_key(shard, tenant);
        if let Some(score_bytes) = self.db.get(dim.as_bytes()).await? {
            let mut batch = WriteBatch::new();
            if let Ok(score_str) = str::from_utf8(&score_bytes) {
                batch.delete(format!("dispatch/{:03}/{}/{}", shard, score_str, tenant).as_bytes());
            }
            batch.delete(dim.as_bytes());
            self.db.write(batch).await?;
        }
        Ok(())
    }
}
