//! Two-phase batch ingestion with fair consumption.
//!
//! `initialize_batch` stores immutable metadata and the remaining-item
//! counter; `enqueue_batch_item` is idempotent per (batch, index) via a
//! set-if-absent marker and places the item on the per-environment fair
//! queue, sharing DRR scheduling and concurrency accounting with the main
//! run queue. A consumer pool (explicitly started) drains items, runs the
//! injected processor, and fires the completion callback exactly once when
//! the counter reaches zero.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slatedb::{Db, DbIterator, WriteBatch};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::codec::{
    decode_batch_item, decode_batch_meta, decode_batch_outcome, decode_batch_remaining,
    encode_batch_item, encode_batch_meta, encode_batch_outcome, encode_batch_remaining,
};
use crate::fair_queue::{EnqueueRequest, FairQueue, FairQueueError};
use crate::keys::{
    batch_item_marker_key, batch_meta_key, batch_remaining_key, batch_result_key,
    batch_result_prefix, batch_transient_prefixes, end_bound,
};
use crate::message::{BatchItem, BatchItemOutcome, BatchMeta, BatchRemaining, QueueDescriptor};

/// Error code recorded when the processor itself fails rather than
/// returning a failure outcome.
pub const UNEXPECTED_ERROR_CODE: &str = "UNEXPECTED_ERROR";

/// Worker queue all batch items are delivered on.
const BATCH_WORKER_QUEUE: &str = "batch";

#[derive(Debug, thiserror::Error)]
pub enum BatchQueueError {
    #[error(transparent)]
    Slate(#[from] slatedb::Error),
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),
    #[error(transparent)]
    Queue(#[from] FairQueueError),
    #[error("batch {0} has not been initialized")]
    UnknownBatch(String),
}

/// Outcome the processor returns for one item.
#[derive(Debug, Clone)]
pub enum ItemResult {
    Success { run_id: String },
    Failure { error: String, error_code: String },
}

/// Aggregated result passed to the completion callback, exactly once per
/// batch. `run_ids` preserve item-index order regardless of processing
/// completion order.
#[derive(Debug, Clone)]
pub struct CompleteBatchResult {
    pub batch_id: String,
    pub successful_run_count: u32,
    pub failed_run_count: u32,
    pub run_ids: Vec<String>,
    pub failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Clone)]
pub struct BatchItemFailure {
    pub index: u32,
    pub error: String,
    pub error_code: String,
    pub task_identifier: String,
}

/// Application-side processing, injected by the embedding service.
#[async_trait]
pub trait BatchItemProcessor: Send + Sync {
    /// Process one item, usually by creating a run. Errors are captured and
    /// recorded as failures with [`UNEXPECTED_ERROR_CODE`], never propagated.
    async fn on_process_item(
        &self,
        batch_id: &str,
        item_index: u32,
        item: &BatchItem,
        meta: &BatchMeta,
    ) -> anyhow::Result<ItemResult>;

    async fn on_batch_complete(&self, result: CompleteBatchResult);
}

pub struct BatchQueue {
    db: Arc<Db>,
    queue: Arc<FairQueue>,
    processor: Arc<dyn BatchItemProcessor>,
    consumer_count: usize,
    poll_timeout: Duration,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    // Serializes decrement-and-maybe-complete across in-process consumers.
    completion: Arc<Mutex<()>>,
}

impl BatchQueue {
    pub fn new(
        db: Arc<Db>,
        queue: Arc<FairQueue>,
        processor: Arc<dyn BatchItemProcessor>,
        consumer_count: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            queue,
            processor,
            consumer_count: consumer_count.max(1),
            poll_timeout: Duration::from_millis(200),
            running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
            completion: Arc::new(Mutex::new(())),
        })
    }

    /// Store immutable batch metadata and arm the remaining counter.
    pub async fn initialize_batch(&self, meta: BatchMeta) -> Result<(), BatchQueueError> {
        let mut batch = WriteBatch::new();
        batch.put(
            batch_meta_key(&meta.batch_id).as_bytes(),
            &encode_batch_meta(&meta)?,
        );
        batch.put(
            batch_remaining_key(&meta.batch_id).as_bytes(),
            &encode_batch_remaining(&BatchRemaining {
                remaining: meta.run_count,
            })?,
        );
        self.db.write(batch).await?;
        tracing::debug!(batch_id = %meta.batch_id, run_count = meta.run_count, "initialized batch");
        Ok(())
    }

    /// Idempotent per (batch, index): the first call enqueues and returns
    /// `true`, any repeat is a no-op returning `false`.
    pub async fn enqueue_batch_item(
        &self,
        batch_id: &str,
        environment_id: &str,
        item_index: u32,
        item: BatchItem,
    ) -> Result<bool, BatchQueueError> {
        let meta = self.read_meta(batch_id).await?;

        let marker = batch_item_marker_key(batch_id, item_index);
        if self.db.get(marker.as_bytes()).await?.is_some() {
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        batch.put(marker.as_bytes(), &[] as &[u8]);
        self.db.write(batch).await?;

        self.queue
            .enqueue(EnqueueRequest {
                descriptor: QueueDescriptor::new(batch_queue_id(batch_id), environment_id),
                message_id: item_message_id(batch_id, item_index),
                payload: encode_batch_item(&item)?,
                worker_queue: BATCH_WORKER_QUEUE.to_string(),
                environment_type: meta.environment_type,
                timestamp_ms: None,
            })
            .await?;
        Ok(true)
    }

    /// Start the consumer pool. Items enqueued before this accumulate
    /// without being processed. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.start();

        for consumer in 0..self.consumer_count {
            let this = Arc::clone(self);
            let consumer_id = format!("batch-consumer-{}", consumer);
            let handle = tokio::spawn(async move {
                while this.running.load(Ordering::SeqCst) {
                    if let Err(e) = this.consume_once(&consumer_id).await {
                        tracing::error!(consumer_id = %consumer_id, error = %e, "batch consumer iteration failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            });
            self.handles.try_lock().map(|mut h| h.push(handle)).ok();
        }
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().await;
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn consume_once(&self, consumer_id: &str) -> Result<(), BatchQueueError> {
        self.queue.process_all_shards(consumer_id).await?;

        let Some(delivered) = self
            .queue
            .dequeue_message_from_worker_queue(consumer_id, BATCH_WORKER_QUEUE, self.poll_timeout)
            .await?
        else {
            return Ok(());
        };

        let Some(stored) = delivered.message.as_ref() else {
            tracing::warn!(message_id = %delivered.message_id, "batch item without stored record");
            return Ok(());
        };
        let Some((batch_id, item_index)) = parse_item_message_id(&delivered.message_id) else {
            tracing::warn!(message_id = %delivered.message_id, "unparseable batch item id");
            return Ok(());
        };

        let meta = self.read_meta(&batch_id).await?;
        let item = decode_batch_item(&stored.payload)?;

        let outcome = match self
            .processor
            .on_process_item(&batch_id, item_index, &item, &meta)
            .await
        {
            Ok(ItemResult::Success { run_id }) => BatchItemOutcome::Success {
                index: item_index,
                run_id,
            },
            Ok(ItemResult::Failure { error, error_code }) => BatchItemOutcome::Failure {
                index: item_index,
                error,
                error_code,
                task_identifier: item.task.clone(),
            },
            Err(e) => BatchItemOutcome::Failure {
                index: item_index,
                error: e.to_string(),
                error_code: UNEXPECTED_ERROR_CODE.to_string(),
                task_identifier: item.task.clone(),
            },
        };

        let descriptor =
            QueueDescriptor::new(batch_queue_id(&batch_id), &stored.tenant_id);
        self.queue
            .acknowledge_message(&descriptor, &delivered.message_id)
            .await?;

        self.record_outcome(&batch_id, item_index, outcome).await
    }

    /// Record one item outcome and decrement the remaining counter; the
    /// decrement that reaches zero finalizes the batch.
    async fn record_outcome(
        &self,
        batch_id: &str,
        item_index: u32,
        outcome: BatchItemOutcome,
    ) -> Result<(), BatchQueueError> {
        let _guard = self.completion.lock().await;

        let Some(remaining_bytes) = self
            .db
            .get(batch_remaining_key(batch_id).as_bytes())
            .await?
        else {
            // Already finalized; a duplicate delivery raced completion.
            return Ok(());
        };
        let remaining = decode_batch_remaining(&remaining_bytes)?.remaining;
        let next = remaining.saturating_sub(1);

        let mut batch = WriteBatch::new();
        batch.put(
            batch_result_key(batch_id, item_index).as_bytes(),
            &encode_batch_outcome(&outcome)?,
        );
        batch.put(
            batch_remaining_key(batch_id).as_bytes(),
            &encode_batch_remaining(&BatchRemaining { remaining: next })?,
        );
        self.db.write(batch).await?;

        if next == 0 {
            self.finalize_batch(batch_id).await?;
        }
        Ok(())
    }

    /// Assemble the aggregate result in item-index order, invoke the
    /// completion callback, then delete every transient record.
    async fn finalize_batch(&self, batch_id: &str) -> Result<(), BatchQueueError> {
        let prefix = batch_result_prefix(batch_id);
        let end = end_bound(&prefix);
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(prefix.into_bytes()..end).await?;

        let mut run_ids = Vec::new();
        let mut failures = Vec::new();
        loop {
            let Some(kv) = iter.next().await? else { break };
            match decode_batch_outcome(&kv.value)? {
                BatchItemOutcome::Success { run_id, .. } => run_ids.push(run_id),
                BatchItemOutcome::Failure {
                    index,
                    error,
                    error_code,
                    task_identifier,
                } => failures.push(BatchItemFailure {
                    index,
                    error,
                    error_code,
                    task_identifier,
                }),
            }
        }

        let result = CompleteBatchResult {
            batch_id: batch_id.to_string(),
            successful_run_count: run_ids.len() as u32,
            failed_run_count: failures.len() as u32,
            run_ids,
            failures,
        };
        let outcome_label = if result.failed_run_count == 0 {
            "success"
        } else {
            "with_failures"
        };
        crate::metrics::BATCHES_COMPLETED
            .with_label_values(&[outcome_label])
            .inc();
        tracing::info!(
            batch_id = %batch_id,
            successful = result.successful_run_count,
            failed = result.failed_run_count,
            "batch complete"
        );
        self.processor.on_batch_complete(result).await;

        let mut batch = WriteBatch::new();
        batch.delete(batch_meta_key(batch_id).as_bytes());
        batch.delete(batch_remaining_key(batch_id).as_bytes());
        self.db.write(batch).await?;
        for prefix in batch_transient_prefixes(batch_id) {
            self.delete_prefix(&prefix).await?;
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), BatchQueueError> {
        let end = end_bound(prefix);
        let mut iter: DbIterator = self
            .db
            .scan::<Vec<u8>, _>(prefix.as_bytes().to_vec()..end)
            .await?;
        let mut batch = WriteBatch::new();
        let mut any = false;
        loop {
            let Some(kv) = iter.next().await? else { break };
            batch.delete(&kv.key.to_vec());
            any = true;
        }
        if any {
            self.db.write(batch).await?;
        }
        Ok(())
    }

    async fn read_meta(&self, batch_id: &str) -> Result<BatchMeta, BatchQueueError> {
        let Some(bytes) = self.db.get(batch_meta_key(batch_id).as_bytes()).await? else {
            return Err(BatchQueueError::UnknownBatch(batch_id.to_string()));
        };
        Ok(decode_batch_meta(&bytes)?)
    }
}

fn batch_queue_id(batch_id: &str) -> String {
    format!("batch-{}", batch_id)
}

fn item_message_id(batch_id: &str, item_index: u32) -> String {
    format!("{}:{:06}", batch_id, item_index)
}

fn parse_item_message_id(message_id: &str) -> Option<(String, u32)> {
    let (batch_id, index) = message_id.rsplit_once(':')?;
    Some((batch_id.to_string(), index.parse().ok()?))
}
