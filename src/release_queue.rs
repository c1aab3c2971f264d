//! Token-bucket deferred executor.
//!
//! Decouples "a slot became free" from "run the next pending action": each
//! descriptor owns a refillable token bucket and a FIFO of waiting items.
//! Executor failures return the token and retry with exponential backoff up
//! to a bound, after which the item is dropped with a logged failure.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ReleaseQueueError {
    #[error("invalid token amount: {0}")]
    InvalidTokenAmount(i64),
    #[error("max tokens callback failed: {0}")]
    MaxTokensCallback(String),
}

/// Runs one deferred action. Failure returns the token and schedules a
/// retry.
#[async_trait]
pub trait ReleaseExecutor: Send + Sync {
    async fn execute(&self, descriptor: &str, item_id: &str) -> anyhow::Result<()>;
}

/// Computes the live token ceiling for a descriptor. Non-positive or failed
/// results read as zero capacity: items queue until a real refill occurs.
#[async_trait]
pub trait MaxTokensSource: Send + Sync {
    async fn max_tokens(&self, descriptor: &str) -> anyhow::Result<f64>;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 5_000,
            factor: 2.0,
            max_retries: 3,
        }
    }
}

impl RetryConfig {
    /// Backoff delay for a 0-based attempt number, `None` once exhausted.
    fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let delay = (self.min_delay_ms as f64 * self.factor.powi(attempt as i32)).round() as u64;
        Some(Duration::from_millis(delay.min(self.max_delay_ms)))
    }
}

#[derive(Default)]
struct BucketState {
    /// Tokens currently consumed by in-flight executions.
    consumed: u32,
    queued: VecDeque<QueuedItem>,
}

#[derive(Debug, Clone)]
struct QueuedItem {
    item_id: String,
    max_tokens: u32,
    /// Retries re-park with their attempt count intact.
    attempt: u32,
}

/// Fixed-ceiling token bucket queue. `max_tokens` is supplied per call.
pub struct ReleaseConcurrencyQueue {
    executor: Arc<dyn ReleaseExecutor>,
    retry: RetryConfig,
    buckets: Arc<Mutex<HashMap<String, BucketState>>>,
}

impl ReleaseConcurrencyQueue {
    pub fn new(executor: Arc<dyn ReleaseExecutor>, retry: RetryConfig) -> Arc<Self> {
        Arc::new(Self {
            executor,
            retry,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Consume a token and execute immediately when one is available,
    /// otherwise queue the item FIFO. Returns true when executed now.
    pub async fn attempt_to_release(
        self: &Arc<Self>,
        descriptor: &str,
        item_id: &str,
        max_tokens: u32,
    ) -> Result<bool, ReleaseQueueError> {
        let execute_now = {
            let mut buckets = self.buckets.lock().await;
            let bucket = buckets.entry(descriptor.to_string()).or_default();
            if bucket.consumed < max_tokens {
                bucket.consumed += 1;
                true
            } else {
                bucket.queued.push_back(QueuedItem {
                    item_id: item_id.to_string(),
                    max_tokens,
                    attempt: 0,
                });
                false
            }
        };

        if execute_now {
            self.spawn_execution(descriptor.to_string(), item_id.to_string(), max_tokens, 0);
        }
        Ok(execute_now)
    }

    /// Add up to `count` tokens, clamped so consumption headroom never
    /// exceeds `max_tokens`; each added token pops and runs the oldest
    /// queued item. Negative counts are rejected, zero is a no-op.
    pub async fn refill_tokens(
        self: &Arc<Self>,
        descriptor: &str,
        max_tokens: u32,
        count: i64,
    ) -> Result<u32, ReleaseQueueError> {
        if count < 0 {
            return Err(ReleaseQueueError::InvalidTokenAmount(count));
        }
        if count == 0 {
            return Ok(0);
        }

        let mut started = Vec::new();
        {
            let mut buckets = self.buckets.lock().await;
            let bucket = buckets.entry(descriptor.to_string()).or_default();
            // Refill releases consumed tokens first, then grants the
            // remainder to queued items.
            let released = (count as u32).min(bucket.consumed);
            bucket.consumed -= released;

            let mut grants = count as u32;
            while grants > 0 && bucket.consumed < max_tokens {
                let Some(item) = bucket.queued.pop_front() else { break };
                bucket.consumed += 1;
                grants -= 1;
                started.push(item);
            }
        }

        let launched = started.len() as u32;
        for item in started {
            self.spawn_execution(
                descriptor.to_string(),
                item.item_id,
                item.max_tokens,
                item.attempt,
            );
        }
        Ok(launched)
    }

    pub async fn queue_length(&self, descriptor: &str) -> usize {
        self.buckets
            .lock()
            .await
            .get(descriptor)
            .map(|b| b.queued.len())
            .unwrap_or(0)
    }

    pub async fn consumed_tokens(&self, descriptor: &str) -> u32 {
        self.buckets
            .lock()
            .await
            .get(descriptor)
            .map(|b| b.consumed)
            .unwrap_or(0)
    }

    /// Pull up to `batch_size` queued items across all descriptors and push
    /// them through the token/executor path. Used by the background poller.
    pub async fn poll_once(self: &Arc<Self>, batch_size: usize) -> Result<u32, ReleaseQueueError> {
        let mut candidates = Vec::new();
        {
            let mut buckets = self.buckets.lock().await;
            'outer: for (descriptor, bucket) in buckets.iter_mut() {
                while bucket.consumed
                    < bucket.queued.front().map(|i| i.max_tokens).unwrap_or(0)
                {
                    let Some(item) = bucket.queued.pop_front() else { break };
                    bucket.consumed += 1;
                    candidates.push((descriptor.clone(), item));
                    if candidates.len() >= batch_size {
                        break 'outer;
                    }
                }
            }
        }

        let launched = candidates.len() as u32;
        for (descriptor, item) in candidates {
            self.spawn_execution(descriptor, item.item_id, item.max_tokens, item.attempt);
        }
        Ok(launched)
    }

    /// Run the batch poller every `interval` until the returned handle is
    /// aborted.
    pub fn start_poller(
        self: &Arc<Self>,
        interval: Duration,
        batch_size: usize,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = queue.poll_once(batch_size).await {
                    tracing::error!(error = %e, "release queue poll failed");
                }
            }
        })
    }

    fn spawn_execution(
        self: &Arc<Self>,
        descriptor: String,
        item_id: String,
        max_tokens: u32,
        attempt: u32,
    ) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.run_item(descriptor, item_id, max_tokens, attempt).await;
        });
    }

    /// Drive one item to completion, retrying with backoff inside the same
    /// task. The caller has already consumed a token for the first attempt.
    async fn run_item(
        self: Arc<Self>,
        descriptor: String,
        item_id: String,
        max_tokens: u32,
        mut attempt: u32,
    ) {
        loop {
            let result = self.executor.execute(&descriptor, &item_id).await;

            // The attempt holds its token only while the executor runs.
            {
                let mut buckets = self.buckets.lock().await;
                if let Some(bucket) = buckets.get_mut(&descriptor) {
                    bucket.consumed = bucket.consumed.saturating_sub(1);
                }
            }

            let error = match result {
                Ok(()) => return,
                Err(e) => e,
            };

            let Some(delay) = self.retry.delay_for_attempt(attempt) else {
                tracing::error!(
                    descriptor = %descriptor,
                    item_id = %item_id,
                    attempts = attempt + 1,
                    error = %error,
                    "release executor failed permanently, dropping item"
                );
                return;
            };

            tracing::warn!(
                descriptor = %descriptor,
                item_id = %item_id,
                attempt,
                error = %error,
                "release executor failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;

            // The retry competes for a token like any fresh release. With
            // the bucket full it re-parks at the head of the queue and the
            // next refill or poll resumes it.
            let granted = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets.entry(descriptor.clone()).or_default();
                if bucket.consumed < max_tokens {
                    bucket.consumed += 1;
                    true
                } else {
                    bucket.queued.push_front(QueuedItem {
                        item_id: item_id.clone(),
                        max_tokens,
                        attempt,
                    });
                    false
                }
            };
            if !granted {
                return;
            }
        }
    }
}

/// Variant resolving `max_tokens` dynamically per descriptor through an
/// async callback (for example a live concurrency-limit lookup).
pub struct ReleaseConcurrencyTokenBucketQueue {
    inner: Arc<ReleaseConcurrencyQueue>,
    source: Arc<dyn MaxTokensSource>,
}

impl ReleaseConcurrencyTokenBucketQueue {
    pub fn new(
        executor: Arc<dyn ReleaseExecutor>,
        source: Arc<dyn MaxTokensSource>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            inner: ReleaseConcurrencyQueue::new(executor, retry),
            source,
        }
    }

    pub fn inner(&self) -> &Arc<ReleaseConcurrencyQueue> {
        &self.inner
    }

    pub async fn attempt_to_release(
        &self,
        descriptor: &str,
        item_id: &str,
    ) -> Result<bool, ReleaseQueueError> {
        let max_tokens = self.resolve_max_tokens(descriptor).await;
        if max_tokens == 0 {
            // Zero capacity: queue without executing, no silent stall on a
            // failed lookup either.
            self.inner.attempt_to_release(descriptor, item_id, 0).await
        } else {
            self.inner
                .attempt_to_release(descriptor, item_id, max_tokens)
                .await
        }
    }

    pub async fn refill_tokens(
        &self,
        descriptor: &str,
        count: i64,
    ) -> Result<u32, ReleaseQueueError> {
        let max_tokens = self.resolve_max_tokens(descriptor).await;
        self.inner.refill_tokens(descriptor, max_tokens, count).await
    }

    /// Floors fractional results; zero/negative results and callback errors
    /// read as zero capacity.
    async fn resolve_max_tokens(&self, descriptor: &str) -> u32 {
        match self.source.max_tokens(descriptor).await {
            Ok(value) if value >= 1.0 => value.floor() as u32,
            Ok(_) => 0,
            Err(e) => {
                tracing::warn!(descriptor = %descriptor, error = %e, "max tokens lookup failed");
                0
            }
        }
    }
}
