//! Concurrent flush batching: items accumulate until `batch_size` or
//! `flush_interval`, whichever comes first, and up to `max_concurrency`
//! flushes run at once. Failures are counted and logged without blocking
//! the next batch; a synchronous flush also reports its error to the
//! caller, which is what lets the batching replication path withhold acks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

#[async_trait]
pub trait FlushHandler<T: Send + 'static>: Send + Sync {
    async fn flush(&self, batch: Vec<T>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FlushConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_concurrency: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_millis(250),
            max_concurrency: 4,
        }
    }
}

pub struct ConcurrentFlushScheduler<T: Send + 'static> {
    handler: Arc<dyn FlushHandler<T>>,
    config: FlushConfig,
    pending: Arc<Mutex<Vec<T>>>,
    semaphore: Arc<Semaphore>,
    flush_failures: Arc<AtomicU64>,
    flushed_batches: Arc<AtomicU64>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> ConcurrentFlushScheduler<T> {
    pub fn new(handler: Arc<dyn FlushHandler<T>>, config: FlushConfig) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            handler,
            config,
            pending: Arc::new(Mutex::new(Vec::new())),
            flush_failures: Arc::new(AtomicU64::new(0)),
            flushed_batches: Arc::new(AtomicU64::new(0)),
            timer: Mutex::new(None),
        })
    }

    /// Start the interval-driven flush timer. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock().await;
        if timer.is_some() {
            return;
        }
        let scheduler = Arc::clone(self);
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.flush_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                scheduler.flush_async().await;
            }
        }));
    }

    /// Queue one item, flushing asynchronously when the batch fills.
    pub async fn add_item(self: &Arc<Self>, item: T) {
        let full = {
            let mut pending = self.pending.lock().await;
            pending.push(item);
            pending.len() >= self.config.batch_size
        };
        if full {
            self.flush_async().await;
        }
    }

    /// Queue a whole batch and flush it synchronously. The handler's error
    /// surfaces here, so a caller holding an unacknowledged transaction can
    /// refuse to advance past it.
    pub async fn flush_now(self: &Arc<Self>, items: Vec<T>) -> anyhow::Result<()> {
        {
            let mut pending = self.pending.lock().await;
            pending.extend(items);
        }
        self.flush_sync().await
    }

    /// Drain the remaining batch and stop the timer. Called before process
    /// exit.
    pub async fn shutdown(self: &Arc<Self>) {
        if let Some(timer) = self.timer.lock().await.take() {
            timer.abort();
        }
        // Failures here are already counted and logged by run_flush.
        let _ = self.flush_sync().await;
        // Wait for in-flight flushes by draining the semaphore.
        let _permits = self
            .semaphore
            .acquire_many(self.config.max_concurrency as u32)
            .await;
    }

    pub fn failure_count(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }

    pub fn flushed_batch_count(&self) -> u64 {
        self.flushed_batches.load(Ordering::Relaxed)
    }

    fn take_pending(pending: &mut Vec<T>) -> Option<Vec<T>> {
        if pending.is_empty() {
            None
        } else {
            Some(std::mem::take(pending))
        }
    }

    /// Flush in a background task; the result is counted, not returned.
    async fn flush_async(self: &Arc<Self>) {
        let Some(batch) = Self::take_pending(&mut *self.pending.lock().await) else {
            return;
        };
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = scheduler.semaphore.acquire().await;
            let _ = scheduler.run_flush(batch).await;
        });
    }

    /// Flush in place and report the handler's result.
    async fn flush_sync(self: &Arc<Self>) -> anyhow::Result<()> {
        let Some(batch) = Self::take_pending(&mut *self.pending.lock().await) else {
            return Ok(());
        };
        let _permit = self.semaphore.acquire().await;
        self.run_flush(batch).await
    }

    async fn run_flush(&self, batch: Vec<T>) -> anyhow::Result<()> {
        let size = batch.len();
        match self.handler.flush(batch).await {
            Ok(()) => {
                self.flushed_batches.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(size, "flushed batch");
                Ok(())
            }
            Err(e) => {
                self.flush_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(size, error = %e, "flush failed");
                Err(e)
            }
        }
    }
}
