use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use weir::replication::{ConcurrentFlushScheduler, FlushConfig, FlushHandler};

/// Records every batch it is handed, in arrival order.
struct RecordingHandler {
    batches: Mutex<Vec<Vec<u32>>>,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(Vec::new()),
        })
    }

    async fn batches(&self) -> Vec<Vec<u32>> {
        self.batches.lock().await.clone()
    }
}

#[async_trait]
impl FlushHandler<u32> for RecordingHandler {
    async fn flush(&self, batch: Vec<u32>) -> anyhow::Result<()> {
        self.batches.lock().await.push(batch);
        Ok(())
    }
}

/// Fails the first `failures` flushes, then succeeds.
struct FlakyHandler {
    failures: u32,
    attempts: AtomicU32,
}

#[async_trait]
impl FlushHandler<u32> for FlakyHandler {
    async fn flush(&self, _batch: Vec<u32>) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            anyhow::bail!("columnar store unavailable");
        }
        Ok(())
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[weir::test]
async fn a_full_batch_flushes_without_waiting_for_the_timer() {
    let handler = RecordingHandler::new();
    let scheduler = ConcurrentFlushScheduler::new(
        Arc::clone(&handler) as Arc<dyn FlushHandler<u32>>,
        FlushConfig {
            batch_size: 3,
            // Long enough that only the size trigger can fire here.
            flush_interval: Duration::from_secs(60),
            max_concurrency: 2,
        },
    );

    scheduler.add_item(1).await;
    scheduler.add_item(2).await;
    assert_eq!(scheduler.flushed_batch_count(), 0);
    scheduler.add_item(3).await;

    wait_until(|| scheduler.flushed_batch_count() == 1).await;
    assert_eq!(handler.batches().await, vec![vec![1, 2, 3]]);
}

#[weir::test]
async fn the_interval_timer_flushes_partial_batches() {
    let handler = RecordingHandler::new();
    let scheduler = ConcurrentFlushScheduler::new(
        Arc::clone(&handler) as Arc<dyn FlushHandler<u32>>,
        FlushConfig {
            batch_size: 100,
            flush_interval: Duration::from_millis(20),
            max_concurrency: 2,
        },
    );
    scheduler.start().await;

    scheduler.add_item(7).await;
    scheduler.add_item(8).await;

    wait_until(|| scheduler.flushed_batch_count() == 1).await;
    assert_eq!(handler.batches().await, vec![vec![7, 8]]);
    scheduler.shutdown().await;
}

#[weir::test]
async fn shutdown_drains_whatever_is_pending() {
    let handler = RecordingHandler::new();
    let scheduler = ConcurrentFlushScheduler::new(
        Arc::clone(&handler) as Arc<dyn FlushHandler<u32>>,
        FlushConfig {
            batch_size: 100,
            flush_interval: Duration::from_secs(60),
            max_concurrency: 2,
        },
    );

    scheduler.add_item(1).await;
    scheduler.add_item(2).await;
    scheduler.shutdown().await;

    assert_eq!(scheduler.flushed_batch_count(), 1);
    assert_eq!(handler.batches().await, vec![vec![1, 2]]);
}

#[weir::test]
async fn flush_failures_are_counted_but_do_not_block_later_batches() {
    let handler = Arc::new(FlakyHandler {
        failures: 1,
        attempts: AtomicU32::new(0),
    });
    let scheduler = ConcurrentFlushScheduler::new(
        Arc::clone(&handler) as Arc<dyn FlushHandler<u32>>,
        FlushConfig {
            batch_size: 100,
            flush_interval: Duration::from_secs(60),
            max_concurrency: 2,
        },
    );

    // A synchronous flush surfaces the handler's error to the caller.
    assert!(scheduler.flush_now(vec![1]).await.is_err());
    assert_eq!(scheduler.failure_count(), 1);
    assert_eq!(scheduler.flushed_batch_count(), 0);

    scheduler.flush_now(vec![2]).await.unwrap();
    assert_eq!(scheduler.failure_count(), 1);
    assert_eq!(scheduler.flushed_batch_count(), 1);
}
