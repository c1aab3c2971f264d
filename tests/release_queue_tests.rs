use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use weir::release_queue::{
    MaxTokensSource, ReleaseConcurrencyQueue, ReleaseConcurrencyTokenBucketQueue,
    ReleaseExecutor, ReleaseQueueError, RetryConfig,
};

/// Completes instantly, counting executions.
struct CountingExecutor {
    executed: AtomicU32,
}

impl CountingExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            executed: AtomicU32::new(0),
        })
    }

    fn count(&self) -> u32 {
        self.executed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReleaseExecutor for CountingExecutor {
    async fn execute(&self, _descriptor: &str, _item_id: &str) -> anyhow::Result<()> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Holds its token until released, so tests can observe consumed state.
struct BlockingExecutor {
    release: Notify,
    started: AtomicU32,
}

impl BlockingExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            release: Notify::new(),
            started: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ReleaseExecutor for BlockingExecutor {
    async fn execute(&self, _descriptor: &str, _item_id: &str) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(())
    }
}

/// Fails the first `failures` attempts, then succeeds.
struct FlakyExecutor {
    failures: u32,
    attempts: AtomicU32,
}

#[async_trait]
impl ReleaseExecutor for FlakyExecutor {
    async fn execute(&self, _descriptor: &str, _item_id: &str) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            anyhow::bail!("transient failure {}", attempt);
        }
        Ok(())
    }
}

struct FixedTokens(f64);

#[async_trait]
impl MaxTokensSource for FixedTokens {
    async fn max_tokens(&self, _descriptor: &str) -> anyhow::Result<f64> {
        Ok(self.0)
    }
}

struct BrokenTokens;

#[async_trait]
impl MaxTokensSource for BrokenTokens {
    async fn max_tokens(&self, _descriptor: &str) -> anyhow::Result<f64> {
        anyhow::bail!("limit lookup unavailable")
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

async fn wait_for_consumed(queue: &std::sync::Arc<ReleaseConcurrencyQueue>, descriptor: &str, expected: u32) {
    for _ in 0..200 {
        if queue.consumed_tokens(descriptor).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("consumed tokens never reached {}", expected);
}

#[weir::test]
async fn tokens_beyond_the_ceiling_queue_fifo() {
    let executor = BlockingExecutor::new();
    let queue = ReleaseConcurrencyQueue::new(
        Arc::clone(&executor) as Arc<dyn ReleaseExecutor>,
        RetryConfig::default(),
    );

    assert!(queue.attempt_to_release("d1", "i1", 2).await.unwrap());
    assert!(queue.attempt_to_release("d1", "i2", 2).await.unwrap());
    assert!(!queue.attempt_to_release("d1", "i3", 2).await.unwrap());

    assert_eq!(queue.consumed_tokens("d1").await, 2);
    assert_eq!(queue.queue_length("d1").await, 1);

    executor.release.notify_waiters();
}

#[weir::test]
async fn refill_launches_the_oldest_queued_item() {
    let executor = BlockingExecutor::new();
    let queue = ReleaseConcurrencyQueue::new(
        Arc::clone(&executor) as Arc<dyn ReleaseExecutor>,
        RetryConfig::default(),
    );

    assert!(queue.attempt_to_release("d1", "i1", 1).await.unwrap());
    assert!(!queue.attempt_to_release("d1", "i2", 1).await.unwrap());
    wait_until(|| executor.started.load(Ordering::SeqCst) == 1).await;

    // One returned token grants the queued item its slot
    let launched = queue.refill_tokens("d1", 1, 1).await.unwrap();
    assert_eq!(launched, 1);
    assert_eq!(queue.queue_length("d1").await, 0);
    wait_until(|| executor.started.load(Ordering::SeqCst) == 2).await;

    executor.release.notify_waiters();
}

#[weir::test]
async fn negative_refill_is_rejected_and_zero_is_a_noop() {
    let queue = ReleaseConcurrencyQueue::new(
        CountingExecutor::new() as Arc<dyn ReleaseExecutor>,
        RetryConfig::default(),
    );
    assert!(matches!(
        queue.refill_tokens("d1", 5, -1).await,
        Err(ReleaseQueueError::InvalidTokenAmount(-1))
    ));
    assert_eq!(queue.refill_tokens("d1", 5, 0).await.unwrap(), 0);
}

#[weir::test]
async fn completed_executions_return_their_tokens() {
    let executor = CountingExecutor::new();
    let queue = ReleaseConcurrencyQueue::new(
        Arc::clone(&executor) as Arc<dyn ReleaseExecutor>,
        RetryConfig::default(),
    );

    assert!(queue.attempt_to_release("d1", "i1", 2).await.unwrap());
    assert!(queue.attempt_to_release("d1", "i2", 2).await.unwrap());
    wait_until(|| executor.count() == 2).await;

    // Tokens flow back as executions finish; consumption drains to zero
    wait_for_consumed(&queue, "d1", 0).await;
}

#[weir::test]
async fn poller_drains_the_backlog_when_capacity_returns() {
    let executor = CountingExecutor::new();
    let queue = ReleaseConcurrencyQueue::new(
        Arc::clone(&executor) as Arc<dyn ReleaseExecutor>,
        RetryConfig::default(),
    );

    assert!(queue.attempt_to_release("d1", "i1", 2).await.unwrap());
    assert!(queue.attempt_to_release("d1", "i2", 2).await.unwrap());
    assert!(!queue.attempt_to_release("d1", "i3", 2).await.unwrap());

    // The first two finish and return their tokens, but nothing launches
    // the parked item until a poll runs.
    wait_for_consumed(&queue, "d1", 0).await;
    assert_eq!(queue.queue_length("d1").await, 1);

    assert_eq!(queue.poll_once(10).await.unwrap(), 1);
    wait_until(|| executor.count() == 3).await;
    assert_eq!(queue.queue_length("d1").await, 0);
}

#[weir::test]
async fn background_poller_launches_parked_items_on_its_own() {
    let executor = BlockingExecutor::new();
    let queue = ReleaseConcurrencyQueue::new(
        Arc::clone(&executor) as Arc<dyn ReleaseExecutor>,
        RetryConfig::default(),
    );

    assert!(queue.attempt_to_release("d1", "i1", 1).await.unwrap());
    wait_until(|| executor.started.load(Ordering::SeqCst) == 1).await;
    assert!(!queue.attempt_to_release("d1", "i2", 1).await.unwrap());

    let poller = queue.start_poller(Duration::from_millis(10), 10);
    // Free the first item; the poller should pick up the parked one without
    // any explicit refill or poll call.
    executor.release.notify_one();
    wait_until(|| executor.started.load(Ordering::SeqCst) == 2).await;
    assert_eq!(queue.queue_length("d1").await, 0);

    poller.abort();
    executor.release.notify_one();
}

#[weir::test]
async fn zero_ceiling_items_stay_parked_even_when_polled() {
    let executor = CountingExecutor::new();
    let queue = ReleaseConcurrencyQueue::new(
        Arc::clone(&executor) as Arc<dyn ReleaseExecutor>,
        RetryConfig::default(),
    );

    for i in 0..3 {
        assert!(!queue
            .attempt_to_release("d1", &format!("i{}", i), 0)
            .await
            .unwrap());
    }
    assert_eq!(queue.queue_length("d1").await, 3);

    // Items carry their ceiling; at zero they never launch
    assert_eq!(queue.poll_once(10).await.unwrap(), 0);
    assert_eq!(queue.queue_length("d1").await, 3);
    assert_eq!(executor.count(), 0);
}

#[weir::test]
async fn failed_execution_retries_with_backoff_and_succeeds() {
    let executor = Arc::new(FlakyExecutor {
        failures: 2,
        attempts: AtomicU32::new(0),
    });
    let queue = ReleaseConcurrencyQueue::new(
        Arc::clone(&executor) as Arc<dyn ReleaseExecutor>,
        RetryConfig {
            min_delay_ms: 10,
            max_delay_ms: 50,
            factor: 2.0,
            max_retries: 3,
        },
    );

    assert!(queue.attempt_to_release("d1", "i1", 1).await.unwrap());
    wait_until(|| executor.attempts.load(Ordering::SeqCst) == 3).await;
    // After the eventual success every token is back
    wait_for_consumed(&queue, "d1", 0).await;
}

#[weir::test]
async fn permanently_failing_item_is_dropped_after_max_retries() {
    let executor = Arc::new(FlakyExecutor {
        failures: u32::MAX,
        attempts: AtomicU32::new(0),
    });
    let queue = ReleaseConcurrencyQueue::new(
        Arc::clone(&executor) as Arc<dyn ReleaseExecutor>,
        RetryConfig {
            min_delay_ms: 10,
            max_delay_ms: 20,
            factor: 1.5,
            max_retries: 2,
        },
    );

    assert!(queue.attempt_to_release("d1", "i1", 1).await.unwrap());
    // 1 initial + 2 retries, then the item is dropped with its token back
    wait_until(|| executor.attempts.load(Ordering::SeqCst) == 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(queue.consumed_tokens("d1").await, 0);
    assert_eq!(queue.queue_length("d1").await, 0);
}

#[weir::test]
async fn dynamic_ceiling_floors_fractional_limits() {
    let executor = BlockingExecutor::new();
    let queue = ReleaseConcurrencyTokenBucketQueue::new(
        Arc::clone(&executor) as Arc<dyn ReleaseExecutor>,
        Arc::new(FixedTokens(2.5)),
        RetryConfig::default(),
    );

    // floor(2.5) = 2 immediate slots
    assert!(queue.attempt_to_release("d1", "i1").await.unwrap());
    assert!(queue.attempt_to_release("d1", "i2").await.unwrap());
    assert!(!queue.attempt_to_release("d1", "i3").await.unwrap());
    assert_eq!(queue.inner().queue_length("d1").await, 1);

    executor.release.notify_waiters();
}

#[weir::test]
async fn failing_limit_lookup_reads_as_zero_capacity() {
    let executor = CountingExecutor::new();
    let queue = ReleaseConcurrencyTokenBucketQueue::new(
        Arc::clone(&executor) as Arc<dyn ReleaseExecutor>,
        Arc::new(BrokenTokens),
        RetryConfig::default(),
    );

    // Nothing executes, nothing is lost
    assert!(!queue.attempt_to_release("d1", "i1").await.unwrap());
    assert_eq!(queue.inner().queue_length("d1").await, 1);
    assert_eq!(executor.count(), 0);
}

/// Fails "a" on its first run, holds "b" until released, and records the
/// order items reached the executor.
struct OrderedExecutor {
    release_b: Notify,
    a_runs: AtomicU32,
    order: std::sync::Mutex<Vec<String>>,
}

impl OrderedExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            release_b: Notify::new(),
            a_runs: AtomicU32::new(0),
            order: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReleaseExecutor for OrderedExecutor {
    async fn execute(&self, _descriptor: &str, item_id: &str) -> anyhow::Result<()> {
        self.order.lock().unwrap().push(item_id.to_string());
        match item_id {
            "a" if self.a_runs.fetch_add(1, Ordering::SeqCst) == 0 => {
                anyhow::bail!("transient failure")
            }
            "b" => {
                self.release_b.notified().await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[weir::test]
async fn a_retry_waits_its_turn_when_the_bucket_is_full() {
    let executor = OrderedExecutor::new();
    let queue = ReleaseConcurrencyQueue::new(
        Arc::clone(&executor) as Arc<dyn ReleaseExecutor>,
        RetryConfig {
            min_delay_ms: 50,
            ..RetryConfig::default()
        },
    );

    // "a" fails its first run and schedules a backoff retry, returning the
    // token.
    assert!(queue.attempt_to_release("d1", "a", 1).await.unwrap());
    wait_until(|| executor.a_runs.load(Ordering::SeqCst) == 1).await;

    // "b" takes the freed token and holds it; "c" parks behind it.
    assert!(queue.attempt_to_release("d1", "b", 1).await.unwrap());
    assert!(!queue.attempt_to_release("d1", "c", 1).await.unwrap());

    // The retry fires into a full bucket: it re-parks at the head instead
    // of overdrawing the ceiling.
    for _ in 0..200 {
        if queue.queue_length("d1").await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(queue.queue_length("d1").await, 2);
    assert_eq!(queue.consumed_tokens("d1").await, 1);

    executor.release_b.notify_one();
    wait_for_consumed(&queue, "d1", 0).await;

    // The poller resumes the retry first, ahead of the younger "c".
    assert_eq!(queue.poll_once(10).await.unwrap(), 1);
    wait_until(|| executor.order().len() == 3).await;
    assert_eq!(executor.order(), vec!["a", "b", "a"]);
    assert_eq!(queue.queue_length("d1").await, 1);

    wait_for_consumed(&queue, "d1", 0).await;
    assert_eq!(queue.poll_once(10).await.unwrap(), 1);
    wait_until(|| executor.order() == vec!["a", "b", "a", "c"]).await;
}
