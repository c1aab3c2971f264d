#![allow(dead_code)]

use std::sync::Arc;

use slatedb::{Db, WriteBatch};
use weir::concurrency::{ConcurrencyManager, StaticGroupLimiter, TENANT_GROUP};
use weir::fair_queue::{EnqueueRequest, FairQueue, FairQueueConfig};
use weir::message::{EnvironmentType, QueueDescriptor};
use weir::scheduler::{DrrScheduler, SchedulerConfig};
use weir::settings::Backend;

// Helper: enforce a tight timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

pub async fn open_temp_db() -> (tempfile::TempDir, Arc<Db>) {
    let tmp = tempfile::tempdir().unwrap();
    let db = weir::storage::open_db(
        &Backend::Fs,
        &tmp.path().to_string_lossy(),
        // Fast flush interval for tests
        Some(10),
    )
    .await
    .expect("open db");
    (tmp, db)
}

/// Deterministic scheduler: fixed seed, strict oldest-first queue order.
pub fn test_scheduler() -> DrrScheduler {
    DrrScheduler::new(SchedulerConfig {
        seed: Some(42),
        ..SchedulerConfig::default()
    })
}

/// A queue gated by the tenant concurrency group with the given limit.
pub async fn open_temp_queue(
    tenant_limit: u32,
) -> (tempfile::TempDir, Arc<Db>, Arc<FairQueue>) {
    open_temp_queue_with(tenant_limit, FairQueueConfig::default()).await
}

pub async fn open_temp_queue_with(
    tenant_limit: u32,
    config: FairQueueConfig,
) -> (tempfile::TempDir, Arc<Db>, Arc<FairQueue>) {
    let (tmp, db) = open_temp_db().await;
    let queue = queue_over_db(&db, tenant_limit, config);
    (tmp, db, queue)
}

/// Build a second (or first) engine over an already-open store, e.g. to
/// exercise restart and migration paths.
pub fn queue_over_db(
    db: &Arc<Db>,
    tenant_limit: u32,
    config: FairQueueConfig,
) -> Arc<FairQueue> {
    let limiter = Arc::new(StaticGroupLimiter::new(tenant_limit));
    let concurrency = Arc::new(ConcurrencyManager::new(
        Arc::clone(db),
        limiter,
        vec![TENANT_GROUP.to_string()],
    ));
    FairQueue::new(Arc::clone(db), concurrency, test_scheduler(), config)
}

pub fn request(tenant: &str, queue: &str, message_id: &str) -> EnqueueRequest {
    EnqueueRequest {
        descriptor: QueueDescriptor::new(queue, tenant),
        message_id: message_id.to_string(),
        payload: format!("{{\"id\":\"{}\"}}", message_id).into_bytes(),
        worker_queue: "main".to_string(),
        environment_type: EnvironmentType::Production,
        timestamp_ms: None,
    }
}

/// Write one raw key/value, for seeding records the public API never writes.
pub async fn put_raw(db: &Arc<Db>, key: &str, value: &[u8]) {
    let mut batch = WriteBatch::new();
    batch.put(key.as_bytes(), value);
    db.write(batch).await.expect("raw write");
}
