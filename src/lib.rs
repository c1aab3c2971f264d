//! weir - the execution core of a durable run orchestration platform.
//!
//! The crate admits, queues, dispatches and fairly schedules units of work
//! ("runs") across many tenants sharing a pool of workers, and replicates
//! committed database changes into a columnar analytical store.
//!
//! Subsystems:
//! - [`fair_queue`]: the two-level-index queue engine with worker-queue
//!   delivery, concurrency gating and DRR-fair dispatch
//! - [`concurrency`]: atomic multi-group token accounting
//! - [`scheduler`]: the Deficit Round Robin dispatch scheduler
//! - [`batch_queue`]: two-phase batch ingestion with fair consumption
//! - [`debounce`]: the claim protocol collapsing concurrent triggers sharing
//!   a key into one rescheduled run
//! - [`release_queue`]: token-bucket gated deferred execution
//! - [`replication`]: the logical replication client, transaction assembly
//!   and the concurrent flush scheduler

pub mod batch_queue;
pub mod codec;
pub mod concurrency;
pub mod coordination;
pub mod debounce;
pub mod fair_queue;
pub mod keys;
pub mod message;
pub mod metrics;
pub mod release_queue;
pub mod replication;
pub mod runs;
pub mod scheduler;
pub mod settings;
pub mod storage;
pub mod trace;

/// Re-export the test attribute macro so tests can write `#[weir::test]`.
pub use weir_macros::test;

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current epoch time in milliseconds.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
