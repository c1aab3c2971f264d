//! Distributed-lock boundary contracts.
//!
//! Leader election and run-scoped mutual exclusion are provided by an
//! external lock service in production. The in-memory implementations here
//! carry the same semantics for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// TTL-based acquire/extend/release leadership lock.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Try to take the lock. Returns false when another live owner holds it.
    async fn try_acquire(&self, name: &str, owner: &str, ttl_ms: u64) -> anyhow::Result<bool>;

    /// Extend a held lock's TTL. Returns false when the caller no longer
    /// owns it (expired and taken over).
    async fn extend(&self, name: &str, owner: &str, ttl_ms: u64) -> anyhow::Result<bool>;

    /// Release if still owned. Releasing a lost lock is a no-op.
    async fn release(&self, name: &str, owner: &str) -> anyhow::Result<()>;
}

/// Mutual exclusion scoped to a set of run ids, used to serialize run-row
/// mutations across processes.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// Acquire locks on every id (sorted internally to avoid lock-order
    /// inversions). Held until the guard drops.
    async fn lock(&self, name: &str, run_ids: &[String]) -> anyhow::Result<RunLockGuard>;
}

/// Opaque guard releasing on drop.
pub struct RunLockGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

#[derive(Default)]
pub struct InMemoryLeaderLock {
    locks: Mutex<HashMap<String, (String, i64)>>,
}

impl InMemoryLeaderLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaderLock for InMemoryLeaderLock {
    async fn try_acquire(&self, name: &str, owner: &str, ttl_ms: u64) -> anyhow::Result<bool> {
        let now = crate::now_epoch_ms();
        let mut locks = self.locks.lock().unwrap();
        match locks.get(name) {
            Some((holder, expires_at)) if *expires_at > now && holder != owner => Ok(false),
            _ => {
                locks.insert(name.to_string(), (owner.to_string(), now + ttl_ms as i64));
                Ok(true)
            }
        }
    }

    async fn extend(&self, name: &str, owner: &str, ttl_ms: u64) -> anyhow::Result<bool> {
        let now = crate::now_epoch_ms();
        let mut locks = self.locks.lock().unwrap();
        match locks.get_mut(name) {
            Some((holder, expires_at)) if holder == owner && *expires_at > now => {
                *expires_at = now + ttl_ms as i64;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, owner: &str) -> anyhow::Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if matches!(locks.get(name), Some((holder, _)) if holder == owner) {
            locks.remove(name);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryRunLock {
    mutexes: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl InMemoryRunLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunLock for InMemoryRunLock {
    async fn lock(&self, name: &str, run_ids: &[String]) -> anyhow::Result<RunLockGuard> {
        let mut ids: Vec<String> = run_ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let mutex = {
                let mut mutexes = self.mutexes.lock().unwrap();
                Arc::clone(
                    mutexes
                        .entry(format!("{}:{}", name, id))
                        .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
                )
            };
            guards.push(mutex.lock_owned().await);
        }
        Ok(RunLockGuard { _guards: guards })
    }
}
