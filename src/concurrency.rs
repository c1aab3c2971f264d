//! Concurrency token accounting over named groups.
//!
//! Every queue is gated by zero or more groups (tenant, organization, ...),
//! each with an independently computed limit. Admission must be atomic across
//! all groups simultaneously: a message may not be admitted under the tenant
//! limit and then rejected under the organization limit after a partial
//! reservation.
//!
//! # Invariants
//!
//! - Group limit is enforced: at most `limit` holders per group at any time.
//!   Enforced by `reserve`, which checks and reserves every group under one
//!   mutex acquisition.
//! - A failed reserve has no side effects in any group.
//! - Holders only exist for messages that are in flight. They are created at
//!   dispatch and released at ack/nack (or by `clear_group` recovery).
//!
//! # TOCTOU prevention
//!
//! In-memory counts are updated BEFORE the durable write. If the write batch
//! fails, callers must invoke the rollback methods to revert the in-memory
//! state, so no window exists where capacity appears available between check
//! and grant.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use slatedb::{Db, DbIterator, WriteBatch};

use crate::codec::{CodecError, encode_holder};
use crate::keys::{
    concurrency_group_prefix, concurrency_holder_key, end_bound, parse_concurrency_holder_key,
};
use crate::message::{HolderRecord, QueueDescriptor};

/// Error type for concurrency operations.
#[derive(Debug, thiserror::Error)]
pub enum ConcurrencyError {
    #[error(transparent)]
    Slate(#[from] slatedb::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Computes the limit for one group id. Injected by the embedding service;
/// typically a lookup against live tenant/org plan data.
#[async_trait]
pub trait GroupLimiter: Send + Sync {
    async fn get_limit(&self, group_name: &str, group_id: &str) -> u32;
}

/// Fixed-limit implementation used by tests and single-tenant deployments.
pub struct StaticGroupLimiter {
    default_limit: u32,
    overrides: Mutex<HashMap<(String, String), u32>>,
}

impl StaticGroupLimiter {
    pub fn new(default_limit: u32) -> Self {
        Self {
            default_limit,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_limit(&self, group_name: &str, group_id: &str, limit: u32) {
        self.overrides
            .lock()
            .unwrap()
            .insert((group_name.to_string(), group_id.to_string()), limit);
    }
}

#[async_trait]
impl GroupLimiter for StaticGroupLimiter {
    async fn get_limit(&self, group_name: &str, group_id: &str) -> u32 {
        self.overrides
            .lock()
            .unwrap()
            .get(&(group_name.to_string(), group_id.to_string()))
            .copied()
            .unwrap_or(self.default_limit)
    }
}

/// The tenant group resolves from the descriptor directly; every other group
/// name resolves through descriptor metadata.
pub const TENANT_GROUP: &str = "tenant";

/// Result of an admission-control probe.
#[derive(Debug, Clone)]
pub struct CapacityCheck {
    pub allowed: bool,
    pub blocked_by: Option<BlockedBy>,
}

/// Which group blocked admission, in declaration order.
#[derive(Debug, Clone)]
pub struct BlockedBy {
    pub group_name: String,
    pub group_id: String,
    pub current: u32,
    pub limit: u32,
}

/// Available capacity across all groups. Zero configured groups means there
/// is nothing to constrain admission, reported as `Unbounded` rather than 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Unbounded,
    Available(u32),
}

impl Capacity {
    pub fn as_count(&self) -> Option<u32> {
        match self {
            Capacity::Unbounded => None,
            Capacity::Available(n) => Some(*n),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Capacity::Available(0))
    }
}

/// Point-in-time snapshot of one group.
#[derive(Debug, Clone)]
pub struct GroupState {
    pub group_name: String,
    pub group_id: String,
    pub current: u32,
    pub limit: u32,
}

/// Multi-group concurrency manager. Counts are hydrated lazily from durable
/// holder records, then maintained in memory with rollback on write failure.
pub struct ConcurrencyManager {
    db: std::sync::Arc<Db>,
    limiter: std::sync::Arc<dyn GroupLimiter>,
    /// Configured group names, in declaration order.
    groups: Vec<String>,
    // Composite key: "<group_name>|<group_id>" -> set of in-flight message ids
    holders: Mutex<HashMap<String, HashSet<String>>>,
    hydrated: Mutex<HashSet<String>>,
}

fn group_key(group_name: &str, group_id: &str) -> String {
    format!("{}|{}", group_name, group_id)
}

impl ConcurrencyManager {
    pub fn new(
        db: std::sync::Arc<Db>,
        limiter: std::sync::Arc<dyn GroupLimiter>,
        groups: Vec<String>,
    ) -> Self {
        Self {
            db,
            limiter,
            groups,
            holders: Mutex::new(HashMap::new()),
            hydrated: Mutex::new(HashSet::new()),
        }
    }

    pub fn group_names(&self) -> &[String] {
        &self.groups
    }

    /// Resolve the (group_name, group_id) pairs that gate one queue, in
    /// declaration order. Groups whose id is absent from the descriptor
    /// metadata do not gate the queue.
    pub fn resolve_groups(&self, descriptor: &QueueDescriptor) -> Vec<(String, String)> {
        let mut resolved = Vec::with_capacity(self.groups.len());
        for name in &self.groups {
            if name == TENANT_GROUP {
                resolved.push((name.clone(), descriptor.tenant_id.clone()));
            } else if let Some(id) = descriptor.meta(name) {
                resolved.push((name.clone(), id.to_string()));
            }
        }
        resolved
    }

    /// Hydrate one group's holder state from durable records.
    async fn hydrate_group(&self, group_name: &str, group_id: &str) -> Result<(), ConcurrencyError> {
        let key = group_key(group_name, group_id);

        let start = concurrency_group_prefix(group_name, group_id);
        let end = end_bound(&start);
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(start.into_bytes()..end).await?;

        let mut message_ids = Vec::new();
        loop {
            let maybe = iter.next().await?;
            let Some(kv) = maybe else { break };
            let Some((_, _, message_id)) = parse_concurrency_holder_key(&kv.key) else {
                continue;
            };
            message_ids.push(message_id);
        }

        {
            let mut h = self.holders.lock().unwrap();
            let set = h.entry(key.clone()).or_default();
            for id in message_ids {
                set.insert(id);
            }
        }
        self.hydrated.lock().unwrap().insert(key);
        Ok(())
    }

    /// Fast path: return immediately when the group is already hydrated.
    async fn ensure_hydrated(&self, group_name: &str, group_id: &str) -> Result<(), ConcurrencyError> {
        {
            let hydrated = self.hydrated.lock().unwrap();
            if hydrated.contains(&group_key(group_name, group_id)) {
                return Ok(());
            }
        }
        self.hydrate_group(group_name, group_id).await
    }

    async fn resolved_with_limits(
        &self,
        descriptor: &QueueDescriptor,
    ) -> Result<Vec<(String, String, u32)>, ConcurrencyError> {
        let resolved = self.resolve_groups(descriptor);
        let mut out = Vec::with_capacity(resolved.len());
        for (name, id) in resolved {
            self.ensure_hydrated(&name, &id).await?;
            let limit = self.limiter.get_limit(&name, &id).await;
            out.push((name, id, limit));
        }
        Ok(out)
    }

    /// Can this queue admit one more in-flight message? Reports the first
    /// blocking group in declaration order. No configured groups means
    /// unconstrained.
    pub async fn can_process(
        &self,
        descriptor: &QueueDescriptor,
    ) -> Result<CapacityCheck, ConcurrencyError> {
        let groups = self.resolved_with_limits(descriptor).await?;
        let h = self.holders.lock().unwrap();
        for (name, id, limit) in &groups {
            let current = h
                .get(&group_key(name, id))
                .map(|s| s.len() as u32)
                .unwrap_or(0);
            if current >= *limit {
                return Ok(CapacityCheck {
                    allowed: false,
                    blocked_by: Some(BlockedBy {
                        group_name: name.clone(),
                        group_id: id.clone(),
                        current,
                        limit: *limit,
                    }),
                });
            }
        }
        Ok(CapacityCheck {
            allowed: true,
            blocked_by: None,
        })
    }

    /// Atomically reserve a slot in every group. All-or-nothing: if any group
    /// is at capacity, nothing is reserved and `false` is returned.
    ///
    /// Holder records are appended to `batch`; the in-memory reservation is
    /// made before this returns. If the batch write later fails the caller
    /// MUST call [`ConcurrencyManager::rollback_reserve`].
    pub async fn reserve(
        &self,
        batch: &mut WriteBatch,
        descriptor: &QueueDescriptor,
        message_id: &str,
        now_ms: i64,
    ) -> Result<bool, ConcurrencyError> {
        let groups = self.resolved_with_limits(descriptor).await?;
        if groups.is_empty() {
            return Ok(true);
        }

        // Check and reserve under a single mutex acquisition.
        {
            let mut h = self.holders.lock().unwrap();
            for (name, id, limit) in &groups {
                let current = h
                    .get(&group_key(name, id))
                    .map(|s| s.len() as u32)
                    .unwrap_or(0);
                // A message already holding the slot (nack redelivery) does
                // not count against the limit twice.
                let already_held = h
                    .get(&group_key(name, id))
                    .map(|s| s.contains(message_id))
                    .unwrap_or(false);
                if !already_held && current >= *limit {
                    return Ok(false);
                }
            }
            for (name, id, _) in &groups {
                let set = h.entry(group_key(name, id)).or_default();
                set.insert(message_id.to_string());
                crate::metrics::CONCURRENCY_HOLDERS
                    .with_label_values(&[name, id])
                    .set(set.len() as i64);
            }
        }

        let holder = HolderRecord {
            granted_at_ms: now_ms,
        };
        let value = encode_holder(&holder)?;
        for (name, id, _) in &groups {
            batch.put(concurrency_holder_key(name, id, message_id).as_bytes(), &value);
        }
        Ok(true)
    }

    /// Revert an in-memory reservation after a failed batch write.
    pub fn rollback_reserve(&self, descriptor: &QueueDescriptor, message_id: &str) {
        let mut h = self.holders.lock().unwrap();
        for (name, id) in self.resolve_groups(descriptor) {
            if let Some(set) = h.get_mut(&group_key(&name, &id)) {
                set.remove(message_id);
            }
        }
    }

    /// Idempotent release of a message from every group. Appends holder
    /// deletions to `batch` and removes the in-memory entries, returning the
    /// groups that actually held the message (for rollback).
    pub async fn release(
        &self,
        batch: &mut WriteBatch,
        descriptor: &QueueDescriptor,
        message_id: &str,
    ) -> Result<Vec<(String, String)>, ConcurrencyError> {
        let groups = self.resolve_groups(descriptor);
        let mut released = Vec::new();
        {
            let mut h = self.holders.lock().unwrap();
            for (name, id) in &groups {
                if let Some(set) = h.get_mut(&group_key(name, id)) {
                    if set.remove(message_id) {
                        released.push((name.clone(), id.clone()));
                        crate::metrics::CONCURRENCY_HOLDERS
                            .with_label_values(&[name, id])
                            .set(set.len() as i64);
                    }
                }
            }
        }
        // Delete durable records unconditionally; deleting an absent key is
        // a no-op, which keeps release safe to call for never-reserved ids.
        for (name, id) in &groups {
            batch.delete(concurrency_holder_key(name, id, message_id).as_bytes());
        }
        Ok(released)
    }

    /// Revert an in-memory release after a failed batch write.
    pub fn rollback_release(&self, released: &[(String, String)], message_id: &str) {
        let mut h = self.holders.lock().unwrap();
        for (name, id) in released {
            h.entry(group_key(name, id))
                .or_default()
                .insert(message_id.to_string());
        }
    }

    /// Minimum free capacity over all groups. `Unbounded` when no groups
    /// gate the queue.
    pub async fn get_available_capacity(
        &self,
        descriptor: &QueueDescriptor,
    ) -> Result<Capacity, ConcurrencyError> {
        let groups = self.resolved_with_limits(descriptor).await?;
        if groups.is_empty() {
            return Ok(Capacity::Unbounded);
        }
        let h = self.holders.lock().unwrap();
        let mut min_free = u32::MAX;
        for (name, id, limit) in &groups {
            let current = h
                .get(&group_key(name, id))
                .map(|s| s.len() as u32)
                .unwrap_or(0);
            min_free = min_free.min(limit.saturating_sub(current));
        }
        Ok(Capacity::Available(min_free))
    }

    pub async fn get_current_concurrency(
        &self,
        group_name: &str,
        group_id: &str,
    ) -> Result<u32, ConcurrencyError> {
        self.ensure_hydrated(group_name, group_id).await?;
        let h = self.holders.lock().unwrap();
        Ok(h.get(&group_key(group_name, group_id))
            .map(|s| s.len() as u32)
            .unwrap_or(0))
    }

    pub async fn get_active_messages(
        &self,
        group_name: &str,
        group_id: &str,
    ) -> Result<Vec<String>, ConcurrencyError> {
        self.ensure_hydrated(group_name, group_id).await?;
        let h = self.holders.lock().unwrap();
        let mut ids: Vec<String> = h
            .get(&group_key(group_name, group_id))
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    pub async fn get_state(
        &self,
        group_name: &str,
        group_id: &str,
    ) -> Result<GroupState, ConcurrencyError> {
        let current = self.get_current_concurrency(group_name, group_id).await?;
        let limit = self.limiter.get_limit(group_name, group_id).await;
        Ok(GroupState {
            group_name: group_name.to_string(),
            group_id: group_id.to_string(),
            current,
            limit,
        })
    }

    /// Forcibly empty a group's active set, durable records included.
    /// Administrative/recovery operation for diverged state.
    pub async fn clear_group(
        &self,
        group_name: &str,
        group_id: &str,
    ) -> Result<u32, ConcurrencyError> {
        self.ensure_hydrated(group_name, group_id).await?;
        let ids = self.get_active_messages(group_name, group_id).await?;

        let mut batch = WriteBatch::new();
        for id in &ids {
            batch.delete(concurrency_holder_key(group_name, group_id, id).as_bytes());
        }
        self.db.write(batch).await?;

        let mut h = self.holders.lock().unwrap();
        if let Some(set) = h.get_mut(&group_key(group_name, group_id)) {
            set.clear();
        }
        tracing::info!(
            group_name = %group_name,
            group_id = %group_id,
            cleared = ids.len(),
            "cleared concurrency group"
        );
        Ok(ids.len() as u32)
    }
}
