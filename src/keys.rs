//! Key naming for every record family in the store.
//!
//! Sorted-set semantics are encoded lexicographically: scores are zero-padded
//! 20-digit millisecond timestamps so that a prefix scan yields members in
//! score order. Index families whose member scores change over time keep a
//! companion member-pointer key so the current entry of a member can be
//! located without a scan.

/// Number of Level-1 dispatch index shards, polled in parallel by consumers.
pub const DISPATCH_SHARD_COUNT: u32 = 4;

/// Zero-pad a millisecond score for lexicographic ordering.
fn score(ms: i64) -> String {
    format!("{:020}", ms.max(0) as u64)
}

// ---------------------------------------------------------------------------
// Per-queue message storage
// ---------------------------------------------------------------------------

/// Storage key for a message within its queue, ordered by score.
pub fn message_key(tenant: &str, queue: &str, score_ms: i64, message_id: &str) -> String {
    format!("msg/{}/{}/{}/{}", tenant, queue, score(score_ms), message_id)
}

/// Prefix covering all messages of one queue.
pub fn message_queue_prefix(tenant: &str, queue: &str) -> String {
    format!("msg/{}/{}/", tenant, queue)
}

/// Stored record for a message, keyed by id alone. Run ids are globally
/// unique, and worker-queue entries do not carry the tenant, so delivery
/// must be able to resolve a record from the id by itself.
pub fn message_id_key(message_id: &str) -> String {
    format!("msgid/{}", message_id)
}

// ---------------------------------------------------------------------------
// Level-1 dispatch index (sharded) and Level-2 tenant queue index
// ---------------------------------------------------------------------------

/// Dispatch index entry: a tenant with pending work. Score is the arrival
/// time of the tenant's oldest work.
pub fn dispatch_key(shard: u32, score_ms: i64, tenant: &str) -> String {
    format!("dispatch/{:03}/{}/{}", shard, score(score_ms), tenant)
}

pub fn dispatch_shard_prefix(shard: u32) -> String {
    format!("dispatch/{:03}/", shard)
}

/// Member pointer: tenant -> score of its current dispatch entry.
pub fn dispatch_member_key(shard: u32, tenant: &str) -> String {
    format!("dim/{:03}/{}", shard, tenant)
}

/// Tenant queue index entry: one non-empty queue of a tenant, ordered by the
/// arrival time of the queue's oldest message.
pub fn tenant_queue_key(tenant: &str, score_ms: i64, queue: &str) -> String {
    format!("tq/{}/{}/{}", tenant, score(score_ms), queue)
}

pub fn tenant_queue_prefix(tenant: &str) -> String {
    format!("tq/{}/", tenant)
}

/// Member pointer: queue -> score of its current tenant-queue-index entry.
pub fn tenant_queue_member_key(tenant: &str, queue: &str) -> String {
    format!("tqm/{}/{}", tenant, queue)
}

// ---------------------------------------------------------------------------
// Worker queues
// ---------------------------------------------------------------------------

/// Worker-queue entry, ordered by enqueue time then a process-local sequence
/// number to keep keys unique within one millisecond.
pub fn worker_queue_key(worker_queue: &str, score_ms: i64, seq: u64) -> String {
    format!("wq/{}/{}/{:010}", worker_queue, score(score_ms), seq)
}

pub fn worker_queue_prefix(worker_queue: &str) -> String {
    format!("wq/{}/", worker_queue)
}

// ---------------------------------------------------------------------------
// Concurrency groups
// ---------------------------------------------------------------------------

/// Holder record key: a message currently in flight under one group.
pub fn concurrency_holder_key(group_name: &str, group_id: &str, message_id: &str) -> String {
    format!("ccy/{}/{}/{}", group_name, group_id, message_id)
}

/// Prefix covering all holders of one group.
pub fn concurrency_group_prefix(group_name: &str, group_id: &str) -> String {
    format!("ccy/{}/{}/", group_name, group_id)
}

/// Parse a holder key back into (group_name, group_id, message_id).
pub fn parse_concurrency_holder_key(key: &[u8]) -> Option<(String, String, String)> {
    let s = std::str::from_utf8(key).ok()?;
    let rest = s.strip_prefix("ccy/")?;
    let mut parts = rest.splitn(3, '/');
    let group_name = parts.next()?.to_string();
    let group_id = parts.next()?.to_string();
    let message_id = parts.next()?.to_string();
    Some((group_name, group_id, message_id))
}

// ---------------------------------------------------------------------------
// Debounce
// ---------------------------------------------------------------------------

/// Claim/registration key for a (env, task, debounce key) triple.
pub fn debounce_key(env_id: &str, task_id: &str, debounce_key: &str) -> String {
    format!("debounce/{}/{}/{}", env_id, task_id, debounce_key)
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

pub fn batch_meta_key(batch_id: &str) -> String {
    format!("batch/meta/{}", batch_id)
}

/// Set-if-absent marker making item enqueue idempotent per (batch, index).
pub fn batch_item_marker_key(batch_id: &str, index: u32) -> String {
    format!("batch/marker/{}/{:06}", batch_id, index)
}

/// Per-item outcome record, ordered by item index for result assembly.
pub fn batch_result_key(batch_id: &str, index: u32) -> String {
    format!("batch/result/{}/{:06}", batch_id, index)
}

pub fn batch_result_prefix(batch_id: &str) -> String {
    format!("batch/result/{}/", batch_id)
}

/// Remaining-item counter record for a batch.
pub fn batch_remaining_key(batch_id: &str) -> String {
    format!("batch/remaining/{}", batch_id)
}

/// Prefixes covering every transient record of one batch.
pub fn batch_transient_prefixes(batch_id: &str) -> [String; 2] {
    [
        format!("batch/marker/{}/", batch_id),
        format!("batch/result/{}/", batch_id),
    ]
}

// ---------------------------------------------------------------------------
// Legacy master queue (pre-migration)
// ---------------------------------------------------------------------------

/// The old single-level master queue, drained opportunistically after the
/// two-level index deploy so pre-deploy messages are not stranded.
pub fn master_queue_key(score_ms: i64, member: &str) -> String {
    format!("master/{}/{}", score(score_ms), member)
}

pub fn master_queue_prefix() -> String {
    "master/".to_string()
}

// ---------------------------------------------------------------------------
// Scan helpers
// ---------------------------------------------------------------------------

/// Exclusive end bound for a prefix scan.
pub fn end_bound(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    end.push(0xFF);
    end
}

/// Extract the zero-padded score segment directly following a prefix, e.g.
/// the `{:020}` component of `dispatch/000/<score>/<tenant>`.
pub fn parse_score_after_prefix(key: &str, prefix: &str) -> Option<i64> {
    let rest = key.strip_prefix(prefix)?;
    let score_part = rest.split('/').next()?;
    score_part.parse::<u64>().ok().map(|v| v as i64)
}

/// Final path segment of a key. Member names sit last in every index family.
pub fn last_segment(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Dispatch shard for a tenant. Stable so removal finds the entry that
/// enqueue inserted.
pub fn dispatch_shard_for_tenant(tenant: &str) -> u32 {
    (fnv1a64(tenant.as_bytes()) % DISPATCH_SHARD_COUNT as u64) as u32
}

pub(crate) fn fnv1a64(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x00000100000001B3;
    let mut hash = FNV_OFFSET;
    for b in data {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
