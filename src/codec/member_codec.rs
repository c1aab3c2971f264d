//! Wire formats for queue members and worker-queue entries.
//!
//! Two representations coexist at runtime during a deploy migration window:
//!
//! - Legacy: a bare run id. The full payload lives in a separate message
//!   record keyed `{org}:message:{run_id}`.
//! - Optimized: a single self-describing packed string carrying
//!   `run_id, worker_queue, attempt, environment_type` (worker-queue entries
//!   additionally `queue_key, timestamp`) with no separate message lookup.
//!
//! Detection is structural sniffing, never a configuration flag: a queue
//! configured for the optimized format must still decode legacy members
//! already in flight. The `|` separator is reserved; run ids, environment
//! types and attempt counters never contain it, and worker queue / queue key
//! names are validated at enqueue.

use crate::codec::CodecError;
use crate::message::EnvironmentType;

const OPTIMIZED_PREFIX: &str = "v3|";

/// Fields packed into an optimized queue member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedQueueMember {
    pub run_id: String,
    pub worker_queue: String,
    pub attempt: u32,
    pub environment_type: EnvironmentType,
}

/// Fields packed into an optimized worker-queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedWorkerQueueEntry {
    pub run_id: String,
    pub worker_queue: String,
    pub attempt: u32,
    pub environment_type: EnvironmentType,
    pub queue_key: String,
    pub timestamp_ms: i64,
}

/// A member of a per-tenant queue, in either wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMember {
    Legacy(String),
    Optimized(EncodedQueueMember),
}

impl QueueMember {
    pub fn run_id(&self) -> &str {
        match self {
            QueueMember::Legacy(run_id) => run_id,
            QueueMember::Optimized(m) => &m.run_id,
        }
    }
}

/// An entry on a worker delivery queue, in either wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerQueueEntry {
    Legacy(String),
    Optimized(EncodedWorkerQueueEntry),
}

impl WorkerQueueEntry {
    pub fn run_id(&self) -> &str {
        match self {
            WorkerQueueEntry::Legacy(run_id) => run_id,
            WorkerQueueEntry::Optimized(m) => &m.run_id,
        }
    }
}

/// Structural sniff: does this raw member carry the optimized queue-member
/// packing?
pub fn is_encoded_queue_member(raw: &str) -> bool {
    raw.starts_with(OPTIMIZED_PREFIX) && raw.split('|').count() == 5
}

/// Structural sniff: does this raw entry carry the optimized worker-queue
/// packing?
pub fn is_encoded_worker_queue_entry(raw: &str) -> bool {
    raw.starts_with(OPTIMIZED_PREFIX) && raw.split('|').count() == 7
}

pub fn encode_queue_member(member: &EncodedQueueMember) -> String {
    format!(
        "v3|{}|{}|{}|{}",
        member.run_id,
        member.worker_queue,
        member.attempt,
        member.environment_type.as_str()
    )
}

/// Decode a raw queue member, accepting both formats.
pub fn decode_queue_member(raw: &str) -> Result<QueueMember, CodecError> {
    if !is_encoded_queue_member(raw) {
        if raw.contains('|') {
            return Err(CodecError::MalformedEntry(format!(
                "queue member is neither legacy nor optimized: {:?}",
                raw
            )));
        }
        return Ok(QueueMember::Legacy(raw.to_string()));
    }
    let mut parts = raw.split('|');
    let _marker = parts.next();
    let run_id = parts.next().unwrap_or_default().to_string();
    let worker_queue = parts.next().unwrap_or_default().to_string();
    let attempt = parts
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or_else(|| CodecError::MalformedEntry(format!("bad attempt in {:?}", raw)))?;
    let environment_type = parts
        .next()
        .and_then(EnvironmentType::parse)
        .ok_or_else(|| CodecError::MalformedEntry(format!("bad environment type in {:?}", raw)))?;
    Ok(QueueMember::Optimized(EncodedQueueMember {
        run_id,
        worker_queue,
        attempt,
        environment_type,
    }))
}

pub fn encode_worker_queue_entry(entry: &EncodedWorkerQueueEntry) -> String {
    format!(
        "v3|{}|{}|{}|{}|{}|{}",
        entry.run_id,
        entry.worker_queue,
        entry.attempt,
        entry.environment_type.as_str(),
        entry.queue_key,
        entry.timestamp_ms
    )
}

/// Decode a raw worker-queue entry, accepting both formats.
pub fn decode_worker_queue_entry(raw: &str) -> Result<WorkerQueueEntry, CodecError> {
    if !is_encoded_worker_queue_entry(raw) {
        if raw.contains('|') {
            return Err(CodecError::MalformedEntry(format!(
                "worker queue entry is neither legacy nor optimized: {:?}",
                raw
            )));
        }
        return Ok(WorkerQueueEntry::Legacy(raw.to_string()));
    }
    let mut parts = raw.split('|');
    let _marker = parts.next();
    let run_id = parts.next().unwrap_or_default().to_string();
    let worker_queue = parts.next().unwrap_or_default().to_string();
    let attempt = parts
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or_else(|| CodecError::MalformedEntry(format!("bad attempt in {:?}", raw)))?;
    let environment_type = parts
        .next()
        .and_then(EnvironmentType::parse)
        .ok_or_else(|| CodecError::MalformedEntry(format!("bad environment type in {:?}", raw)))?;
    let queue_key = parts.next().unwrap_or_default().to_string();
    let timestamp_ms = parts
        .next()
        .and_then(|p| p.parse::<i64>().ok())
        .ok_or_else(|| CodecError::MalformedEntry(format!("bad timestamp in {:?}", raw)))?;
    Ok(WorkerQueueEntry::Optimized(EncodedWorkerQueueEntry {
        run_id,
        worker_queue,
        attempt,
        environment_type,
        queue_key,
        timestamp_ms,
    }))
}

/// Reject names that would collide with the packed separator.
pub fn validate_wire_name(name: &str) -> Result<(), CodecError> {
    if name.contains('|') {
        return Err(CodecError::MalformedEntry(format!(
            "name {:?} contains the reserved separator '|'",
            name
        )));
    }
    Ok(())
}
