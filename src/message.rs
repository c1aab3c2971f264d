//! Core message and queue data types.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

/// Environment type of the tenant a run belongs to. Carried on every wire
/// entry so workers can route without a tenant lookup.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize, Serialize, Deserialize,
)]
#[archive(check_bytes)]
pub enum EnvironmentType {
    Production,
    Staging,
    Development,
    Preview,
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Production => "PRODUCTION",
            EnvironmentType::Staging => "STAGING",
            EnvironmentType::Development => "DEVELOPMENT",
            EnvironmentType::Preview => "PREVIEW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PRODUCTION" => Some(EnvironmentType::Production),
            "STAGING" => Some(EnvironmentType::Staging),
            "DEVELOPMENT" => Some(EnvironmentType::Development),
            "PREVIEW" => Some(EnvironmentType::Preview),
            _ => None,
        }
    }
}

/// Logical identity of a queue. Immutable per enqueue call; `metadata`
/// carries the auxiliary ids concurrency group extraction reads.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct QueueDescriptor {
    pub id: String,
    pub tenant_id: String,
    /// Auxiliary fields, e.g. ("org", org_id) used by group extraction.
    pub metadata: Vec<(String, String)>,
}

impl QueueDescriptor {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            metadata: Vec::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A message owned by the per-queue storage hash. Created on enqueue,
/// attempt incremented on nack, deleted on completion.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct StoredMessage {
    pub id: String,
    pub queue_id: String,
    pub tenant_id: String,
    /// Opaque payload bytes (JSON-encoded by the caller).
    pub payload: Vec<u8>,
    pub timestamp_ms: i64,
    pub attempt: u32,
    pub worker_queue: String,
    pub environment_type: EnvironmentType,
    /// Auxiliary descriptor metadata, carried for group extraction on ack.
    pub metadata: Vec<(String, String)>,
}

/// Holder record for a concurrency group slot.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct HolderRecord {
    pub granted_at_ms: i64,
}

/// Immutable metadata written by `initialize_batch`, deleted after the
/// completion result is finalized.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct BatchMeta {
    pub batch_id: String,
    pub friendly_id: String,
    pub environment_id: String,
    pub environment_type: EnvironmentType,
    pub organization_id: String,
    pub project_id: String,
    pub run_count: u32,
    pub parent_run_id: Option<String>,
    pub resume_parent_on_completion: bool,
    pub trigger_version: Option<String>,
    pub span_parent_as_link: bool,
    pub idempotency_key: Option<String>,
}

/// One batch item as supplied by the caller.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct BatchItem {
    pub task: String,
    pub payload: Vec<u8>,
    pub payload_type: Option<String>,
    pub options: Vec<(String, String)>,
}

/// Durable outcome of processing one batch item.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum BatchItemOutcome {
    Success {
        index: u32,
        run_id: String,
    },
    Failure {
        index: u32,
        error: String,
        error_code: String,
        task_identifier: String,
    },
}

/// Remaining-item counter for a batch.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct BatchRemaining {
    pub remaining: u32,
}

/// Debounce key state. Expiry is a record field because the store has no
/// native key TTL; expired records read as absent.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum DebounceState {
    /// One caller has claimed the right to create a new run.
    Pending { claim_id: String },
    /// A run exists and its delayed execution may still be pushed later.
    Registered { run_id: String },
}

#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct DebounceRecord {
    pub state: DebounceState,
    pub expires_at_ms: i64,
}
