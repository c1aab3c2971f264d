//! Distributed debounce: collapses concurrent triggers sharing a key into a
//! single rescheduled run.
//!
//! The state for one (environment, task, debounce key) triple lives in one
//! store record: absent, `Pending(claim_id)` while one caller creates the
//! run, or `Registered(run_id)` once it exists. The store has no native key
//! TTL, so records carry an expiry and expired records read as absent.
//!
//! Claims are check-and-set under one mutex held by the shard's single
//! writer; cross-process claim races are resolved the same way every other
//! admission decision is, by routing all debounce traffic for a shard
//! through its leader. The final run-row mutation is additionally guarded
//! by the run-scoped distributed lock, since the relational store is shared.

use std::sync::Arc;
use std::time::Duration;

use slatedb::{Db, WriteBatch};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::codec::{decode_debounce_record, encode_debounce_record, CodecError};
use crate::coordination::RunLock;
use crate::keys::debounce_key;
use crate::message::{DebounceRecord, DebounceState};
use crate::runs::RunStore;

pub const CLAIM_TTL_MS: i64 = 30_000;
pub const MAX_CLAIM_RETRIES: u32 = 10;
pub const CLAIM_RETRY_DELAY_MS: u64 = 50;

/// Buffer added past `delay_until` when computing a registered key's expiry.
const REGISTERED_TTL_BUFFER_MS: i64 = 60_000;
const MIN_REGISTERED_TTL_MS: i64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum DebounceError {
    #[error(transparent)]
    Slate(#[from] slatedb::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("run store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// What a trigger should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebounceOutcome {
    /// Create a new run. When `claim_id` is set the caller must pass it to
    /// `register_debounced_run` so a raced claim cannot be clobbered.
    New { claim_id: Option<String> },
    /// An existing run absorbs this trigger. `rescheduled` is false when
    /// the requested delay was not later than the run's current one.
    Existing { run_id: String, rescheduled: bool },
    /// Rescheduling would exceed the maximum debounce window measured from
    /// the run's original creation.
    MaxDurationExceeded { run_id: String },
}

#[derive(Debug, Clone)]
pub struct DebounceRequest {
    pub environment_id: String,
    pub task_id: String,
    pub debounce_key: String,
    /// Requested execution time for the (new or existing) run.
    pub delay_until_ms: i64,
    /// Cap on how far an existing run may be pushed, measured from its
    /// `created_at`. `None` disables the cap.
    pub max_debounce_duration_ms: Option<i64>,
}

impl DebounceRequest {
    fn key(&self) -> String {
        debounce_key(&self.environment_id, &self.task_id, &self.debounce_key)
    }
}

pub struct DebounceSystem {
    db: Arc<Db>,
    run_store: Arc<dyn RunStore>,
    run_lock: Arc<dyn RunLock>,
    // Serializes claim check-and-set within the shard writer.
    claim_mutex: Mutex<()>,
}

impl DebounceSystem {
    pub fn new(db: Arc<Db>, run_store: Arc<dyn RunStore>, run_lock: Arc<dyn RunLock>) -> Self {
        Self {
            db,
            run_store,
            run_lock,
            claim_mutex: Mutex::new(()),
        }
    }

    /// Resolve one trigger against the debounce state machine.
    pub async fn handle_debounce(
        &self,
        request: &DebounceRequest,
    ) -> Result<DebounceOutcome, DebounceError> {
        match self.try_claim(request).await? {
            ClaimResult::Claimed(claim_id) => Ok(DebounceOutcome::New {
                claim_id: Some(claim_id),
            }),
            ClaimResult::Pending => self.wait_for_existing_run(request).await,
            ClaimResult::Registered(run_id) => self.reschedule_existing(request, &run_id).await,
        }
    }

    /// Write the run id over the pending marker. With a `claim_id`, aborts
    /// (returns false) unless the record still holds exactly that claim, so
    /// a newer claim or expiry is never clobbered.
    pub async fn register_debounced_run(
        &self,
        request: &DebounceRequest,
        run_id: &str,
        claim_id: Option<&str>,
    ) -> Result<bool, DebounceError> {
        let key = request.key();
        let _guard = self.claim_mutex.lock().await;

        if let Some(expected) = claim_id {
            match self.read_state(&key).await? {
                Some(DebounceState::Pending { claim_id }) if claim_id == expected => {}
                _ => return Ok(false),
            }
        }

        self.write_state(
            &key,
            DebounceState::Registered {
                run_id: run_id.to_string(),
            },
            registered_expiry(request.delay_until_ms),
        )
        .await?;
        Ok(true)
    }

    /// Unconditional delete, called when a debounced run finally dequeues so
    /// the next trigger starts fresh.
    pub async fn clear_debounce_key(&self, request: &DebounceRequest) -> Result<(), DebounceError> {
        self.delete_key(&request.key()).await
    }

    // -----------------------------------------------------------------------

    async fn try_claim(&self, request: &DebounceRequest) -> Result<ClaimResult, DebounceError> {
        let key = request.key();
        let _guard = self.claim_mutex.lock().await;

        match self.read_state(&key).await? {
            None => {
                let claim_id = Uuid::new_v4().to_string();
                self.write_state(
                    &key,
                    DebounceState::Pending {
                        claim_id: claim_id.clone(),
                    },
                    crate::now_epoch_ms() + CLAIM_TTL_MS,
                )
                .await?;
                Ok(ClaimResult::Claimed(claim_id))
            }
            Some(DebounceState::Pending { .. }) => Ok(ClaimResult::Pending),
            Some(DebounceState::Registered { run_id }) => Ok(ClaimResult::Registered(run_id)),
        }
    }

    /// Another caller holds the claim: poll for the run it is creating.
    async fn wait_for_existing_run(
        &self,
        request: &DebounceRequest,
    ) -> Result<DebounceOutcome, DebounceError> {
        let key = request.key();

        for _ in 0..MAX_CLAIM_RETRIES {
            tokio::time::sleep(Duration::from_millis(CLAIM_RETRY_DELAY_MS)).await;
            match self.try_claim(request).await? {
                ClaimResult::Claimed(claim_id) => {
                    // The original claimant expired or cleaned up.
                    return Ok(DebounceOutcome::New {
                        claim_id: Some(claim_id),
                    });
                }
                ClaimResult::Pending => continue,
                ClaimResult::Registered(run_id) => {
                    return self.reschedule_existing(request, &run_id).await;
                }
            }
        }

        // Retries exhausted while still pending: conditionally delete the
        // stale claim. The condition guards against the original claimant
        // having just registered its run.
        let _guard = self.claim_mutex.lock().await;
        match self.read_state(&key).await? {
            Some(DebounceState::Pending { .. }) | None => {
                self.delete_key(&key).await?;
                tracing::warn!(key = %key, "deleted stale pending debounce claim");
                Ok(DebounceOutcome::New { claim_id: None })
            }
            Some(DebounceState::Registered { run_id }) => {
                drop(_guard);
                self.reschedule_existing(request, &run_id).await
            }
        }
    }

    /// A run exists: push its delay later (never earlier) under the run lock.
    async fn reschedule_existing(
        &self,
        request: &DebounceRequest,
        run_id: &str,
    ) -> Result<DebounceOutcome, DebounceError> {
        let key = request.key();
        let _lock = self
            .run_lock
            .lock("debounce", &[run_id.to_string()])
            .await?;

        let Some(run) = self.run_store.get_run(run_id).await? else {
            self.delete_key(&key).await?;
            return Ok(DebounceOutcome::New { claim_id: None });
        };

        if !run.status.is_reschedulable() {
            self.delete_key(&key).await?;
            return Ok(DebounceOutcome::New { claim_id: None });
        }

        if let Some(max_duration) = request.max_debounce_duration_ms {
            if request.delay_until_ms > run.created_at_ms + max_duration {
                self.delete_key(&key).await?;
                return Ok(DebounceOutcome::MaxDurationExceeded {
                    run_id: run_id.to_string(),
                });
            }
        }

        // Debounce only ever pushes execution later.
        let rescheduled = match run.delay_until_ms {
            Some(current) if request.delay_until_ms <= current => false,
            _ => {
                self.run_store
                    .reschedule_run(run_id, request.delay_until_ms)
                    .await?;
                self.write_state(
                    &key,
                    DebounceState::Registered {
                        run_id: run_id.to_string(),
                    },
                    registered_expiry(request.delay_until_ms),
                )
                .await?;
                true
            }
        };

        Ok(DebounceOutcome::Existing {
            run_id: run_id.to_string(),
            rescheduled,
        })
    }

    /// Read the current state, treating expired records as absent.
    async fn read_state(&self, key: &str) -> Result<Option<DebounceState>, DebounceError> {
        let Some(bytes) = self.db.get(key.as_bytes()).await? else {
            return Ok(None);
        };
        let record = decode_debounce_record(&bytes)?;
        if record.expires_at_ms <= crate::now_epoch_ms() {
            return Ok(None);
        }
        Ok(Some(record.state))
    }

    async fn write_state(
        &self,
        key: &str,
        state: DebounceState,
        expires_at_ms: i64,
    ) -> Result<(), DebounceError> {
        let record = DebounceRecord {
            state,
            expires_at_ms,
        };
        let mut batch = WriteBatch::new();
        batch.put(key.as_bytes(), &encode_debounce_record(&record)?);
        self.db.write(batch).await?;
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> Result<(), DebounceError> {
        let mut batch = WriteBatch::new();
        batch.delete(key.as_bytes());
        self.db.write(batch).await?;
        Ok(())
    }
}

enum ClaimResult {
    Claimed(String),
    Pending,
    Registered(String),
}

/// Registered keys outlive the run's delay by a buffer, with a floor so a
/// near-due run still has a readable key while it dequeues.
fn registered_expiry(delay_until_ms: i64) -> i64 {
    let now = crate::now_epoch_ms();
    (delay_until_ms + REGISTERED_TTL_BUFFER_MS).max(now + MIN_REGISTERED_TTL_MS)
}
