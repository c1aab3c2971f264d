//! CDC consumer: leader election, stream parsing, heartbeat and ack loops.
//!
//! One instance per process; only the elected leader streams. Non-leader
//! instances report `LeaderElection(false)` and idle, which is expected
//! steady state for replicas. The client does not auto-reconnect; the
//! embedding service decides whether to re-subscribe after an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::coordination::LeaderLock;

use super::protocol::{
    encode_standby_status_update, parse_logical_message, parse_replication_message,
    pg_time_to_unix_ms, LogicalMessage, Lsn, ReplicationMessage,
};
use super::stream::ReplicationConnection;

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error(transparent)]
    Protocol(#[from] super::protocol::ProtocolError),
    #[error("connection error: {0}")]
    Connection(#[from] anyhow::Error),
}

/// Typed event stream consumed in order by a single receiver.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    LeaderElection(bool),
    Data {
        lsn: Lsn,
        message: LogicalMessage,
        parse_duration_us: u64,
    },
    Heartbeat {
        lsn: Lsn,
        timestamp_ms: i64,
        reply_requested: bool,
    },
    Error(String),
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ReplicationClientConfig {
    pub slot: String,
    pub publication: String,
    pub leader_lock_name: String,
    pub leader_lock_timeout_ms: u64,
    pub leader_lock_retry_count: u32,
    pub leader_lock_retry_interval_ms: u64,
    pub leader_lock_extend_interval_ms: u64,
    /// Re-acknowledge the last LSN when no natural ack happened within this
    /// window, preventing slot bloat during idle periods.
    pub ack_interval_ms: u64,
    /// Acknowledge each data message as soon as it is emitted.
    pub auto_acknowledge: bool,
}

impl Default for ReplicationClientConfig {
    fn default() -> Self {
        Self {
            slot: "weir_runs_slot".to_string(),
            publication: "weir_runs_pub".to_string(),
            leader_lock_name: "weir:replication:leader".to_string(),
            leader_lock_timeout_ms: 30_000,
            leader_lock_retry_count: 5,
            leader_lock_retry_interval_ms: 500,
            leader_lock_extend_interval_ms: 10_000,
            ack_interval_ms: 10_000,
            auto_acknowledge: true,
        }
    }
}

pub struct LogicalReplicationClient {
    connection: Arc<dyn ReplicationConnection>,
    leader_lock: Arc<dyn LeaderLock>,
    config: ReplicationClientConfig,
    owner: String,
    events: mpsc::Sender<ReplicationEvent>,
    last_lsn: Arc<Mutex<Lsn>>,
    last_acked_lsn: Arc<Mutex<Lsn>>,
    last_ack_at_ms: Arc<Mutex<i64>>,
    stopped: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LogicalReplicationClient {
    /// Build the client and the single consumer's event receiver.
    pub fn new(
        connection: Arc<dyn ReplicationConnection>,
        leader_lock: Arc<dyn LeaderLock>,
        config: ReplicationClientConfig,
    ) -> (Arc<Self>, mpsc::Receiver<ReplicationEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        let client = Arc::new(Self {
            connection,
            leader_lock,
            config,
            owner: Uuid::new_v4().to_string(),
            events: tx,
            last_lsn: Arc::new(Mutex::new(Lsn::default())),
            last_acked_lsn: Arc::new(Mutex::new(Lsn::default())),
            last_ack_at_ms: Arc::new(Mutex::new(0)),
            stopped: Arc::new(AtomicBool::new(true)),
            tasks: Mutex::new(Vec::new()),
        });
        (client, rx)
    }

    pub async fn last_lsn(&self) -> Lsn {
        *self.last_lsn.lock().await
    }

    pub async fn last_acknowledged_lsn(&self) -> Lsn {
        *self.last_acked_lsn.lock().await
    }

    /// Attempt leadership and start streaming from `start_lsn` (or the last
    /// known position). Returns false when leadership was not won.
    pub async fn subscribe(
        self: &Arc<Self>,
        start_lsn: Option<Lsn>,
    ) -> Result<bool, ReplicationError> {
        self.stop().await;
        self.stopped.store(false, Ordering::SeqCst);

        if !self.acquire_leadership().await? {
            self.emit(ReplicationEvent::LeaderElection(false)).await;
            self.stopped.store(true, Ordering::SeqCst);
            return Ok(false);
        }
        self.emit(ReplicationEvent::LeaderElection(true)).await;

        if let Some(lsn) = start_lsn {
            *self.last_lsn.lock().await = lsn;
        }
        let resume_from = *self.last_lsn.lock().await;

        self.connection
            .ensure_publication_and_slot(&self.config.publication, &self.config.slot)
            .await?;
        self.connection
            .start_replication(&self.config.slot, &self.config.publication, resume_from)
            .await?;

        self.spawn_heartbeat();
        self.spawn_ack_timer();
        self.spawn_stream_loop();
        tracing::info!(slot = %self.config.slot, lsn = %resume_from, "replication subscribed");
        Ok(true)
    }

    /// Encode and send a standby status update. Acknowledged positions are
    /// monotonic: a stale LSN is dropped, not sent.
    pub async fn acknowledge(&self, lsn: Lsn) -> Result<(), ReplicationError> {
        {
            let last = *self.last_acked_lsn.lock().await;
            if lsn < last {
                return Ok(());
            }
        }
        let payload =
            encode_standby_status_update(lsn, lsn, lsn, crate::now_epoch_ms(), false);
        self.connection.send_status_update(payload).await?;
        *self.last_acked_lsn.lock().await = lsn;
        *self.last_ack_at_ms.lock().await = crate::now_epoch_ms();
        Ok(())
    }

    /// Tear down timers, release leadership, close the connection.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().await;
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        if let Err(e) = self
            .leader_lock
            .release(&self.config.leader_lock_name, &self.owner)
            .await
        {
            tracing::warn!(error = %e, "failed to release replication leader lock");
        }
        if let Err(e) = self.connection.close().await {
            tracing::warn!(error = %e, "failed to close replication connection");
        }
        self.emit(ReplicationEvent::Stopped).await;
    }

    /// Stop and drop the replication slot. Destructive.
    pub async fn teardown(&self) -> Result<(), ReplicationError> {
        self.stop().await;
        self.connection.drop_slot(&self.config.slot).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------

    async fn acquire_leadership(&self) -> Result<bool, ReplicationError> {
        for attempt in 0..=self.config.leader_lock_retry_count {
            if self
                .leader_lock
                .try_acquire(
                    &self.config.leader_lock_name,
                    &self.owner,
                    self.config.leader_lock_timeout_ms,
                )
                .await?
            {
                return Ok(true);
            }
            if attempt < self.config.leader_lock_retry_count {
                tokio::time::sleep(Duration::from_millis(
                    self.config.leader_lock_retry_interval_ms,
                ))
                .await;
            }
        }
        Ok(false)
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                client.config.leader_lock_extend_interval_ms,
            ));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.stopped.load(Ordering::SeqCst) {
                    break;
                }
                match client
                    .leader_lock
                    .extend(
                        &client.config.leader_lock_name,
                        &client.owner,
                        client.config.leader_lock_timeout_ms,
                    )
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        client
                            .emit(ReplicationEvent::Error("leader lock lost".to_string()))
                            .await;
                        client.stop().await;
                        break;
                    }
                    Err(e) => {
                        client
                            .emit(ReplicationEvent::Error(format!(
                                "leader lock extend failed: {}",
                                e
                            )))
                            .await;
                        client.stop().await;
                        break;
                    }
                }
            }
        });
        self.register_task(handle);
    }

    fn spawn_ack_timer(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let interval_ms = client.config.ack_interval_ms;
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let idle_for = crate::now_epoch_ms() - *client.last_ack_at_ms.lock().await;
                if idle_for >= interval_ms as i64 {
                    let lsn = *client.last_lsn.lock().await;
                    if lsn != Lsn::default() {
                        if let Err(e) = client.acknowledge(lsn).await {
                            tracing::warn!(error = %e, "idle re-acknowledge failed");
                        }
                    }
                }
            }
        });
        self.register_task(handle);
    }

    fn spawn_stream_loop(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                if client.stopped.load(Ordering::SeqCst) {
                    break;
                }
                match client.connection.next_chunk().await {
                    Ok(Some(chunk)) => {
                        // Per-chunk containment: a malformed message is
                        // surfaced as an error event, not a stream crash.
                        if let Err(e) = client.handle_chunk(&chunk).await {
                            client.emit(ReplicationEvent::Error(e.to_string())).await;
                        }
                    }
                    Ok(None) => {
                        client.stop().await;
                        break;
                    }
                    Err(e) => {
                        client.emit(ReplicationEvent::Error(e.to_string())).await;
                        client.stop().await;
                        break;
                    }
                }
            }
        });
        self.register_task(handle);
    }

    async fn handle_chunk(&self, chunk: &[u8]) -> Result<(), ReplicationError> {
        match parse_replication_message(chunk)? {
            ReplicationMessage::XLogData {
                wal_start, payload, ..
            } => {
                let started = std::time::Instant::now();
                let message = parse_logical_message(&payload)?;
                let parse_duration_us = started.elapsed().as_micros() as u64;

                {
                    let mut last = self.last_lsn.lock().await;
                    if wal_start > *last {
                        *last = wal_start;
                    }
                }
                self.emit(ReplicationEvent::Data {
                    lsn: wal_start,
                    message,
                    parse_duration_us,
                })
                .await;

                if self.config.auto_acknowledge {
                    self.acknowledge(wal_start).await?;
                }
            }
            ReplicationMessage::PrimaryKeepalive {
                wal_end,
                send_time_us,
                reply_requested,
            } => {
                self.emit(ReplicationEvent::Heartbeat {
                    lsn: wal_end,
                    timestamp_ms: pg_time_to_unix_ms(send_time_us),
                    reply_requested,
                })
                .await;
                if reply_requested {
                    let lsn = *self.last_acked_lsn.lock().await;
                    let payload = encode_standby_status_update(
                        lsn,
                        lsn,
                        lsn,
                        crate::now_epoch_ms(),
                        false,
                    );
                    self.connection.send_status_update(payload).await?;
                }
            }
        }
        Ok(())
    }

    async fn emit(&self, event: ReplicationEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("replication event receiver dropped");
        }
    }

    fn register_task(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            tasks.push(handle);
        }
    }
}
