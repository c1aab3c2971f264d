//! Assembles begin..commit event sequences into transactions and flushes the
//! changed rows into the columnar store.
//!
//! Out-of-order commits are not supported: one transaction is assembled at a
//! time, matching the upstream's commit-ordered delivery. Transactions with
//! zero events are acknowledged immediately without touching the sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::client::{LogicalReplicationClient, ReplicationEvent};
use super::flush::{ConcurrentFlushScheduler, FlushHandler};
use super::protocol::{
    pg_time_to_unix_ms, version_from_lsn, ColumnValue, LogicalMessage, Lsn, RelationInfo,
};

/// How flushed rows reach the columnar store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStrategy {
    /// Feed each row into the flush scheduler; acknowledgment does not wait
    /// for the insert.
    Streaming,
    /// Flush the whole transaction synchronously before acknowledging.
    /// Stronger durability, higher latency.
    Batching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

/// One flattened changed row, versioned for last-writer-wins resolution in
/// the destination.
#[derive(Debug, Clone)]
pub struct ReplicatedRow {
    pub table: String,
    pub op: RowOp,
    /// Column name to textual value; `None` for NULL or unchanged toast.
    pub fields: Vec<(String, Option<String>)>,
    pub version: u64,
}

/// Bulk insert boundary to the analytical store.
#[async_trait]
pub trait ColumnarSink: Send + Sync {
    async fn insert_rows(&self, rows: Vec<ReplicatedRow>) -> anyhow::Result<()>;
}

/// Recording sink for tests.
#[derive(Default)]
pub struct InMemoryColumnarSink {
    rows: StdMutex<Vec<ReplicatedRow>>,
}

impl InMemoryColumnarSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<ReplicatedRow> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl ColumnarSink for InMemoryColumnarSink {
    async fn insert_rows(&self, rows: Vec<ReplicatedRow>) -> anyhow::Result<()> {
        self.rows.lock().unwrap().extend(rows);
        Ok(())
    }
}

struct SinkFlushHandler {
    sink: Arc<dyn ColumnarSink>,
}

#[async_trait]
impl FlushHandler<ReplicatedRow> for SinkFlushHandler {
    async fn flush(&self, batch: Vec<ReplicatedRow>) -> anyhow::Result<()> {
        self.sink.insert_rows(batch).await
    }
}

struct PendingTransaction {
    xid: u32,
    commit_time_us: i64,
    rows: Vec<ReplicatedRow>,
}

pub struct RunsReplicationService {
    client: Arc<LogicalReplicationClient>,
    scheduler: Arc<ConcurrentFlushScheduler<ReplicatedRow>>,
    strategy: InsertStrategy,
    replication_lag_ms: Arc<AtomicI64>,
    consumer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RunsReplicationService {
    pub fn new(
        client: Arc<LogicalReplicationClient>,
        sink: Arc<dyn ColumnarSink>,
        flush_config: super::flush::FlushConfig,
        strategy: InsertStrategy,
    ) -> Self {
        let scheduler =
            ConcurrentFlushScheduler::new(Arc::new(SinkFlushHandler { sink }), flush_config);
        Self {
            client,
            scheduler,
            strategy,
            replication_lag_ms: Arc::new(AtomicI64::new(0)),
            consumer: tokio::sync::Mutex::new(None),
        }
    }

    /// Last observed commit-to-now lag.
    pub fn replication_lag_ms(&self) -> i64 {
        self.replication_lag_ms.load(Ordering::Relaxed)
    }

    pub fn flush_failure_count(&self) -> u64 {
        self.scheduler.failure_count()
    }

    /// Consume the client's event stream until it closes. Idempotent.
    pub async fn start(&self, mut events: mpsc::Receiver<ReplicationEvent>) {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return;
        }
        self.scheduler.start().await;

        let client = Arc::clone(&self.client);
        let scheduler = Arc::clone(&self.scheduler);
        let strategy = self.strategy;
        let lag = Arc::clone(&self.replication_lag_ms);

        *consumer = Some(tokio::spawn(async move {
            let mut relations: HashMap<u32, RelationInfo> = HashMap::new();
            let mut current: Option<PendingTransaction> = None;

            while let Some(event) = events.recv().await {
                match event {
                    ReplicationEvent::Data { lsn, message, .. } => {
                        handle_message(
                            &client,
                            &scheduler,
                            strategy,
                            &lag,
                            &mut relations,
                            &mut current,
                            lsn,
                            message,
                        )
                        .await;
                    }
                    ReplicationEvent::LeaderElection(is_leader) => {
                        tracing::info!(is_leader, "replication leader election");
                    }
                    ReplicationEvent::Heartbeat { lsn, .. } => {
                        tracing::debug!(lsn = %lsn, "replication heartbeat");
                    }
                    ReplicationEvent::Error(error) => {
                        tracing::error!(error = %error, "replication stream error");
                    }
                    ReplicationEvent::Stopped => break,
                }
            }
        }));
    }

    /// Stop streaming and drain any remaining flush batch.
    pub async fn shutdown(&self) {
        self.client.stop().await;
        if let Some(consumer) = self.consumer.lock().await.take() {
            let _ = consumer.await;
        }
        self.scheduler.shutdown().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_message(
    client: &Arc<LogicalReplicationClient>,
    scheduler: &Arc<ConcurrentFlushScheduler<ReplicatedRow>>,
    strategy: InsertStrategy,
    lag: &Arc<AtomicI64>,
    relations: &mut HashMap<u32, RelationInfo>,
    current: &mut Option<PendingTransaction>,
    lsn: Lsn,
    message: LogicalMessage,
) {
    match message {
        LogicalMessage::Relation(info) => {
            relations.insert(info.id, info);
        }
        LogicalMessage::Begin {
            commit_time_us,
            xid,
            ..
        } => {
            if current.is_some() {
                tracing::warn!(xid, "begin while a transaction is open, discarding previous");
            }
            *current = Some(PendingTransaction {
                xid,
                commit_time_us,
                rows: Vec::new(),
            });
        }
        LogicalMessage::Insert {
            relation_id,
            new_tuple,
        } => {
            if let Some(txn) = current.as_mut() {
                if let Some(row) = build_row(relations, relation_id, RowOp::Insert, &new_tuple) {
                    txn.rows.push(row);
                }
            }
        }
        LogicalMessage::Update {
            relation_id,
            new_tuple,
            ..
        } => {
            if let Some(txn) = current.as_mut() {
                if let Some(row) = build_row(relations, relation_id, RowOp::Update, &new_tuple) {
                    txn.rows.push(row);
                }
            }
        }
        LogicalMessage::Delete {
            relation_id,
            old_tuple,
        } => {
            if let Some(txn) = current.as_mut() {
                if let Some(row) = build_row(relations, relation_id, RowOp::Delete, &old_tuple) {
                    txn.rows.push(row);
                }
            }
        }
        LogicalMessage::Commit {
            commit_lsn,
            end_lsn,
            commit_time_us,
        } => {
            let Some(txn) = current.take() else {
                tracing::warn!(lsn = %lsn, "commit without a begin");
                return;
            };

            let lag_ms = crate::now_epoch_ms() - pg_time_to_unix_ms(commit_time_us);
            lag.store(lag_ms, Ordering::Relaxed);
            crate::metrics::REPLICATION_LAG_MS.set(lag_ms as f64);

            if txn.rows.is_empty() {
                if let Err(e) = client.acknowledge(end_lsn).await {
                    tracing::warn!(error = %e, "empty transaction ack failed");
                }
                return;
            }

            let version = version_from_lsn(commit_lsn);
            let mut rows = txn.rows;
            for row in &mut rows {
                row.version = version;
            }
            tracing::debug!(
                xid = txn.xid,
                rows = rows.len(),
                lsn = %commit_lsn,
                lag_ms,
                "transaction assembled"
            );

            match strategy {
                InsertStrategy::Streaming => {
                    for row in rows {
                        scheduler.add_item(row).await;
                    }
                }
                InsertStrategy::Batching => {
                    if let Err(e) = scheduler.flush_now(rows).await {
                        tracing::error!(error = %e, "synchronous transaction flush failed");
                        return; // do not acknowledge an unflushed transaction
                    }
                }
            }
            if let Err(e) = client.acknowledge(end_lsn).await {
                tracing::warn!(error = %e, "commit ack failed");
            }
        }
    }
}

/// Zip relation column names with tuple values. Rows for relations not yet
/// announced are dropped with a warning; the upstream always sends Relation
/// before the first row of a table.
fn build_row(
    relations: &HashMap<u32, RelationInfo>,
    relation_id: u32,
    op: RowOp,
    tuple: &[ColumnValue],
) -> Option<ReplicatedRow> {
    let Some(relation) = relations.get(&relation_id) else {
        tracing::warn!(relation_id, "row for unknown relation");
        return None;
    };
    let fields = relation
        .columns
        .iter()
        .zip(tuple.iter())
        .map(|(column, value)| {
            let value = match value {
                ColumnValue::Text(text) => Some(text.clone()),
                ColumnValue::Null | ColumnValue::Unchanged => None,
            };
            (column.name.clone(), value)
        })
        .collect();
    Some(ReplicatedRow {
        table: relation.name.clone(),
        op,
        fields,
        version: 0,
    })
}
