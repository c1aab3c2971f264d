//! Boundary contract to the streaming-replication upstream.
//!
//! Production wires this to a replication-mode database connection. The
//! in-memory implementation feeds scripted chunks and records status
//! updates, which is what the protocol and service tests run against.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::protocol::Lsn;

#[async_trait]
pub trait ReplicationConnection: Send + Sync {
    /// Idempotently create the publication and replication slot.
    async fn ensure_publication_and_slot(
        &self,
        publication: &str,
        slot: &str,
    ) -> anyhow::Result<()>;

    /// Issue START_REPLICATION from `start_lsn`.
    async fn start_replication(
        &self,
        slot: &str,
        publication: &str,
        start_lsn: Lsn,
    ) -> anyhow::Result<()>;

    /// Next raw copy-data chunk. `None` means the upstream closed cleanly.
    async fn next_chunk(&self) -> anyhow::Result<Option<Vec<u8>>>;

    /// Write an encoded standby status update on the connection.
    async fn send_status_update(&self, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Drop the replication slot. Destructive, used for decommissioning.
    async fn drop_slot(&self, slot: &str) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Scripted upstream for tests.
pub struct InMemoryReplicationConnection {
    chunks: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    status_updates: Mutex<Vec<Vec<u8>>>,
    slot_dropped: Mutex<bool>,
}

impl InMemoryReplicationConnection {
    /// Returns the connection and the sender used to script chunks.
    pub fn new() -> (Self, mpsc::UnboundedSender<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                chunks: tokio::sync::Mutex::new(rx),
                status_updates: Mutex::new(Vec::new()),
                slot_dropped: Mutex::new(false),
            },
            tx,
        )
    }

    /// Raw status updates written so far, oldest first.
    pub fn status_updates(&self) -> Vec<Vec<u8>> {
        self.status_updates.lock().unwrap().clone()
    }

    /// Flushed-position LSNs extracted from the recorded status updates.
    pub fn acknowledged_lsns(&self) -> Vec<Lsn> {
        self.status_updates
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.len() >= 25 && u[0] == b'r')
            .map(|u| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&u[9..17]);
                Lsn(u64::from_be_bytes(bytes))
            })
            .collect()
    }

    pub fn slot_dropped(&self) -> bool {
        *self.slot_dropped.lock().unwrap()
    }
}

#[async_trait]
impl ReplicationConnection for InMemoryReplicationConnection {
    async fn ensure_publication_and_slot(
        &self,
        _publication: &str,
        _slot: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start_replication(
        &self,
        _slot: &str,
        _publication: &str,
        _start_lsn: Lsn,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn next_chunk(&self) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.chunks.lock().await.recv().await)
    }

    async fn send_status_update(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        self.status_updates.lock().unwrap().push(payload);
        Ok(())
    }

    async fn drop_slot(&self, _slot: &str) -> anyhow::Result<()> {
        *self.slot_dropped.lock().unwrap() = true;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
