//! Boundary contract to the relational run store.
//!
//! Debounce only needs two things from run rows: a point-in-time snapshot
//! and a delay-until update. The in-memory implementation backs the tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Delayed,
    RunCreated,
    Executing,
    Completed,
    Canceled,
}

impl RunStatus {
    /// Only runs still waiting to start can be rescheduled by debounce.
    pub fn is_reschedulable(&self) -> bool {
        matches!(self, RunStatus::Delayed | RunStatus::RunCreated)
    }
}

#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub created_at_ms: i64,
    pub delay_until_ms: Option<i64>,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get_run(&self, run_id: &str) -> anyhow::Result<Option<RunSnapshot>>;

    async fn reschedule_run(&self, run_id: &str, delay_until_ms: i64) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<String, RunSnapshot>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: RunSnapshot) {
        self.runs
            .lock()
            .unwrap()
            .insert(snapshot.run_id.clone(), snapshot);
    }

    pub fn set_status(&self, run_id: &str, status: RunStatus) {
        if let Some(run) = self.runs.lock().unwrap().get_mut(run_id) {
            run.status = status;
        }
    }

    pub fn remove(&self, run_id: &str) {
        self.runs.lock().unwrap().remove(run_id);
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn get_run(&self, run_id: &str) -> anyhow::Result<Option<RunSnapshot>> {
        Ok(self.runs.lock().unwrap().get(run_id).cloned())
    }

    async fn reschedule_run(&self, run_id: &str, delay_until_ms: i64) -> anyhow::Result<()> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.get_mut(run_id) {
            run.delay_until_ms = Some(delay_until_ms);
        }
        Ok(())
    }
}
