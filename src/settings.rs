use std::fs;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub log_format: LogFormat,
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub replication: ReplicationSettings,
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub backend: Backend,
    pub path: String,
    /// Memtable flush interval override, in milliseconds.
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Fs,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    #[serde(default = "default_wire_format")]
    pub wire_format: WireFormatSetting,
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: usize,
    #[serde(default = "default_dequeue_poll_interval_ms")]
    pub dequeue_poll_interval_ms: u64,
    /// Concurrency group names, in declaration order.
    #[serde(default = "default_groups")]
    pub concurrency_groups: Vec<String>,
    #[serde(default = "default_group_limit")]
    pub default_group_limit: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WireFormatSetting {
    Legacy,
    Optimized,
}

fn default_wire_format() -> WireFormatSetting {
    WireFormatSetting::Optimized
}
fn default_dispatch_batch_size() -> usize {
    10
}
fn default_dequeue_poll_interval_ms() -> u64 {
    10
}
fn default_groups() -> Vec<String> {
    vec!["tenant".to_string()]
}
fn default_group_limit() -> u32 {
    25
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            wire_format: default_wire_format(),
            dispatch_batch_size: default_dispatch_batch_size(),
            dequeue_poll_interval_ms: default_dequeue_poll_interval_ms(),
            concurrency_groups: default_groups(),
            default_group_limit: default_group_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerSettings {
    #[serde(default = "default_quantum")]
    pub quantum: f64,
    #[serde(default = "default_max_deficit")]
    pub max_deficit: f64,
    #[serde(default = "default_parent_queue_limit")]
    pub parent_queue_limit: usize,
    #[serde(default)]
    pub concurrency_limit_bias: f64,
    #[serde(default)]
    pub available_capacity_bias: f64,
    #[serde(default)]
    pub queue_age_randomization: f64,
    #[serde(default)]
    pub reuse_snapshot_count: u32,
    #[serde(default)]
    pub maximum_env_count: Option<usize>,
}

fn default_quantum() -> f64 {
    1.0
}
fn default_max_deficit() -> f64 {
    10.0
}
fn default_parent_queue_limit() -> usize {
    100
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            quantum: default_quantum(),
            max_deficit: default_max_deficit(),
            parent_queue_limit: default_parent_queue_limit(),
            concurrency_limit_bias: 0.0,
            available_capacity_bias: 0.0,
            queue_age_randomization: 0.0,
            reuse_snapshot_count: 0,
            maximum_env_count: None,
        }
    }
}

impl SchedulerSettings {
    pub fn to_config(&self, seed: Option<u64>) -> crate::scheduler::SchedulerConfig {
        crate::scheduler::SchedulerConfig {
            quantum: self.quantum,
            max_deficit: self.max_deficit,
            parent_queue_limit: self.parent_queue_limit,
            concurrency_limit_bias: self.concurrency_limit_bias,
            available_capacity_bias: self.available_capacity_bias,
            queue_age_randomization: self.queue_age_randomization,
            reuse_snapshot_count: self.reuse_snapshot_count,
            maximum_env_count: self.maximum_env_count,
            seed,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplicationSettings {
    #[serde(default = "default_slot")]
    pub slot: String,
    #[serde(default = "default_publication")]
    pub publication: String,
    #[serde(default = "default_insert_strategy")]
    pub insert_strategy: InsertStrategySetting,
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_flush_concurrency")]
    pub flush_max_concurrency: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InsertStrategySetting {
    Streaming,
    Batching,
}

fn default_slot() -> String {
    "weir_runs_slot".to_string()
}
fn default_publication() -> String {
    "weir_runs_pub".to_string()
}
fn default_insert_strategy() -> InsertStrategySetting {
    InsertStrategySetting::Streaming
}
fn default_flush_batch_size() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    250
}
fn default_flush_concurrency() -> usize {
    4
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            slot: default_slot(),
            publication: default_publication(),
            insert_strategy: default_insert_strategy(),
            flush_batch_size: default_flush_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_max_concurrency: default_flush_concurrency(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self {
                log_format: LogFormat::Text,
                storage: StorageConfig {
                    backend: Backend::Memory,
                    path: "weir".to_string(),
                    flush_interval_ms: None,
                },
                queue: QueueSettings::default(),
                scheduler: SchedulerSettings::default(),
                replication: ReplicationSettings::default(),
            }),
        }
    }
}
