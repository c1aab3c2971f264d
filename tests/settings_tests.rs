use std::io::Write;

use weir::settings::{AppConfig, Backend, InsertStrategySetting, WireFormatSetting};

#[test]
fn load_without_a_path_uses_in_memory_defaults() {
    let cfg = AppConfig::load(None).expect("default config");

    assert_eq!(cfg.storage.backend, Backend::Memory);
    assert_eq!(cfg.queue.wire_format, WireFormatSetting::Optimized);
    assert_eq!(cfg.queue.dispatch_batch_size, 10);
    assert_eq!(cfg.queue.concurrency_groups, vec!["tenant".to_string()]);
    assert_eq!(cfg.scheduler.quantum, 1.0);
    assert_eq!(cfg.scheduler.parent_queue_limit, 100);
    assert_eq!(cfg.replication.insert_strategy, InsertStrategySetting::Streaming);
    assert_eq!(cfg.replication.flush_batch_size, 100);
}

#[test]
fn load_parses_a_toml_file_and_fills_omitted_sections() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[storage]
backend = "fs"
path = "/tmp/weir-data"
flush_interval_ms = 50

[queue]
wire_format = "legacy"
default_group_limit = 7

[replication]
slot = "custom_slot"
insert_strategy = "batching"
"#
    )
    .unwrap();

    let cfg = AppConfig::load(Some(file.path())).expect("parse config");

    assert_eq!(cfg.storage.backend, Backend::Fs);
    assert_eq!(cfg.storage.path, "/tmp/weir-data");
    assert_eq!(cfg.storage.flush_interval_ms, Some(50));
    assert_eq!(cfg.queue.wire_format, WireFormatSetting::Legacy);
    assert_eq!(cfg.queue.default_group_limit, 7);
    // Unset queue fields fall back to their defaults.
    assert_eq!(cfg.queue.dequeue_poll_interval_ms, 10);
    assert_eq!(cfg.replication.slot, "custom_slot");
    assert_eq!(cfg.replication.insert_strategy, InsertStrategySetting::Batching);
    assert_eq!(cfg.replication.publication, "weir_runs_pub");
    // Whole sections may be omitted entirely.
    assert_eq!(cfg.scheduler.max_deficit, 10.0);
}

#[test]
fn load_rejects_a_config_missing_the_storage_section() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[queue]\ndispatch_batch_size = 5\n").unwrap();

    assert!(AppConfig::load(Some(file.path())).is_err());
}

#[tokio::test]
async fn open_fs_db_from_config() {
    let tmp = tempfile::tempdir().unwrap();

    let db = weir::storage::open_db(&Backend::Fs, &tmp.path().to_string_lossy(), Some(10))
        .await
        .expect("open db");

    db.put(b"k", b"v").await.expect("put");
    db.flush().await.expect("flush");
    let got = db.get(b"k").await.expect("get");
    assert_eq!(got.unwrap(), slatedb::bytes::Bytes::from_static(b"v"));
}
