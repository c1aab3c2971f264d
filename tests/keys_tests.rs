use weir::keys::{
    batch_item_marker_key, batch_result_key, concurrency_holder_key, dispatch_key,
    dispatch_shard_for_tenant, end_bound, last_segment, master_queue_key, message_key,
    message_queue_prefix, parse_concurrency_holder_key, parse_score_after_prefix,
    tenant_queue_key, worker_queue_key, DISPATCH_SHARD_COUNT,
};

#[test]
fn message_keys_sort_by_score_then_id() {
    let k1 = message_key("t1", "q1", 1_000, "run-a");
    let k2 = message_key("t1", "q1", 2_000, "run-b");
    let k3 = message_key("t1", "q1", 1_000, "run-z");
    assert!(k1 < k2);
    assert!(k1 < k3);
    assert!(k3 < k2);
}

#[test]
fn score_padding_survives_large_timestamps() {
    // A 13-digit epoch-ms score must not sort before a small one.
    let old = message_key("t", "q", 5, "a");
    let new = message_key("t", "q", 1_700_000_000_000, "a");
    assert!(old < new);
}

#[test]
fn negative_scores_clamp_to_zero() {
    let clamped = message_key("t", "q", -50, "a");
    let zero = message_key("t", "q", 0, "a");
    assert_eq!(clamped, zero);
}

#[test]
fn worker_queue_keys_sort_by_score_then_sequence() {
    let k1 = worker_queue_key("main", 1_000, 1);
    let k2 = worker_queue_key("main", 1_000, 2);
    let k3 = worker_queue_key("main", 999, 900);
    assert!(k1 < k2);
    assert!(k3 < k1);
}

#[test]
fn end_bound_covers_all_members_of_prefix() {
    let prefix = message_queue_prefix("t1", "q1");
    let end = end_bound(&prefix);
    let member = message_key("t1", "q1", i64::MAX, "zzz").into_bytes();
    assert!(member >= prefix.clone().into_bytes());
    assert!(member < end);
    // Sibling queues fall outside the bound
    let sibling = message_key("t1", "q2", 0, "a").into_bytes();
    assert!(sibling >= end || sibling < prefix.into_bytes());
}

#[test]
fn shard_assignment_is_stable_and_in_range() {
    for tenant in ["env_1", "env_2", "org-abc", ""] {
        let shard = dispatch_shard_for_tenant(tenant);
        assert!(shard < DISPATCH_SHARD_COUNT);
        assert_eq!(shard, dispatch_shard_for_tenant(tenant));
    }
}

#[test]
fn dispatch_keys_order_tenants_by_oldest_work() {
    let k1 = dispatch_key(0, 1_000, "env_b");
    let k2 = dispatch_key(0, 2_000, "env_a");
    assert!(k1 < k2);
}

#[test]
fn concurrency_holder_key_roundtrip() {
    let key = concurrency_holder_key("tenant", "env_1", "run_42");
    let (name, id, message_id) = parse_concurrency_holder_key(key.as_bytes()).unwrap();
    assert_eq!(name, "tenant");
    assert_eq!(id, "env_1");
    assert_eq!(message_id, "run_42");
}

#[test]
fn parse_score_recovers_timestamp() {
    let key = tenant_queue_key("env_1", 123_456, "my-queue");
    let score = parse_score_after_prefix(&key, "tq/env_1/").unwrap();
    assert_eq!(score, 123_456);
}

#[test]
fn batch_keys_sort_by_item_index() {
    let k1 = batch_result_key("batch_1", 2);
    let k2 = batch_result_key("batch_1", 10);
    assert!(k1 < k2);
    let m1 = batch_item_marker_key("batch_1", 2);
    let m2 = batch_item_marker_key("batch_1", 10);
    assert!(m1 < m2);
}

#[test]
fn last_segment_extracts_member() {
    let key = master_queue_key(1_000, "run_7");
    assert_eq!(last_segment(&key), "run_7");
    assert_eq!(last_segment("no-slashes"), "no-slashes");
}
