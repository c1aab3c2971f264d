//! Prometheus instruments for the queueing and replication subsystems.
//!
//! The crate is a library; the embedding service owns the `/metrics`
//! endpoint and scrapes [`REGISTRY`].

use std::sync::LazyLock;

use prometheus::{Gauge, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry};

/// Histogram buckets for queue wait times (in seconds).
const WAIT_TIME_BUCKETS: &[f64] = &[
    0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0,
];

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static MESSAGES_ENQUEUED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("weir_messages_enqueued_total", "Messages admitted per tenant"),
        &["tenant"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static MESSAGES_DISPATCHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "weir_messages_dispatched_total",
            "Messages moved onto worker queues per tenant",
        ),
        &["tenant"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static MESSAGES_ACKNOWLEDGED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "weir_messages_acknowledged_total",
            "Terminal completions per tenant",
        ),
        &["tenant"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static MESSAGES_NACKED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("weir_messages_nacked_total", "Redelivery requeues per tenant"),
        &["tenant"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static CONCURRENCY_HOLDERS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "weir_concurrency_holders",
            "In-flight messages per concurrency group",
        ),
        &["group_name", "group_id"],
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static QUEUE_WAIT_TIME: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "weir_queue_wait_seconds",
            "Time from enqueue to worker-queue dispatch",
        )
        .buckets(WAIT_TIME_BUCKETS.to_vec()),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

pub static REPLICATION_LAG_MS: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        "weir_replication_lag_ms",
        "Commit-to-now lag of the last replicated transaction",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static BATCHES_COMPLETED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("weir_batches_completed_total", "Finalized batches by outcome"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});
