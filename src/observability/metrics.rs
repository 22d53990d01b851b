//! # Metrics
//!
//! Prometheus metrics for the sync engine.
//!
//! ## Metrics Exposed
//!
//! - `secrets_sync_operations_total` - Operations executed, by kind and outcome status
//! - `secrets_sync_operation_duration_seconds` - Duration of operations, retries included
//! - `secrets_sync_destination_requests_total` - Adapter requests by destination type and request
//! - `secrets_sync_destination_request_duration_seconds` - Adapter request latency
//! - `secrets_sync_destination_errors_total` - Adapter failures by destination type and class
//! - `secrets_sync_retries_total` - Retried adapter calls by failure class
//! - `secrets_sync_dispatcher_events_total` - Change feed events received
//! - `secrets_sync_dispatcher_coalesced_total` - Queued operations replaced by a newer one
//! - `secrets_sync_dispatcher_queue_depth` - Associations with a queued operation
//! - `secrets_sync_scans_total` - Reconciliation scans completed
//! - `secrets_sync_scan_duration_seconds` - Duration of reconciliation scans
//! - `secrets_sync_scan_repairs_total` - Repairs scheduled by the scanner, by operation
//! - `secrets_sync_associations` - Associations by status

use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "secrets_sync_operations_total",
            "Total number of sync operations by kind and resulting status",
        ),
        &["operation", "status"],
    )
    .expect("Failed to create OPERATIONS_TOTAL metric - this should never happen")
});

static OPERATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "secrets_sync_operation_duration_seconds",
            "Duration of sync operations in seconds, retries included",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 180.0]),
        &["operation"],
    )
    .expect("Failed to create OPERATION_DURATION metric - this should never happen")
});

static DESTINATION_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "secrets_sync_destination_requests_total",
            "Total number of destination requests by destination type",
        ),
        &["destination_type", "request"],
    )
    .expect("Failed to create DESTINATION_REQUESTS_TOTAL metric - this should never happen")
});

static DESTINATION_REQUEST_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "secrets_sync_destination_request_duration_seconds",
            "Duration of destination requests in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["destination_type"],
    )
    .expect("Failed to create DESTINATION_REQUEST_DURATION metric - this should never happen")
});

static DESTINATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "secrets_sync_destination_errors_total",
            "Total number of destination errors by destination type and failure class",
        ),
        &["destination_type", "class"],
    )
    .expect("Failed to create DESTINATION_ERRORS_TOTAL metric - this should never happen")
});

static RETRIES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "secrets_sync_retries_total",
            "Total number of retried destination calls by failure class",
        ),
        &["class"],
    )
    .expect("Failed to create RETRIES_TOTAL metric - this should never happen")
});

static DISPATCHER_EVENTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "secrets_sync_dispatcher_events_total",
        "Total number of change feed events received",
    )
    .expect("Failed to create DISPATCHER_EVENTS_TOTAL metric - this should never happen")
});

static DISPATCHER_COALESCED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "secrets_sync_dispatcher_coalesced_total",
        "Total number of queued operations replaced before they started",
    )
    .expect("Failed to create DISPATCHER_COALESCED_TOTAL metric - this should never happen")
});

static DISPATCHER_QUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "secrets_sync_dispatcher_queue_depth",
        "Number of associations with a queued operation",
    )
    .expect("Failed to create DISPATCHER_QUEUE_DEPTH metric - this should never happen")
});

static SCANS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "secrets_sync_scans_total",
        "Total number of reconciliation scans",
    )
    .expect("Failed to create SCANS_TOTAL metric - this should never happen")
});

static SCAN_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "secrets_sync_scan_duration_seconds",
            "Duration of reconciliation scans in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
    )
    .expect("Failed to create SCAN_DURATION metric - this should never happen")
});

static SCAN_REPAIRS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "secrets_sync_scan_repairs_total",
            "Total number of repairs scheduled by the reconciliation scanner",
        ),
        &["operation"],
    )
    .expect("Failed to create SCAN_REPAIRS_TOTAL metric - this should never happen")
});

static ASSOCIATIONS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new("secrets_sync_associations", "Number of associations by status"),
        &["status"],
    )
    .expect("Failed to create ASSOCIATIONS metric - this should never happen")
});

/// Register all metrics with the registry
///
/// Called once by the runtime before the probe server starts.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OPERATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(DESTINATION_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DESTINATION_REQUEST_DURATION.clone()))?;
    REGISTRY.register(Box::new(DESTINATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISPATCHER_EVENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISPATCHER_COALESCED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISPATCHER_QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(SCANS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SCAN_DURATION.clone()))?;
    REGISTRY.register(Box::new(SCAN_REPAIRS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ASSOCIATIONS.clone()))?;

    Ok(())
}

pub fn record_operation(operation: &str, status: &str, duration: f64) {
    OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
    OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(duration);
}

pub fn record_destination_request(destination_type: &str, request: &str, duration: f64) {
    DESTINATION_REQUESTS_TOTAL
        .with_label_values(&[destination_type, request])
        .inc();
    DESTINATION_REQUEST_DURATION
        .with_label_values(&[destination_type])
        .observe(duration);
}

pub fn increment_destination_errors(destination_type: &str, class: &str) {
    DESTINATION_ERRORS_TOTAL
        .with_label_values(&[destination_type, class])
        .inc();
}

pub fn increment_retries(class: &str) {
    RETRIES_TOTAL.with_label_values(&[class]).inc();
}

pub fn increment_dispatcher_events() {
    DISPATCHER_EVENTS_TOTAL.inc();
}

pub fn increment_dispatcher_coalesced() {
    DISPATCHER_COALESCED_TOTAL.inc();
}

pub fn set_dispatcher_queue_depth(depth: i64) {
    DISPATCHER_QUEUE_DEPTH.set(depth);
}

pub fn increment_scans() {
    SCANS_TOTAL.inc();
}

pub fn observe_scan_duration(duration: f64) {
    SCAN_DURATION.observe(duration);
}

pub fn increment_scan_repairs(operation: &str) {
    SCAN_REPAIRS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn set_associations(status: &str, count: i64) {
    ASSOCIATIONS.with_label_values(&[status]).set(count);
}
