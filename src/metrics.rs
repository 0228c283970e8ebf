//! Prometheus metrics for the gateway
//!
//! Defines metrics for:
//! - Request counts by method and status
//! - Request latency
//! - Provider operation counts and duration
//! - Background sync backlog and terminal failures

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Registry for all metrics
    pub static ref REGISTRY: Registry = Registry::new();

    /// HTTP request counter by method and status
    pub static ref HTTP_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("bucket_gateway_http_requests_total", "Total HTTP requests"),
        &["method", "status"]
    )
    .expect("Failed to create HTTP_REQUESTS metric");

    /// HTTP request latency histogram
    pub static ref HTTP_REQUEST_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "bucket_gateway_http_request_duration_seconds",
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .expect("Failed to create HTTP_REQUEST_DURATION metric");

    /// Storage operation counter by operation and status
    pub static ref STORAGE_OPERATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("bucket_gateway_storage_operations_total", "Total storage operations"),
        &["operation", "status"]
    )
    .expect("Failed to create STORAGE_OPERATIONS metric");

    /// Storage operation duration histogram
    pub static ref STORAGE_OPERATION_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "bucket_gateway_storage_operation_duration_seconds",
            "Storage operation duration in seconds"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .expect("Failed to create STORAGE_OPERATION_DURATION metric");

    /// Writes waiting to reach their provider
    pub static ref SYNC_PENDING: IntGauge = IntGauge::new(
        "bucket_gateway_sync_pending",
        "Writes queued for background sync"
    )
    .expect("Failed to create SYNC_PENDING metric");

    /// Writes that exhausted their retries
    pub static ref SYNC_FAILURES: IntCounter = IntCounter::new(
        "bucket_gateway_sync_failures_total",
        "Background sync operations that failed permanently"
    )
    .expect("Failed to create SYNC_FAILURES metric");
}

/// Register every metric with the gateway registry
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(HTTP_REQUESTS.clone()))?;
    REGISTRY.register(Box::new(HTTP_REQUEST_DURATION.clone()))?;
    REGISTRY.register(Box::new(STORAGE_OPERATIONS.clone()))?;
    REGISTRY.register(Box::new(STORAGE_OPERATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(SYNC_PENDING.clone()))?;
    REGISTRY.register(Box::new(SYNC_FAILURES.clone()))?;
    Ok(())
}

/// Text exposition of the registry
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Count one provider operation
pub fn record_storage_op(operation: &str, ok: bool) {
    STORAGE_OPERATIONS
        .with_label_values(&[operation, if ok { "ok" } else { "error" }])
        .inc();
}
