use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics exporter
///
/// Panics if a global recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    init_metric_descriptions();

    handle
}

/// Initialize metric descriptions (can be called multiple times safely)
fn init_metric_descriptions() {
    describe_counter!(
        "logrelay_ingested_records_total",
        "Log records accepted by the ingestion endpoint"
    );
    describe_counter!(
        "logrelay_rate_limit_rejections_total",
        "Requests rejected by the rate limiter"
    );
    describe_counter!(
        "logrelay_ip_blocks_total",
        "IP blocks applied, by escalation level"
    );
    describe_counter!(
        "logrelay_batches_flushed_total",
        "Batches delivered successfully to a sink"
    );
    describe_counter!(
        "logrelay_delivery_failures_total",
        "Failed batch deliveries"
    );
    describe_counter!(
        "logrelay_batches_dropped_total",
        "Batches dropped after exhausting retries"
    );
    describe_counter!(
        "logrelay_queue_dropped_records_total",
        "Records evicted from a full delivery queue"
    );
    describe_counter!(
        "logrelay_storage_errors_total",
        "Key-value store failures"
    );
    describe_histogram!(
        "logrelay_flush_duration_seconds",
        "Time spent delivering one batch to one sink"
    );
    describe_gauge!("logrelay_info", "Relay version information");

    gauge!("logrelay_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

pub fn record_ingested(app: &str, count: usize) {
    counter!("logrelay_ingested_records_total", "app" => app.to_string()).increment(count as u64);
}

pub fn record_rejection(tier: &str, action: &str) {
    counter!(
        "logrelay_rate_limit_rejections_total",
        "tier" => tier.to_string(),
        "action" => action.to_string(),
    )
    .increment(1);
}

pub fn record_ip_block(level: usize) {
    counter!("logrelay_ip_blocks_total", "level" => level.to_string()).increment(1);
}

/// Record a successful delivery and how long it took
pub fn record_flush(sink: &str, duration: Duration) {
    counter!("logrelay_batches_flushed_total", "sink" => sink.to_string()).increment(1);
    histogram!("logrelay_flush_duration_seconds", "sink" => sink.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_delivery_failure(sink: &str) {
    counter!("logrelay_delivery_failures_total", "sink" => sink.to_string()).increment(1);
}

pub fn record_batch_dropped(sink: &str) {
    counter!("logrelay_batches_dropped_total", "sink" => sink.to_string()).increment(1);
}

pub fn record_queue_dropped(count: usize) {
    counter!("logrelay_queue_dropped_records_total").increment(count as u64);
}

pub fn record_storage_error(op: &str) {
    counter!("logrelay_storage_errors_total", "op" => op.to_string()).increment(1);
}
