use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics exporter
///
/// Fails if a global recorder is already installed (e.g. twice in one process).
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    init_metric_descriptions();

    Ok(handle)
}

/// Initialize metric descriptions (can be called multiple times safely)
fn init_metric_descriptions() {
    describe_counter!(
        "telemetry_events_enqueued_total",
        "Telemetry events accepted into the pipeline queue"
    );
    describe_counter!(
        "telemetry_events_dropped_total",
        "Telemetry events rejected by the pipeline queue"
    );
    describe_counter!(
        "telemetry_batches_flushed_total",
        "Batches written to the durable sink"
    );
    describe_counter!(
        "telemetry_events_persisted_total",
        "Telemetry events written to the durable sink"
    );
    describe_counter!(
        "telemetry_batches_failed_total",
        "Batches discarded after a sink write failure"
    );
    describe_histogram!(
        "telemetry_flush_duration_seconds",
        "Time spent writing one batch"
    );
    describe_gauge!(
        "telemetry_queue_depth",
        "Events waiting in the pipeline queue"
    );
    describe_counter!(
        "rate_limit_decisions_total",
        "Rate limit decisions by outcome"
    );
    describe_counter!(
        "rate_limit_store_errors_total",
        "Counter store failures (requests admitted fail-open)"
    );
    describe_gauge!(
        "llm_telemetry_info",
        "Service version information"
    );

    gauge!("llm_telemetry_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

pub fn record_event_enqueued() {
    counter!("telemetry_events_enqueued_total").increment(1);
}

/// Record a dropped event, `reason` is `full` or `closed`
pub fn record_event_dropped(reason: &'static str) {
    counter!("telemetry_events_dropped_total", "reason" => reason).increment(1);
}

pub fn record_batch_flushed(trigger: &'static str, count: usize, duration: Duration) {
    counter!("telemetry_batches_flushed_total", "trigger" => trigger).increment(1);
    counter!("telemetry_events_persisted_total").increment(count as u64);
    histogram!("telemetry_flush_duration_seconds", "outcome" => "success")
        .record(duration.as_secs_f64());
}

pub fn record_batch_failed(trigger: &'static str, count: usize, duration: Duration) {
    counter!("telemetry_batches_failed_total", "trigger" => trigger).increment(1);
    counter!("telemetry_events_dropped_total", "reason" => "sink_failure").increment(count as u64);
    histogram!("telemetry_flush_duration_seconds", "outcome" => "failure")
        .record(duration.as_secs_f64());
}

pub fn set_queue_depth(depth: usize) {
    gauge!("telemetry_queue_depth").set(depth as f64);
}

/// Record a limiter decision, `outcome` is `admitted`, `rejected` or `fail_open`
///
/// Labelled by outcome only; request paths come from clients and would
/// grow the series set without bound.
pub fn record_rate_limit_decision(outcome: &'static str) {
    counter!("rate_limit_decisions_total", "outcome" => outcome).increment(1);
}

pub fn record_counter_store_error() {
    counter!("rate_limit_store_errors_total").increment(1);
}
