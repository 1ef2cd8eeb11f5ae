//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with standardized naming conventions
//! for the chat, discovery and sandbox pipelines.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all GeoForge metrics
pub const METRICS_PREFIX: &str = "geoforge";

/// Histogram buckets for request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.010, // 10ms
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
    60.00, // 1m
    120.0, // 2m
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Retrieval metrics
    describe_histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Context retrieval latency in seconds"
    );

    describe_histogram!(
        format!("{}_retrieval_chunks", METRICS_PREFIX),
        Unit::Count,
        "Chunks returned per retrieval"
    );

    describe_counter!(
        format!("{}_upstream_degraded_total", METRICS_PREFIX),
        Unit::Count,
        "Upstream failures absorbed by returning empty results"
    );

    // Generation metrics
    describe_counter!(
        format!("{}_generation_attempts_total", METRICS_PREFIX),
        Unit::Count,
        "LLM completion attempts"
    );

    describe_counter!(
        format!("{}_generation_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Generations that exhausted their retry budget"
    );

    describe_histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end generation latency in seconds"
    );

    // Discovery metrics
    describe_counter!(
        format!("{}_discovery_steps_total", METRICS_PREFIX),
        Unit::Count,
        "Discovery steps by terminal status"
    );

    describe_counter!(
        format!("{}_discovery_runs_total", METRICS_PREFIX),
        Unit::Count,
        "Discovery runs by terminal status"
    );

    describe_gauge!(
        format!("{}_discovery_runs_active", METRICS_PREFIX),
        Unit::Count,
        "Discovery runs held in the store"
    );

    // Sandbox metrics
    describe_counter!(
        format!("{}_sandbox_executions_total", METRICS_PREFIX),
        Unit::Count,
        "Sandbox executions by result status"
    );

    describe_histogram!(
        format!("{}_sandbox_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Sandbox execution wall time in seconds"
    );

    describe_gauge!(
        format!("{}_sandbox_in_flight", METRICS_PREFIX),
        Unit::Count,
        "Sandbox executions currently running"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Helper to record retrieval metrics
pub fn record_retrieval(duration_secs: f64, chunk_count: usize) {
    histogram!(format!("{}_retrieval_duration_seconds", METRICS_PREFIX)).record(duration_secs);
    histogram!(format!("{}_retrieval_chunks", METRICS_PREFIX)).record(chunk_count as f64);
}

/// Helper to record an absorbed upstream failure
pub fn record_degradation(service: &str) {
    counter!(
        format!("{}_upstream_degraded_total", METRICS_PREFIX),
        "service" => service.to_string()
    )
    .increment(1);
}

/// Helper to record generation metrics
pub fn record_generation(duration_secs: f64, attempts: u32, success: bool) {
    counter!(format!("{}_generation_attempts_total", METRICS_PREFIX)).increment(attempts as u64);

    if success {
        histogram!(format!("{}_generation_duration_seconds", METRICS_PREFIX)).record(duration_secs);
    } else {
        counter!(format!("{}_generation_failures_total", METRICS_PREFIX)).increment(1);
    }
}

/// Helper to record a finished discovery step
pub fn record_discovery_step(step: &str, status: &str) {
    counter!(
        format!("{}_discovery_steps_total", METRICS_PREFIX),
        "step" => step.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Helper to record a discovery run reaching a terminal status
pub fn record_discovery_run(status: &str) {
    counter!(
        format!("{}_discovery_runs_total", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Helper to publish the discovery store size
pub fn set_discovery_runs(count: usize) {
    gauge!(format!("{}_discovery_runs_active", METRICS_PREFIX)).set(count as f64);
}

/// Helper to record sandbox metrics
pub fn record_sandbox(duration_secs: f64, status: &str) {
    counter!(
        format!("{}_sandbox_executions_total", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_sandbox_duration_seconds", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .record(duration_secs);
}

/// Helper to publish the number of running sandbox executions
pub fn set_sandbox_in_flight(count: usize) {
    gauge!(format!("{}_sandbox_in_flight", METRICS_PREFIX)).set(count as f64);
}
