//! # Observability Module
//!
//! Structured logging via `tracing` and metrics via the `metrics` facade
//! with a Prometheus exporter. Everything on the hot path records through
//! lock-free counters and histograms; the exposition endpoint renders from
//! the installed recorder handle.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::core::config::LoggingConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Latency buckets tuned for gateway hops: sub-millisecond local decisions
/// up to slow upstreams.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Initialize the tracing subscriber from the logging configuration.
///
/// Safe to call more than once; later calls are no-ops (relevant under
/// test harnesses that initialize per-test).
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("edge_gateway={},tower_http=warn", config.level))
    });

    let result = if config.format == "pretty" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
    };

    if result.is_ok() {
        info!(level = %config.level, format = %config.format, "tracing initialized");
    }
}

/// Install the Prometheus recorder and return the render handle for the
/// `/metrics` endpoint.
pub fn install_metrics() -> GatewayResult<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .map_err(|e| GatewayError::internal(format!("invalid metric buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| GatewayError::internal(format!("failed to install metrics recorder: {}", e)))?;

    describe_metrics();
    Ok(handle)
}

/// Register help text for every metric family the gateway emits.
fn describe_metrics() {
    describe_counter!(
        "gateway_requests_total",
        "Requests processed, by method and response status"
    );
    describe_histogram!(
        "gateway_request_duration_seconds",
        Unit::Seconds,
        "End-to-end request latency"
    );
    describe_counter!(
        "gateway_upstream_requests_total",
        "Upstream responses received, by service and status"
    );
    describe_counter!(
        "gateway_upstream_errors_total",
        "Upstream failures, by service and error kind"
    );
    describe_histogram!(
        "gateway_upstream_duration_seconds",
        Unit::Seconds,
        "Upstream call latency including retries"
    );
    describe_counter!(
        "gateway_rate_limit_decisions_total",
        "Rate limiter decisions, by outcome"
    );
    describe_counter!(
        "gateway_rate_limit_store_errors_total",
        "Shared-store failures observed by the distributed limiter"
    );
    describe_gauge!(
        "gateway_breaker_state",
        "Circuit breaker state per service (closed=0, half_open=1, open=2)"
    );
    describe_counter!(
        "gateway_breaker_transitions_total",
        "Circuit breaker state transitions, by service, from and to"
    );
    describe_counter!(
        "gateway_breaker_outcomes_total",
        "Circuit breaker call outcomes, by service"
    );
    describe_counter!(
        "gateway_balancer_selections_total",
        "Endpoint selections, by service"
    );
    describe_counter!(
        "gateway_balancer_failed_selections_total",
        "Selections that found no healthy endpoint, by service"
    );
    describe_counter!("gateway_panics_total", "Faults caught by the panic barrier");
}
