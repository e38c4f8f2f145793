//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define relay metrics (deliveries, retries, breaker state, operations)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-dependency and aggregate metrics
//!
//! # Metrics
//! - `relay_deliveries_total` (counter): delivery attempts by outcome
//! - `relay_delivery_duration_seconds` (histogram): HTTP time per attempt
//! - `relay_breaker_transitions_total` (counter): transitions by breaker, target state
//! - `relay_breaker_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `relay_circuit_rejections_total` (counter): calls failed fast by an open breaker
//! - `relay_operations_total` (counter): bounded operations by outcome
//! - `relay_retry_attempts_total` (counter): retries scheduled
//! - `relay_rate_limited_total` (counter): deliveries pushed to a later window
//! - `relay_dependency_health` (gauge): 1=healthy, 0=unhealthy
//! - `relay_subscriptions` (gauge): active subscriptions
//!
//! # Design Decisions
//! - Recording is a no-op until `init_metrics` installs a recorder
//! - Labels carry dependency names, never per-request ids

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus recorder and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_delivery(outcome: &'static str, duration: Duration) {
    ::metrics::counter!("relay_deliveries_total", "outcome" => outcome).increment(1);
    ::metrics::histogram!("relay_delivery_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_breaker_transition(breaker: &str, to: CircuitState) {
    ::metrics::counter!(
        "relay_breaker_transitions_total",
        "breaker" => breaker.to_string(),
        "to" => to.as_str()
    )
    .increment(1);
    record_breaker_state(breaker, to);
}

pub fn record_breaker_state(breaker: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    ::metrics::gauge!("relay_breaker_state", "breaker" => breaker.to_string()).set(value);
}

pub fn record_circuit_rejection(breaker: &str) {
    ::metrics::counter!("relay_circuit_rejections_total", "breaker" => breaker.to_string())
        .increment(1);
}

pub fn record_operation(outcome: &'static str) {
    ::metrics::counter!("relay_operations_total", "outcome" => outcome).increment(1);
}

pub fn record_retry_attempt() {
    ::metrics::counter!("relay_retry_attempts_total").increment(1);
}

pub fn record_rate_limited() {
    ::metrics::counter!("relay_rate_limited_total").increment(1);
}

pub fn record_dependency_health(dependency: &str, healthy: bool) {
    let value = if healthy { 1.0 } else { 0.0 };
    ::metrics::gauge!("relay_dependency_health", "dependency" => dependency.to_string()).set(value);
}

pub fn record_subscriptions(active: usize) {
    ::metrics::gauge!("relay_subscriptions").set(active as f64);
}
