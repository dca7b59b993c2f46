//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define service metrics (requests, latency, limiter, breakers, loaders)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `userdir_requests_total` (counter): requests by method, status
//! - `userdir_request_duration_seconds` (histogram): latency distribution
//! - `userdir_rate_limited_total` (counter): throttled requests by scope
//! - `userdir_rate_limiter_errors_total` (counter): fail-open decisions by limiter
//! - `userdir_breaker_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `userdir_breaker_rejections_total` (counter): fast-failed calls by breaker
//! - `userdir_loader_batch_size` (histogram): keys per dispatched batch
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder (tests, metrics disabled) every call is a no-op
//! - Labels for method, status code, scope and dependency name

use std::net::SocketAddr;
use std::time::Instant;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record a completed request.
pub fn record_request(method: &str, status: u16, start: Instant) {
    let labels = [("method", method.to_string()), ("status", status.to_string())];
    ::metrics::counter!("userdir_requests_total", &labels).increment(1);
    ::metrics::histogram!("userdir_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_rate_limited(scope: &str) {
    ::metrics::counter!("userdir_rate_limited_total", "scope" => scope.to_string()).increment(1);
}

pub fn record_limiter_error(limiter: &str) {
    ::metrics::counter!("userdir_rate_limiter_errors_total", "limiter" => limiter.to_string())
        .increment(1);
}

pub fn record_breaker_state(breaker: &str, level: f64) {
    ::metrics::gauge!("userdir_breaker_state", "breaker" => breaker.to_string()).set(level);
}

pub fn record_breaker_rejection(breaker: &str) {
    ::metrics::counter!("userdir_breaker_rejections_total", "breaker" => breaker.to_string())
        .increment(1);
}

pub fn record_loader_batch(loader: &'static str, size: usize) {
    ::metrics::histogram!("userdir_loader_batch_size", "loader" => loader).record(size as f64);
}
