//! Prometheus metrics exposition
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_key_cooldowns_total` (counter): label `key`
//! - `proxy_pool_exhausted_total` (counter)
//! - `proxy_auth_failures_total` (counter)

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Configures `proxy_request_duration_seconds` with explicit histogram buckets
/// so it renders as a Prometheus histogram (with `_bucket` lines usable by
/// `histogram_quantile()`) rather than the default summary. Buckets cover 5ms
/// to 60s; streaming completions routinely sit at the upper end.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "proxy_request_duration_seconds".to_string(),
            ),
            &[
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration: Duration) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration.as_secs_f64());
}

/// Record a key entering cooldown. The label carries the masked key so
/// per-key exhaustion shows up on dashboards without exposing the credential.
pub fn record_cooldown(masked_key: &str) {
    metrics::counter!("proxy_key_cooldowns_total", "key" => masked_key.to_string()).increment(1);
}

/// Record a request that found every key cooling down.
pub fn record_pool_exhausted() {
    metrics::counter!("proxy_pool_exhausted_total").increment(1);
}

/// Record a rejected local authentication attempt.
pub fn record_auth_failure() {
    metrics::counter!("proxy_auth_failures_total").increment(1);
}
