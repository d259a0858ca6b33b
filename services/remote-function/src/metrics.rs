//! Prometheus metrics exposition
//!
//! Service-level metrics recorded here:
//!
//! - `remote_function_requests_total` (counter): label `status`
//! - `remote_function_request_duration_seconds` (histogram): label `status`
//!
//! The dispatch crate records `claude_calls_total{outcome}`,
//! `claude_retries_total` and `claude_credential_exhausted_total` through the
//! same global recorder.

use anyhow::Result;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets for request duration. A batch can sit in backoff for
/// several minutes, so the range runs well past the per-call timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> Result<PrometheusBuilder> {
    Ok(PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("remote_function_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )?)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a finished remote-function request.
///
/// `status` is `ok` (replies), `error` (errorMessage from a failed batch) or
/// `rejected` (malformed envelope).
pub fn record_request(status: &'static str, duration_secs: f64) {
    metrics::counter!("remote_function_requests_total", "status" => status).increment(1);
    metrics::histogram!("remote_function_request_duration_seconds", "status" => status)
        .record(duration_secs);
}
