//! Prometheus metrics exposition
//!
//! - `codex_proxy_requests_total` (counter): labels `status`, `method`
//! - `codex_proxy_request_duration_seconds` (histogram): label `status`
//! - `codex_proxy_failovers_total` (counter): label `reason`
//! - `codex_proxy_upstream_errors_total` (counter): label `error_type`
//!
//! The pool crate adds `account_pool_token_refresh_total{outcome}`.

use anyhow::Context;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const REQUEST_DURATION: &str = "codex_proxy_request_duration_seconds";

/// Streaming responses can run for the full transport timeout, so the upper
/// buckets reach 600s.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    600.0,
];

/// Why the orchestrator moved a request to another account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverReason {
    RateLimited,
    Unauthorized,
    TokenInvalid,
}

impl FailoverReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverReason::RateLimited => "rate_limited",
            FailoverReason::Unauthorized => "unauthorized",
            FailoverReason::TokenInvalid => "token_invalid",
        }
    }
}

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), DURATION_BUCKETS)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The duration metric gets explicit buckets so it renders as a histogram
/// with `_bucket` lines rather than the default summary.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    builder()
        .context("failed to set histogram buckets")?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "codex_proxy_requests_total",
        "status" => status_str.clone(),
        "method" => method.to_string()
    )
    .increment(1);
    metrics::histogram!(REQUEST_DURATION, "status" => status_str).record(duration_secs);
}

pub fn record_failover(reason: FailoverReason) {
    metrics::counter!("codex_proxy_failovers_total", "reason" => reason.as_str()).increment(1);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("codex_proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().unwrap().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}
