//! Prometheus metrics exposition
//!
//! Proxy metrics recorded here:
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `session_state` (gauge): label `state`, 1 for the current state
//! - `session_transitions_total` (counter): label `state`
//!
//! The session and gateway crates record their own refresh and call metrics
//! through the same recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use session::{AuthState, Subscription};
use tracing::info;

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

const STATE_LABELS: &[&str] = &[
    "unauthenticated",
    "authenticated",
    "expired",
    "refresh_failed",
];

/// Builder with histogram buckets for every duration metric, so they render
/// as Prometheus histograms (`_bucket` lines) rather than summaries.
fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("proxy_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full("session_refresh_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Set the `session_state` gauge to 1 for `state` and 0 for the rest.
pub fn record_session_state(state: &AuthState) {
    let current = state.label();
    for label in STATE_LABELS {
        let value = if *label == current { 1.0 } else { 0.0 };
        metrics::gauge!("session_state", "state" => *label).set(value);
    }
    metrics::counter!("session_transitions_total", "state" => current).increment(1);
}

/// Follow session state changes for logging and the `session_state` gauge.
///
/// Ends when the `SessionState` is dropped.
pub fn spawn_session_observer(mut subscription: Subscription) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(state) = subscription.recv().await {
            info!(state = state.label(), "session state changed");
            record_session_state(&state);
        }
    })
}
