//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))
}

/// Record an invocation entering `Running`.
pub fn record_invocation_start() {
    metrics::gauge!("invocations_active").increment(1.0);
}

/// Record an invocation reaching a terminal state.
pub fn record_invocation_end(mode: &'static str, outcome: &'static str) {
    metrics::gauge!("invocations_active").decrement(1.0);
    let labels = [("mode", mode.to_string()), ("outcome", outcome.to_string())];
    metrics::counter!("invocations_total", &labels).increment(1);
}

/// Record a stop request and whether anything was running.
pub fn record_stop_request(result: &'static str) {
    let labels = [("result", result.to_string())];
    metrics::counter!("stop_requests_total", &labels).increment(1);
}

/// Record an upstream failure by classification code.
pub fn record_error(code: &str) {
    let labels = [("code", code.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}
