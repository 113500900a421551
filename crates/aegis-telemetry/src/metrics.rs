//! Prometheus metrics bootstrap

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the recorder and describe the proxy's metric families.
///
/// Returns the handle the HTTP transport renders at `GET /metrics`.
pub fn init_metrics() -> Result<PrometheusHandle, String> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("failed to install metrics recorder: {}", e))?;

    metrics::describe_counter!(
        "aegis_requests_total",
        "JSON-RPC requests processed, by method"
    );
    metrics::describe_counter!(
        "aegis_decisions_total",
        "Policy decisions produced, by outcome and engine"
    );
    metrics::describe_counter!(
        "aegis_enforcement_errors_total",
        "Enforcement failures, by kind"
    );
    metrics::describe_histogram!(
        "aegis_decision_latency_ms",
        metrics::Unit::Milliseconds,
        "Decision pipeline latency"
    );
    metrics::describe_histogram!(
        "aegis_upstream_latency_ms",
        metrics::Unit::Milliseconds,
        "Upstream round-trip latency, by upstream"
    );
    metrics::describe_gauge!("aegis_active_upstreams", "Upstreams currently spawned");
    metrics::describe_gauge!("aegis_cache_entries", "Decision cache L1 entry count");
    metrics::describe_gauge!("aegis_cache_hit_ratio", "Decision cache hit ratio since start");

    info!("metrics exporter initialized");
    Ok(handle)
}
