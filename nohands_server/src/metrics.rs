//! Prometheus metrics for builds, git refreshes, containers and the proxy.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a build state transition.
pub fn build_status_changed(status: &str) {
    counter!("nohands_builds_total", "status" => status.to_string()).increment(1);
}

/// Record build duration.
pub fn build_duration(duration_ms: u64) {
    histogram!("nohands_build_duration_ms").record(duration_ms as f64);
}

/// Builds currently holding an execution permit.
pub fn running_builds(count: usize) {
    gauge!("nohands_builds_running").set(count as f64);
}

/// Record a git refresh (`branches` or `commits`).
pub fn git_refresh(kind: &'static str) {
    counter!("nohands_git_refresh_total", "kind" => kind).increment(1);
}

pub fn proxy_request(status: u16) {
    counter!("nohands_proxy_requests_total", "status" => status.to_string()).increment(1);
}

/// Record a container lifecycle action (`start`, `stop`, `error`).
pub fn container_action(action: &'static str) {
    counter!("nohands_containers_total", "action" => action).increment(1);
}
