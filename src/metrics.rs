//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle rendering the `/metrics` endpoint. Called once at
/// startup, before any metric is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    tracing::info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Service requests total (counter, labels: method).
pub const REQUEST_COUNT: &str = "ws_adapter_api_request_count";
/// Service request latency seconds (histogram, labels: method).
pub const REQUEST_LATENCY_SECONDS: &str = "ws_adapter_api_request_latency_seconds";
/// Failed service requests total (counter, labels: method, error).
pub const REQUEST_ERRORS: &str = "ws_adapter_api_request_errors";
/// Deliveries evicted from a full outbound queue (counter).
pub const OUTBOUND_DROPPED_TOTAL: &str = "ws_adapter_outbound_dropped_total";
/// Open WebSocket connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "ws_adapter_connections_active";
/// WebSocket connections accepted total (counter, labels: mode).
pub const CONNECTIONS_TOTAL: &str = "ws_adapter_connections_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn test_metric_names_are_snake_case() {
        let names = [
            REQUEST_COUNT,
            REQUEST_LATENCY_SECONDS,
            REQUEST_ERRORS,
            OUTBOUND_DROPPED_TOTAL,
            CONNECTIONS_ACTIVE,
            CONNECTIONS_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("ws_adapter_"));
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
