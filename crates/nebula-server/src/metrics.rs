//! Metrics collection and export for Nebula.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format. Gateway events reach the recorder through
//! [`MetricsSink`].

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use nebula_core::events::{log_event, EventSink, GatewayEvent};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "nebula_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "nebula_connections_active";
    pub const EVENTS_TOTAL: &str = "nebula_events_total";
    pub const MESSAGES_BYTES: &str = "nebula_messages_bytes";
    pub const STORE_ERRORS_TOTAL: &str = "nebula_store_errors_total";
    pub const LATENCY_SECONDS: &str = "nebula_latency_seconds";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Inbound events by outcome");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_counter!(
        names::STORE_ERRORS_TOTAL,
        "Presence store failures by operation"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound message processing latency in seconds"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record message latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Event sink that logs every gateway event and records it as a metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn emit(&self, event: &GatewayEvent) {
        log_event(event);

        match event {
            GatewayEvent::Connected { .. } => {
                counter!(names::CONNECTIONS_TOTAL).increment(1);
                gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
            }
            GatewayEvent::Disconnected { .. } => {
                gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
            }
            GatewayEvent::Delivered { .. }
            | GatewayEvent::RateLimited { .. }
            | GatewayEvent::InvalidEvent { .. } => {
                counter!(names::EVENTS_TOTAL, "outcome" => event.label()).increment(1);
            }
            GatewayEvent::StoreUnavailable { op, .. } => {
                counter!(names::STORE_ERRORS_TOTAL, "op" => *op).increment(1);
            }
            GatewayEvent::AdapterInitFailed { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nebula_core::DisconnectReason;
    use std::time::Duration;

    #[test]
    fn test_sink_without_recorder() {
        // No recorder installed: every call is a no-op.
        let sink = MetricsSink;
        sink.emit(&GatewayEvent::Connected {
            connection_id: "n.1".into(),
        });
        sink.emit(&GatewayEvent::StoreUnavailable {
            op: "connect",
            error: "refused".into(),
        });
        sink.emit(&GatewayEvent::Disconnected {
            connection_id: "n.1".into(),
            reason: DisconnectReason::IdleTimeout,
            duration: Duration::from_secs(1),
        });
        record_message(10, "inbound");
    }
}
