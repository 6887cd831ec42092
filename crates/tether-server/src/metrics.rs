//! Metrics collection and export for Tether.
//!
//! Relay events arrive through [`MetricsObserver`] and are recorded with the
//! `metrics` crate, exported in Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tether_core::{Observer, SourceError, SourceId};
use tracing::info;

/// Metric names.
pub mod names {
    pub const SOURCES_TOTAL: &str = "tether_sources_total";
    pub const SOURCES_ACTIVE: &str = "tether_sources_active";
    pub const SOURCES_FAILED: &str = "tether_sources_failed_total";
    pub const MESSAGES_TOTAL: &str = "tether_messages_total";
    pub const MESSAGES_BYTES: &str = "tether_messages_bytes";
    pub const FANOUT: &str = "tether_message_fanout";
    pub const WRITE_ERRORS_TOTAL: &str = "tether_write_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SOURCES_TOTAL,
        "Total number of sources added since start"
    );
    metrics::describe_gauge!(names::SOURCES_ACTIVE, "Current number of pooled sources");
    metrics::describe_counter!(
        names::SOURCES_FAILED,
        "Sources whose consume loop ended with an error"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of payloads relayed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of payloads relayed");
    metrics::describe_histogram!(names::FANOUT, "Recipients per relayed payload");
    metrics::describe_counter!(names::WRITE_ERRORS_TOTAL, "Total number of failed writes");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Records relay events as metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl Observer for MetricsObserver {
    fn source_added(&self, _id: SourceId) {
        counter!(names::SOURCES_TOTAL).increment(1);
        gauge!(names::SOURCES_ACTIVE).increment(1.0);
    }

    fn source_removed(&self, _id: SourceId, failed: bool) {
        gauge!(names::SOURCES_ACTIVE).decrement(1.0);
        if failed {
            counter!(names::SOURCES_FAILED).increment(1);
        }
    }

    fn message_relayed(&self, _author: SourceId, bytes: usize, recipients: usize) {
        counter!(names::MESSAGES_TOTAL).increment(1);
        counter!(names::MESSAGES_BYTES).increment(bytes as u64);
        histogram!(names::FANOUT).record(recipients as f64);
    }

    fn write_failed(&self, _id: SourceId, error: &SourceError) {
        let kind = match error {
            SourceError::NotConnected => "not_connected",
            SourceError::Io(_) => "io",
            _ => "write",
        };
        counter!(names::WRITE_ERRORS_TOTAL, "kind" => kind).increment(1);
    }
}
