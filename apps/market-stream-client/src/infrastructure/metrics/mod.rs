//! Prometheus Metrics Module
//!
//! Exposes client metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Messages**: Frames and bytes received per stream, malformed frames
//! - **Connections**: Open venue sockets, reconnect attempts, exhausted budgets
//! - **Callbacks**: Panicking subscriber callbacks per stream
//! - **Latency**: Heartbeat ping round trips
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the already-installed handle.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "stream_client_messages_received_total",
        "Total frames routed to a stream"
    );
    describe_counter!(
        "stream_client_bytes_received_total",
        "Total frame bytes routed to a stream"
    );
    describe_counter!(
        "stream_client_malformed_frames_total",
        "Total inbound frames that failed to parse"
    );

    describe_gauge!(
        "stream_client_connections",
        "Number of open venue connections"
    );
    describe_counter!(
        "stream_client_transport_errors_total",
        "Total transport errors by type"
    );
    describe_counter!(
        "stream_client_reconnects_total",
        "Total reconnection attempts scheduled"
    );
    describe_counter!(
        "stream_client_reconnect_exhausted_total",
        "Total connections that ran out of reconnection attempts"
    );

    describe_counter!(
        "stream_client_callback_failures_total",
        "Total subscriber callbacks that panicked"
    );

    describe_histogram!(
        "stream_client_ping_latency_seconds",
        "Heartbeat ping round-trip time"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame routed to `stream`.
pub fn record_message_received(stream: &str, bytes: usize) {
    counter!(
        "stream_client_messages_received_total",
        "stream" => stream.to_string()
    )
    .increment(1);
    counter!(
        "stream_client_bytes_received_total",
        "stream" => stream.to_string()
    )
    .increment(bytes as u64);
}

/// Record an unparseable inbound frame.
pub fn record_malformed_frame() {
    counter!("stream_client_malformed_frames_total").increment(1);
}

/// Record a transport error.
pub fn record_transport_error(error_type: &'static str) {
    counter!(
        "stream_client_transport_errors_total",
        "error_type" => error_type
    )
    .increment(1);
}

/// Record a scheduled reconnection attempt.
pub fn record_reconnect() {
    counter!("stream_client_reconnects_total").increment(1);
}

/// Record a connection that gave up reconnecting.
pub fn record_reconnect_exhausted() {
    counter!("stream_client_reconnect_exhausted_total").increment(1);
}

/// Record a panicking subscriber callback.
pub fn record_callback_failure(stream: &str) {
    counter!(
        "stream_client_callback_failures_total",
        "stream" => stream.to_string()
    )
    .increment(1);
}

/// Track an opened venue connection.
pub fn connection_opened() {
    gauge!("stream_client_connections").increment(1.0);
}

/// Track a closed venue connection.
pub fn connection_closed() {
    gauge!("stream_client_connections").decrement(1.0);
}

/// Record a heartbeat round trip.
pub fn record_ping_latency(rtt: Duration) {
    histogram!("stream_client_ping_latency_seconds").record(rtt.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_message_received("btcusdt@trade", 128);
        record_malformed_frame();
        record_transport_error("heartbeat_timeout");
        record_reconnect();
        record_reconnect_exhausted();
        record_callback_failure("btcusdt@trade");
        connection_opened();
        connection_closed();
        record_ping_latency(Duration::from_millis(12));
    }

    #[test]
    fn init_metrics_is_idempotent() {
        let first = init_metrics();
        let second = init_metrics();
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert!(get_metrics_handle().is_some());

        record_message_received("btcusdt@trade", 64);
        let rendered = get_metrics_handle().unwrap().render();
        assert!(rendered.contains("stream_client_messages_received_total"));
    }
}
