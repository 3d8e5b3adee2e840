//! Prometheus recorder and `/metrics` endpoint shared by the outpost binaries.
//!
//! The pool records through the `metrics` facade macros; nothing is exported
//! unless a binary installs the recorder with [`init_metrics`] and serves it
//! with [`start_metrics_server`].
//!
//! Metric names start with `pool_` and end in a unit (`_total`, `_seconds`).
//! Labels are limited to `partition`, `frame`, `direction` and `plan`.
//! Relay URLs are never used as labels.

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder and register metric descriptions.
///
/// Fails if a recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_pool_metrics();
    Ok(handle)
}

/// Like [`init_metrics`] but returns `None` if the recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    init_metrics().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:port` and serves `/metrics` from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the pool metrics.
fn register_pool_metrics() {
    // =========================================================================
    // Connections
    // =========================================================================

    describe_counter!(
        "pool_connects_total",
        "Successful websocket handshakes (label: partition)"
    );
    describe_counter!(
        "pool_connect_failures_total",
        "Failed websocket handshakes (label: partition)"
    );
    describe_counter!(
        "pool_disconnects_total",
        "Sockets that closed or errored after connecting (label: partition)"
    );
    describe_gauge!(
        "pool_connections",
        "Registered connections per partition (label: partition)"
    );
    describe_gauge!(
        "pool_connections_connected",
        "Connected sockets per partition (label: partition)"
    );
    describe_counter!(
        "pool_outbox_evictions_total",
        "Outbox connections removed after sitting idle"
    );
    describe_counter!(
        "pool_ephemeral_evictions_total",
        "Ephemeral connections evicted after their time to live"
    );
    describe_histogram!(
        "pool_connect_duration_seconds",
        "Time from connect() to a completed handshake"
    );

    // =========================================================================
    // Traffic
    // =========================================================================

    describe_counter!(
        "pool_frames_sent_total",
        "Client frames written to relays (label: frame)"
    );
    describe_counter!(
        "pool_frames_dropped_total",
        "Client frames dropped because no socket was available"
    );
    describe_counter!(
        "pool_messages_received_total",
        "Relay frames received (label: partition)"
    );

    // =========================================================================
    // Supervisor
    // =========================================================================

    describe_counter!(
        "pool_keepalive_ticks_total",
        "Keepalive ticks that ran (foreground and network reachable)"
    );
    describe_counter!("pool_keepalive_pings_total", "Pings sent to quiet relays");
    describe_counter!(
        "pool_keepalive_reconnects_total",
        "Reconnect attempts issued by the keepalive tick"
    );

    // =========================================================================
    // Outbox routing
    // =========================================================================

    describe_counter!(
        "pool_relay_lists_rejected_total",
        "Relay list events dropped by the sanitizer"
    );
    describe_gauge!(
        "pool_preferred_relays",
        "Relays in the preferred relay map (label: direction)"
    );
    describe_gauge!(
        "pool_outbox_plan_relays",
        "Relays in the most recent outbox plan (label: plan)"
    );
    describe_gauge!("pool_penalty_box_size", "Relays currently in the penalty box");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_pool_metrics_does_not_panic() {
        let _ = try_init_metrics();
        register_pool_metrics();
        register_pool_metrics();
    }

    #[test]
    fn test_descriptions_name_recorded_labels() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            register_pool_metrics();
            metrics::counter!("pool_connect_failures_total", "partition" => "outbox").increment(1);
            metrics::counter!("pool_frames_sent_total", "frame" => "REQ").increment(1);
        });

        let rendered = handle.render();
        assert!(rendered.contains("Failed websocket handshakes (label: partition)"));
        assert!(rendered.contains("pool_connect_failures_total{partition=\"outbox\"} 1"));
        assert!(rendered.contains("Client frames written to relays (label: frame)"));
        assert!(rendered.contains("pool_frames_sent_total{frame=\"REQ\"} 1"));
    }
}
