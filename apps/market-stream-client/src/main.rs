//! Market Stream Client Binary
//!
//! Subscribes to the configured venue streams, logs what arrives, and serves
//! per-stream health over HTTP.
//!
//! # Usage
//!
//! ```bash
//! STREAM_CLIENT_STREAMS=btcusdt@trade,ethusdt@trade cargo run --bin market-stream-client
//! ```
//!
//! # Environment Variables
//!
//! - `STREAM_CLIENT_STREAMS`: Comma-separated stream names (default: btcusdt@trade)
//! - `STREAM_CLIENT_BASE_URL`: Venue base URL (default: wss://stream.binance.com:9443)
//! - `STREAM_CLIENT_COMBINED`: Share one combined connection (default: true)
//! - `STREAM_CLIENT_RECONNECT_*`, `STREAM_CLIENT_HEARTBEAT_*`: Connection tuning
//! - `STREAM_CLIENT_STALE_AFTER_SECS`: Silence before a stream is flagged (default: 10)
//! - `STREAM_CLIENT_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_stream_client::infrastructure::health::{HealthServer, HealthServerState};
use market_stream_client::{
    ClientConfig, ClientSettings, HeartbeatConfig, MonitorRegistry, StalenessConfig,
    StalenessWatchdog, StreamClient, StreamMessage, Subscription, WebSocketTransport,
    init_metrics, init_telemetry,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Upper bound on waiting for connection actors to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    let telemetry_guard = init_telemetry();

    tracing::info!(
        otlp_export = telemetry_guard.is_exporting(),
        "Starting Market Stream Client"
    );

    if let Err(e) = init_metrics() {
        tracing::error!(error = %e, "Prometheus recorder unavailable, metrics disabled");
    }

    let settings = ClientSettings::from_env().context("invalid client configuration")?;
    log_settings(&settings);

    let shutdown_token = CancellationToken::new();
    let registry = MonitorRegistry::global();

    let transport = Arc::new(WebSocketTransport::new(HeartbeatConfig::from_settings(
        &settings,
    )));
    let client = StreamClient::new(
        ClientConfig::from_settings(&settings),
        transport,
        Arc::clone(&registry),
    );

    let subscriptions = subscribe_all(&client, &settings)?;
    tracing::info!(
        subscriptions = subscriptions.len(),
        connections = client.connection_count(),
        "Subscriptions registered"
    );

    // Staleness watchdog
    let watchdog = Arc::new(StalenessWatchdog::new(
        Arc::clone(&registry),
        StalenessConfig::from_settings(&settings),
    ));
    let watchdog_handle = tokio::spawn(watchdog.run(shutdown_token.clone()));

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&registry),
    ));
    let health_server = HealthServer::new(
        settings.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Stream client ready");

    await_shutdown(shutdown_token).await;

    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, client.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Connections did not stop before timeout"
        );
    }
    let _ = tokio::join!(watchdog_handle, health_handle);

    tracing::info!("Stream client stopped");
    drop(telemetry_guard);
    Ok(())
}

/// Register the configured streams, combined or one connection each.
fn subscribe_all(
    client: &StreamClient,
    settings: &ClientSettings,
) -> anyhow::Result<Vec<Subscription>> {
    if settings.combined {
        let subscription = client
            .connect_to_streams(settings.streams.as_slice(), log_message)
            .context("failed to subscribe to combined streams")?;
        return Ok(vec![subscription]);
    }

    settings
        .streams
        .iter()
        .map(|name| {
            client
                .connect_to_stream(name, log_message)
                .with_context(|| format!("failed to subscribe to {name}"))
        })
        .collect()
}

fn log_message(message: &StreamMessage) {
    tracing::debug!(stream = %message.stream, data = %message.data, "Stream message");
}

/// Log the parsed configuration.
fn log_settings(settings: &ClientSettings) {
    tracing::info!(
        base_url = %settings.base_url,
        streams = settings.streams.len(),
        combined = settings.combined,
        max_reconnect_attempts = settings.max_reconnect_attempts,
        health_port = settings.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        reconnect_delay_initial_ms = settings.reconnect_delay_initial.as_millis(),
        reconnect_delay_max_ms = settings.reconnect_delay_max.as_millis(),
        heartbeat_interval_secs = settings.heartbeat_interval.as_secs(),
        heartbeat_timeout_secs = settings.heartbeat_timeout.as_secs(),
        "Connection tuning"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
