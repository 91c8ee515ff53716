#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_precision_loss
    )
)]

//! Market Stream Client - Resilient Venue Stream Multiplexer
//!
//! Maintains long-lived WebSocket connections to a market data venue,
//! multiplexes many logical stream subscriptions over shared connections,
//! recovers from drops with exponential backoff, and tracks per-stream
//! health (throughput, latency, staleness, errors) for consumers that
//! make liveness decisions.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types, no I/O
//!   - `monitor`: Per-stream health monitors and their registry
//!   - `streaming`: Stream addressing and frame normalization
//!   - `subscription`: Listener registration and dispatch tables
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Venue transport interface
//!   - `services`: Staleness and sequence gap detection
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `client`: Stream client, connection actors, reconnect policy
//!   - `websocket`: tokio-tungstenite transport with heartbeat
//!   - `config`: Environment-driven settings
//!   - `health`: Health check HTTP endpoint
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: Tracing subscriber and OpenTelemetry export
//!
//! # Data Flow
//!
//! ```text
//!                ┌──────────────┐  frames   ┌────────────────┐  callbacks
//! Venue WS ─────►│  Connection  │──────────►│ Dispatch table │──────────► Consumers
//!                │    actor     │           └────────────────┘
//!                └──────┬───────┘
//!                       │ lifecycle, bytes, pings, errors
//!                       ▼
//!                ┌──────────────┐  snapshots ┌────────────────┐
//!                │   Monitor    │───────────►│ Health server, │
//!                │   registry   │            │  subscribers   │
//!                └──────────────┘            └────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core stream health and subscription types.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::monitor::{
    ConnectionStatus, MetricsSnapshot, MonitorRegistry, MonitorSubscription, StreamMonitor,
};
pub use domain::streaming::{Framing, StreamMessage, StreamNameError, StreamPath};

// Ports
pub use application::ports::{Transport, TransportError, TransportEvent, TransportSession};

// Services
pub use application::services::{
    SequenceCheck, SequenceGapTracker, StalenessConfig, StalenessWatchdog,
};

// Client
pub use infrastructure::client::{
    ClientConfig, ClientError, ConnectionInfo, ConnectionState, ReconnectConfig, StreamClient,
    Subscription,
};

// WebSocket transport
pub use infrastructure::websocket::{HeartbeatConfig, WebSocketTransport};

// Infrastructure config
pub use infrastructure::config::{ClientSettings, ConfigError};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
