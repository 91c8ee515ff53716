//! Reconnection Policy and Connection State Machine
//!
//! Exponential backoff for reconnect attempts, and the explicit lifecycle
//! state machine each connection runs through.
//!
//! # Lifecycle
//!
//! ```text
//!              Opened                 TransportError
//! Connecting ─────────► Connected ───────────────────► Error
//!     ▲  │                  │                            │ SocketReleased
//!     │  │ TransportError   │ TransportClosed            ▼
//!     │  └──────► Error     └─────────────────────► Reconnecting ──► Failed
//!     │                                                  │   RetriesExhausted
//!     └──────────────────────────────────────────────────┘
//!                         RetryDue
//!
//! any non-terminal state ── CloseRequested ──► Closed
//! ```

use std::time::Duration;

use rand::Rng;

use crate::domain::monitor::ConnectionStatus;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Maximum number of reconnection attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_factor: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter_factor,
            max_attempts,
        }
    }

    /// Create configuration from `ClientSettings`.
    #[must_use]
    pub const fn from_settings(settings: &crate::ClientSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_backoff_factor,
            jitter_factor: settings.reconnect_jitter,
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Un-jittered delay before the given 1-based attempt:
    /// `min(initial_delay * multiplier^(attempt - 1), max_delay)`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let initial_millis = self.initial_delay.as_millis() as f64;
        let scaled = (initial_millis * self.multiplier.powi(exponent)).round();

        #[allow(clippy::cast_precision_loss)]
        let max_millis = self.max_delay.as_millis() as f64;
        let capped = if scaled.is_finite() {
            scaled.clamp(0.0, max_millis)
        } else {
            max_millis
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(capped as u64)
    }
}

/// Reconnection policy implementing exponential backoff with optional jitter.
///
/// # Example
///
/// ```rust
/// use market_stream_client::infrastructure::client::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let config = ReconnectConfig::default();
/// let mut policy = ReconnectPolicy::new(config);
///
/// // Get delay for first attempt
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
///
/// // Simulate successful connection
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Advance to the next attempt and return its delay.
    ///
    /// Returns `None` once the attempt would exceed `max_attempts`.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;
        let delay = self.config.backoff_delay(self.attempt_count);
        Some(self.apply_jitter(delay))
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Configured attempt budget (0 = unlimited).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Check if reconnection should continue.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    /// Apply jitter to a duration.
    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

/// Error type for reconnection failures.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),
}

// =============================================================================
// Connection State Machine
// =============================================================================

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket is being opened.
    Connecting,
    /// Socket open, messages flowing.
    Connected,
    /// Transport reported an error; the socket is being forced closed.
    Error,
    /// Waiting out the backoff delay.
    Reconnecting,
    /// Reconnect budget exhausted. Terminal.
    Failed,
    /// Closed on request. Terminal.
    Closed,
}

/// Inputs driving [`ConnectionState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Transport signalled open.
    Opened,
    /// Transport reported an error.
    TransportError,
    /// Transport closed without being asked to.
    TransportClosed,
    /// Socket of an errored connection has been closed.
    SocketReleased,
    /// Backoff delay elapsed.
    RetryDue,
    /// No reconnect attempts left.
    RetriesExhausted,
    /// Client asked for the connection to close.
    CloseRequested,
}

impl ConnectionState {
    /// Apply an event. Returns `None` if the event is not valid in this state.
    #[must_use]
    pub const fn on(self, event: ConnectionEvent) -> Option<Self> {
        use ConnectionEvent as E;

        match (self, event) {
            (Self::Closed | Self::Failed, _) => None,
            (_, E::CloseRequested) => Some(Self::Closed),
            (Self::Connecting, E::Opened) => Some(Self::Connected),
            (Self::Connecting | Self::Connected, E::TransportError) => Some(Self::Error),
            (Self::Connecting | Self::Connected, E::TransportClosed)
            | (Self::Error, E::SocketReleased) => Some(Self::Reconnecting),
            (Self::Reconnecting, E::RetryDue) => Some(Self::Connecting),
            (Self::Reconnecting, E::RetriesExhausted) => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Status reported to member stream monitors.
    #[must_use]
    pub const fn monitor_status(self) -> ConnectionStatus {
        match self {
            Self::Connecting => ConnectionStatus::Connecting,
            Self::Connected => ConnectionStatus::Connected,
            Self::Error | Self::Failed => ConnectionStatus::Error,
            Self::Reconnecting => ConnectionStatus::Reconnecting,
            Self::Closed => ConnectionStatus::Disconnected,
        }
    }

    /// State name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
