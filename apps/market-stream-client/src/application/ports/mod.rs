//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Transport`]: opens message-oriented sockets to the venue
//! - [`TransportSession`]: one open socket, yielding [`TransportEvent`]s
//!
//! A successful [`Transport::connect`] is the open signal. After that the
//! session reports messages, pong round trips, errors and closes until it
//! returns `None`.

use std::time::Duration;

use async_trait::async_trait;

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Socket could not be opened.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Protocol or I/O error on an open socket.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// No pong arrived within the heartbeat timeout.
    #[error("heartbeat timeout after {0:?}")]
    HeartbeatTimeout(Duration),

    /// Outbound frame could not be sent.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Operation on a closed socket.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectFailed(_) => "connect_failed",
            Self::WebSocket(_) => "websocket",
            Self::HeartbeatTimeout(_) => "heartbeat_timeout",
            Self::SendFailed(_) => "send_failed",
            Self::Closed => "closed",
        }
    }
}

/// Events produced by an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// UTF-8 text frame.
    Message(String),
    /// Round trip of a heartbeat ping.
    Pong(Duration),
    /// Remote side closed the socket.
    Closed {
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },
    /// Transport-level error. The session should be considered broken.
    Error(TransportError),
}

/// Factory for venue sockets.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a socket to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectFailed`] if the socket cannot be
    /// opened.
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// One open socket.
#[async_trait]
pub trait TransportSession: Send {
    /// Wait for the next event. `None` means the socket is gone.
    ///
    /// Must be cancel-safe: dropping the future loses no event.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Send a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is closed or the write fails.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the socket with a close code and reason.
    async fn close(&mut self, code: u16, reason: &str);
}
