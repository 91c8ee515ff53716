//! WebSocket Transport Adapter
//!
//! Implements the [`Transport`] port over `tokio-tungstenite`.
//!
//! Each session pings the venue every heartbeat interval, reports pong round
//! trips as [`TransportEvent::Pong`], answers server pings, and turns a
//! missing pong into [`TransportError::HeartbeatTimeout`].

pub mod heartbeat;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub use heartbeat::{HeartbeatConfig, HeartbeatTracker};

use crate::application::ports::{Transport, TransportError, TransportEvent, TransportSession};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Transport
// =============================================================================

/// Venue socket factory backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    heartbeat: HeartbeatConfig,
}

impl WebSocketTransport {
    /// Create a transport with the given heartbeat configuration.
    #[must_use]
    pub const fn new(heartbeat: HeartbeatConfig) -> Self {
        Self { heartbeat }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportSession>, TransportError> {
        tracing::info!(url, "Connecting to venue stream");

        let connect = tokio_tungstenite::connect_async(url);
        let (stream, _response) = tokio::time::timeout(self.heartbeat.pong_timeout, connect)
            .await
            .map_err(|_| {
                TransportError::ConnectFailed(format!(
                    "timed out after {:?}",
                    self.heartbeat.pong_timeout
                ))
            })?
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        tracing::debug!(url, "Venue stream connected");
        Ok(Box::new(WsSession::new(stream, self.heartbeat.clone())))
    }
}

// =============================================================================
// Session
// =============================================================================

struct WsSession {
    stream: WsStream,
    heartbeat: HeartbeatTracker,
    ticker: Interval,
    closed: bool,
}

impl WsSession {
    fn new(stream: WsStream, config: HeartbeatConfig) -> Self {
        let now = Instant::now();
        let heartbeat = HeartbeatTracker::new(config, now);
        let period = heartbeat.ping_interval();
        let mut ticker = tokio::time::interval_at(now + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            stream,
            heartbeat,
            ticker,
            closed: false,
        }
    }

    /// Ping the venue, or report a dead socket.
    async fn on_tick(&mut self) -> Option<TransportEvent> {
        let now = Instant::now();
        if let Some(waited) = self.heartbeat.timed_out(now) {
            tracing::warn!(waited_ms = waited.as_millis(), "Heartbeat timeout detected");
            return Some(TransportEvent::Error(TransportError::HeartbeatTimeout(
                waited,
            )));
        }

        if let Err(e) = self.stream.send(Message::Ping(Vec::new().into())).await {
            return Some(TransportEvent::Error(TransportError::SendFailed(
                e.to_string(),
            )));
        }
        self.heartbeat.mark_ping_sent(now);
        None
    }

    /// Translate one inbound frame. `None` means the frame produced no event.
    async fn on_frame(
        &mut self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> Option<TransportEvent> {
        let now = Instant::now();
        match frame {
            Some(Ok(Message::Text(text))) => {
                self.heartbeat.record_inbound(now);
                Some(TransportEvent::Message(text.as_str().to_owned()))
            }
            Some(Ok(Message::Binary(data))) => {
                self.heartbeat.record_inbound(now);
                if let Ok(text) = String::from_utf8(data.to_vec()) {
                    Some(TransportEvent::Message(text))
                } else {
                    tracing::warn!(len = data.len(), "Received non-UTF8 binary message");
                    None
                }
            }
            Some(Ok(Message::Pong(_))) => self
                .heartbeat
                .record_pong(now)
                .map(TransportEvent::Pong),
            Some(Ok(Message::Ping(data))) => {
                self.heartbeat.record_inbound(now);
                if let Err(e) = self.stream.send(Message::Pong(data)).await {
                    return Some(TransportEvent::Error(TransportError::SendFailed(
                        e.to_string(),
                    )));
                }
                None
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!("Server sent close frame");
                self.closed = true;
                let (code, reason) = frame.map_or((None, String::new()), |f| {
                    (Some(u16::from(f.code)), f.reason.as_str().to_owned())
                });
                Some(TransportEvent::Closed { code, reason })
            }
            Some(Ok(Message::Frame(_))) => None,
            Some(Err(e)) => {
                self.closed = true;
                Some(TransportEvent::Error(TransportError::WebSocket(
                    e.to_string(),
                )))
            }
            None => {
                tracing::info!("WebSocket stream ended");
                self.closed = true;
                Some(TransportEvent::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl TransportSession for WsSession {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.closed {
            return None;
        }

        loop {
            let event = tokio::select! {
                _ = self.ticker.tick() => self.on_tick().await,
                frame = self.stream.next() => self.on_frame(frame).await,
            };

            if event.is_some() {
                return event;
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            tracing::debug!(error = %e, "Error while closing WebSocket");
        }
    }
}
