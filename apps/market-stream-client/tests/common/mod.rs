//! In-memory venue transport driven by the test body.
//!
//! Every successful connect hands the test a [`SessionHandle`] that pushes
//! events into the client and observes how the client closed the socket.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use market_stream_client::{
    ClientConfig, MonitorRegistry, ReconnectConfig, StreamClient, Transport, TransportError,
    TransportEvent, TransportSession,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

/// Generous bound for anything the tests wait on.
pub const WAIT: Duration = Duration::from_secs(2);

pub struct ScriptedTransport {
    sessions: mpsc::UnboundedSender<SessionHandle>,
    failures: AtomicU32,
    connects: AtomicU32,
}

impl ScriptedTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            sessions: tx,
            failures: AtomicU32::new(0),
            connects: AtomicU32::new(0),
        });
        (transport, rx)
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportSession>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::ConnectFailed("connection refused".to_string()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();

        let _ = self.sessions.send(SessionHandle {
            url: url.to_string(),
            events: events_tx,
            closed: closed_rx,
            sent: sent_rx,
        });

        Ok(Box::new(ScriptedSession {
            events: events_rx,
            closed: Some(closed_tx),
            sent: sent_tx,
        }))
    }
}

struct ScriptedSession {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    closed: Option<oneshot::Sender<(u16, String)>>,
    sent: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TransportSession for ScriptedSession {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sent.send(text).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if let Some(tx) = self.closed.take() {
            let _ = tx.send((code, reason.to_string()));
        }
    }
}

/// Test side of one open socket.
pub struct SessionHandle {
    pub url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: oneshot::Receiver<(u16, String)>,
    sent: mpsc::UnboundedReceiver<String>,
}

impl SessionHandle {
    pub fn push(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn text(&self, text: &str) {
        self.push(TransportEvent::Message(text.to_string()));
    }

    /// Wait for the client to close this socket; returns the close code.
    pub async fn closed(self) -> (u16, String) {
        timeout(WAIT, self.closed)
            .await
            .expect("socket was not closed in time")
            .expect("session dropped without close")
    }
}

pub async fn next_session(sessions: &mut mpsc::UnboundedReceiver<SessionHandle>) -> SessionHandle {
    timeout(WAIT, sessions.recv())
        .await
        .expect("no connection attempt in time")
        .expect("transport dropped")
}

/// Poll `condition` until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Client with fast reconnects over a scripted transport.
pub fn client_with(
    transport: Arc<ScriptedTransport>,
    max_attempts: u32,
) -> (StreamClient, Arc<MonitorRegistry>) {
    let registry = Arc::new(MonitorRegistry::new());
    let config = ClientConfig {
        base_url: "wss://venue.test:9443".to_string(),
        reconnect: ReconnectConfig::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
            2.0,
            0.0,
            max_attempts,
        ),
    };
    let client = StreamClient::new(config, transport, Arc::clone(&registry));
    (client, registry)
}
