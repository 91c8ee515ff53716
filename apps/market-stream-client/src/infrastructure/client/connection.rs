//! Connection Actor
//!
//! One task per venue connection. The task owns the socket, drives the
//! [`ConnectionState`] machine, routes frames to callbacks and records
//! every lifecycle event on the monitors of the streams it carries.
//!
//! All dispatch for one connection happens on its task, so messages reach
//! callbacks in arrival order and two dispatch passes never overlap.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::reconnect::{ConnectionEvent, ConnectionState, ReconnectError, ReconnectPolicy};
use crate::application::ports::{Transport, TransportError, TransportEvent, TransportSession};
use crate::domain::monitor::{ConnectionStatus, MonitorRegistry};
use crate::domain::streaming::{NormalizedFrame, StreamMessage, StreamPath};
use crate::domain::subscription::DispatchTable;
use crate::infrastructure::metrics;

/// Close code sent when the client closes a connection.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code sent when a broken socket is torn down before reconnecting.
pub const CLOSE_RECONNECTING: u16 = 4000;

/// Called with a connection id once the connection gives up reconnecting.
pub(crate) type ReleaseFn = Box<dyn Fn(Uuid) + Send + Sync>;

// =============================================================================
// Connection
// =============================================================================

/// State shared between a connection task and the client.
pub struct Connection {
    id: Uuid,
    path: StreamPath,
    pub(crate) table: DispatchTable<StreamMessage>,
    pub(crate) cancel: CancellationToken,
    state: RwLock<ConnectionState>,
    attempts: AtomicU32,
}

impl Connection {
    pub(crate) fn new(path: StreamPath, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            path,
            table: DispatchTable::new(),
            cancel,
            state: RwLock::new(ConnectionState::Connecting),
            attempts: AtomicU32::new(0),
        }
    }

    /// Connection identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Streams carried by this connection.
    #[must_use]
    pub const fn path(&self) -> &StreamPath {
        &self.path
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Reconnect attempts since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Whether the connection can still carry new callbacks.
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        !self.state().is_terminal() && !self.cancel.is_cancelled()
    }

    /// Ask the connection task to close the socket and stop.
    pub(crate) fn request_close(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("path", &self.path.path())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Why the message pump stopped.
enum PumpExit {
    CloseRequested,
    Error(TransportError),
    Closed { code: Option<u16>, reason: String },
}

pub(crate) struct ConnectionActor {
    connection: Arc<Connection>,
    url: String,
    transport: Arc<dyn Transport>,
    registry: Arc<MonitorRegistry>,
    policy: ReconnectPolicy,
    release: ReleaseFn,
    open: bool,
}

impl ConnectionActor {
    pub(crate) fn new(
        connection: Arc<Connection>,
        base_url: &str,
        transport: Arc<dyn Transport>,
        registry: Arc<MonitorRegistry>,
        policy: ReconnectPolicy,
        release: ReleaseFn,
    ) -> Self {
        let url = connection.path().url(base_url);
        Self {
            connection,
            url,
            transport,
            registry,
            policy,
            release,
            open: false,
        }
    }

    /// Drive the connection until it is closed or runs out of attempts.
    pub(crate) async fn run(mut self) {
        let cancel = self.connection.cancel.clone();
        self.publish_state();

        loop {
            tracing::debug!(
                connection_id = %self.connection.id,
                url = %self.url,
                attempt = self.policy.attempt_count(),
                "Opening connection"
            );

            let connected = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = self.transport.connect(&self.url) => Some(result),
            };
            let Some(connected) = connected else {
                return self.finish_closed();
            };

            match connected {
                Ok(mut session) => {
                    self.on_open();
                    match self.pump(session.as_mut()).await {
                        PumpExit::CloseRequested => {
                            session.close(CLOSE_NORMAL, "client closed").await;
                            return self.finish_closed();
                        }
                        PumpExit::Error(error) => {
                            self.on_transport_error(&error);
                            session.close(CLOSE_RECONNECTING, "reconnecting").await;
                            self.transition(ConnectionEvent::SocketReleased);
                        }
                        PumpExit::Closed { code, reason } => {
                            self.on_remote_close(code, &reason);
                        }
                    }
                }
                Err(error) => {
                    self.on_transport_error(&error);
                    self.transition(ConnectionEvent::SocketReleased);
                }
            }

            if cancel.is_cancelled() {
                return self.finish_closed();
            }

            let Some(delay) = self.policy.next_delay() else {
                return self.on_retries_exhausted();
            };

            self.schedule_reconnect(delay);

            let retry_due = tokio::select! {
                biased;
                () = cancel.cancelled() => false,
                () = tokio::time::sleep(delay) => true,
            };
            if !retry_due {
                return self.finish_closed();
            }

            self.transition(ConnectionEvent::RetryDue);
        }
    }

    async fn pump(&self, session: &mut dyn TransportSession) -> PumpExit {
        loop {
            let event = tokio::select! {
                biased;
                () = self.connection.cancel.cancelled() => return PumpExit::CloseRequested,
                event = session.next_event() => event,
            };

            match event {
                Some(TransportEvent::Message(text)) => self.handle_frame(&text),
                Some(TransportEvent::Pong(rtt)) => self.record_pong(rtt),
                Some(TransportEvent::Error(error)) => return PumpExit::Error(error),
                Some(TransportEvent::Closed { code, reason }) => {
                    return PumpExit::Closed { code, reason };
                }
                None => {
                    return PumpExit::Closed {
                        code: None,
                        reason: "session ended".to_string(),
                    };
                }
            }
        }
    }

    // =========================================================================
    // Frames
    // =========================================================================

    fn handle_frame(&self, text: &str) {
        match self.connection.path.normalize(text) {
            Ok(NormalizedFrame::Routed(message)) => self.dispatch(&message, text.len()),
            Ok(NormalizedFrame::MissingEnvelope) => {
                tracing::debug!(
                    connection_id = %self.connection.id,
                    "Dropping combined frame without stream envelope"
                );
            }
            Ok(NormalizedFrame::UnknownStream(stream)) => {
                tracing::debug!(
                    connection_id = %self.connection.id,
                    stream = %stream,
                    "Dropping frame for stream not carried by this connection"
                );
            }
            Err(error) => {
                tracing::warn!(
                    connection_id = %self.connection.id,
                    error = %error,
                    "Malformed frame"
                );
                metrics::record_malformed_frame();
                for name in self.connection.path.names() {
                    self.registry.get_monitor(name).record_error(&error);
                }
            }
        }
    }

    fn dispatch(&self, message: &StreamMessage, bytes: usize) {
        self.registry
            .get_monitor(&message.stream)
            .record_message(bytes);
        metrics::record_message_received(&message.stream, bytes);

        for listener in self.connection.table.listeners(&message.stream) {
            if let Err(panic) = listener.deliver(message) {
                tracing::error!(
                    connection_id = %self.connection.id,
                    stream = %message.stream,
                    listener = panic.id,
                    error = %panic.message,
                    "Stream callback panicked"
                );
                metrics::record_callback_failure(&message.stream);
            }
        }
    }

    fn record_pong(&self, rtt: Duration) {
        let latency_ms = rtt.as_secs_f64() * 1000.0;
        metrics::record_ping_latency(rtt);
        for name in self.connection.path.names() {
            self.registry.get_monitor(name).record_ping_latency(latency_ms);
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn on_open(&mut self) {
        self.transition(ConnectionEvent::Opened);
        self.policy.reset();
        self.connection.attempts.store(0, Ordering::Relaxed);
        self.open = true;
        metrics::connection_opened();

        tracing::info!(
            connection_id = %self.connection.id,
            streams = %self.connection.path,
            "Connection open"
        );
    }

    fn on_transport_error(&mut self, error: &TransportError) {
        self.transition(ConnectionEvent::TransportError);
        self.mark_socket_gone();
        metrics::record_transport_error(error.kind());

        tracing::warn!(
            connection_id = %self.connection.id,
            error = %error,
            "Transport error"
        );

        for name in self.connection.path.names() {
            self.registry.get_monitor(name).record_error(error);
        }
    }

    fn on_remote_close(&mut self, code: Option<u16>, reason: &str) {
        // Members see the drop before the backoff starts.
        self.set_member_status(ConnectionStatus::Disconnected);
        self.transition(ConnectionEvent::TransportClosed);
        self.mark_socket_gone();

        tracing::info!(
            connection_id = %self.connection.id,
            code = ?code,
            reason,
            "Connection closed by remote"
        );
    }

    fn schedule_reconnect(&self, delay: Duration) {
        let attempt = self.policy.attempt_count();
        self.connection.attempts.store(attempt, Ordering::Relaxed);
        metrics::record_reconnect();

        tracing::info!(
            connection_id = %self.connection.id,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnect scheduled"
        );
    }

    fn on_retries_exhausted(self) {
        self.transition(ConnectionEvent::RetriesExhausted);
        metrics::record_reconnect_exhausted();

        let error = ReconnectError::MaxAttemptsExceeded(self.policy.max_attempts());
        tracing::error!(
            connection_id = %self.connection.id,
            streams = %self.connection.path,
            error = %error,
            "Giving up on connection"
        );

        for name in self.connection.path.names() {
            self.registry.get_monitor(name).record_error(&error);
        }

        (self.release)(self.connection.id);
    }

    fn finish_closed(mut self) {
        self.transition(ConnectionEvent::CloseRequested);
        self.mark_socket_gone();

        tracing::info!(
            connection_id = %self.connection.id,
            streams = %self.connection.path,
            "Connection closed"
        );
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn transition(&self, event: ConnectionEvent) {
        let mut state = self.connection.state.write();
        let current = *state;
        match current.on(event) {
            Some(next) => {
                *state = next;
                drop(state);
                tracing::trace!(
                    connection_id = %self.connection.id,
                    from = %current,
                    to = %next,
                    "Connection state changed"
                );
                self.set_member_status(next.monitor_status());
            }
            None => {
                tracing::debug!(
                    connection_id = %self.connection.id,
                    state = %current,
                    event = ?event,
                    "Ignoring event in current state"
                );
            }
        }
    }

    fn mark_socket_gone(&mut self) {
        if std::mem::replace(&mut self.open, false) {
            metrics::connection_closed();
        }
    }

    fn publish_state(&self) {
        self.set_member_status(self.connection.state().monitor_status());
    }

    fn set_member_status(&self, status: ConnectionStatus) {
        for name in self.connection.path.names() {
            self.registry.get_monitor(name).set_connection_status(status);
        }
    }
}
