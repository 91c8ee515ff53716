//! Stream Client
//!
//! Multiplexes logical stream subscriptions over venue connections.
//!
//! - [`StreamClient::connect_to_stream`] carries one stream on a raw
//!   connection (`/ws/{name}`).
//! - [`StreamClient::connect_to_streams`] carries a set of streams on one
//!   combined connection (`/stream?streams=a/b`).
//!
//! Subscribing with a stream set that already has a live connection reuses
//! it. A connection is closed once its last callback is unsubscribed, and
//! every connection is closed by [`StreamClient::close`].

pub mod connection;
pub mod reconnect;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

pub use connection::Connection;
pub use reconnect::{
    ConnectionEvent, ConnectionState, ReconnectConfig, ReconnectError, ReconnectPolicy,
};

use crate::application::ports::Transport;
use crate::domain::monitor::{ConnectionStatus, MonitorRegistry};
use crate::domain::streaming::{StreamMessage, StreamNameError, StreamPath};
use crate::domain::subscription::{Callback, Listener};
use crate::infrastructure::config::{ClientSettings, DEFAULT_BASE_URL};
use connection::ConnectionActor;

// =============================================================================
// Configuration and Errors
// =============================================================================

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Venue base URL.
    pub base_url: String,
    /// Reconnection behavior for every connection.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create configuration from `ClientSettings`.
    #[must_use]
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            base_url: settings.base_url.clone(),
            reconnect: ReconnectConfig::from_settings(settings),
        }
    }
}

/// Errors returned to callers of [`StreamClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The client has been closed.
    #[error("stream client is closed")]
    Closed,

    /// A stream name or stream list was rejected.
    #[error(transparent)]
    InvalidStream(#[from] StreamNameError),

    /// Subscribing requires a tokio runtime to drive the connection.
    #[error("no tokio runtime available to drive the connection")]
    NoRuntime,
}

/// Snapshot of one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection identifier.
    pub id: Uuid,
    /// Address path relative to the base URL.
    pub path: String,
    /// Streams carried.
    pub streams: Vec<String>,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Reconnect attempts since the last successful open.
    pub reconnect_attempts: u32,
}

// =============================================================================
// Client
// =============================================================================

#[derive(Default)]
struct ConnectionMap {
    closed: bool,
    by_path: HashMap<StreamPath, Arc<Connection>>,
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<MonitorRegistry>,
    cancel: CancellationToken,
    connections: Mutex<ConnectionMap>,
    tracker: TaskTracker,
}

impl ClientInner {
    /// Drop `connection` from the map and stop it if no callbacks remain.
    ///
    /// The emptiness check runs under the map lock, which subscribers also
    /// hold while registering, so a concurrent subscribe either lands before
    /// the check or gets a fresh connection.
    fn release_if_idle(&self, connection: &Arc<Connection>) {
        let mut map = self.connections.lock();
        if !connection.table.is_empty() {
            return;
        }

        if map
            .by_path
            .get(connection.path())
            .is_some_and(|current| Arc::ptr_eq(current, connection))
        {
            map.by_path.remove(connection.path());
        }
        drop(map);

        connection.request_close();
        tracing::debug!(
            connection_id = %connection.id(),
            streams = %connection.path(),
            "Last callback removed, closing connection"
        );
    }

    /// Forget a connection that gave up reconnecting.
    fn release(&self, id: Uuid) {
        self.connections
            .lock()
            .by_path
            .retain(|_, connection| connection.id() != id);
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Resilient multiplexing client for venue streams.
///
/// Cloning yields another handle to the same client.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use market_stream_client::{
///     ClientConfig, HeartbeatConfig, MonitorRegistry, StreamClient, WebSocketTransport,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = Arc::new(MonitorRegistry::new());
/// let transport = Arc::new(WebSocketTransport::new(HeartbeatConfig::default()));
/// let client = StreamClient::new(ClientConfig::default(), transport, registry);
///
/// let subscription = client.connect_to_stream("btcusdt@trade", |message| {
///     println!("{}: {}", message.stream, message.data);
/// })?;
///
/// // ...
/// subscription.unsubscribe();
/// client.close();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<ClientInner>,
}

impl StreamClient {
    /// Create a client. No connection is opened until the first subscribe.
    #[must_use]
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<MonitorRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                registry,
                cancel: CancellationToken::new(),
                connections: Mutex::new(ConnectionMap::default()),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Monitor registry this client records into.
    #[must_use]
    pub fn registry(&self) -> &Arc<MonitorRegistry> {
        &self.inner.registry
    }

    /// Subscribe `callback` to a single stream.
    ///
    /// Returns immediately; the connection is established in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, the client is closed, or no
    /// tokio runtime is running.
    pub fn connect_to_stream<F>(&self, name: &str, callback: F) -> Result<Subscription, ClientError>
    where
        F: Fn(&StreamMessage) + Send + Sync + 'static,
    {
        let path = StreamPath::single(name)?;
        self.subscribe(path, Box::new(callback))
    }

    /// Subscribe `callback` to every stream in `names` over one combined
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty or has an invalid name, the
    /// client is closed, or no tokio runtime is running.
    pub fn connect_to_streams<S, F>(
        &self,
        names: &[S],
        callback: F,
    ) -> Result<Subscription, ClientError>
    where
        S: AsRef<str>,
        F: Fn(&StreamMessage) + Send + Sync + 'static,
    {
        let path = StreamPath::combined(names)?;
        self.subscribe(path, Box::new(callback))
    }

    fn subscribe(
        &self,
        path: StreamPath,
        callback: Callback<StreamMessage>,
    ) -> Result<Subscription, ClientError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ClientError::NoRuntime)?;

        for name in path.names() {
            self.inner.registry.get_monitor(name).ensure_rate_timer();
        }

        let listener = Arc::new(Listener::new(callback));
        let mut map = self.inner.connections.lock();
        if map.closed {
            return Err(ClientError::Closed);
        }

        let reusable = map
            .by_path
            .get(&path)
            .filter(|existing| existing.is_reusable())
            .cloned();
        let (connection, spawn) = match reusable {
            Some(existing) => (existing, false),
            None => {
                let connection = Arc::new(Connection::new(
                    path.clone(),
                    self.inner.cancel.child_token(),
                ));
                map.by_path.insert(path.clone(), Arc::clone(&connection));
                (connection, true)
            }
        };

        for name in path.names() {
            connection.table.register_listener(name, Arc::clone(&listener));
        }

        if spawn {
            let actor = ConnectionActor::new(
                Arc::clone(&connection),
                &self.inner.config.base_url,
                Arc::clone(&self.inner.transport),
                Arc::clone(&self.inner.registry),
                ReconnectPolicy::new(self.inner.config.reconnect.clone()),
                self.release_fn(),
            );
            self.inner.tracker.spawn_on(actor.run(), &runtime);
            tracing::info!(
                connection_id = %connection.id(),
                streams = %path,
                "Connection created"
            );
        }
        drop(map);

        tracing::debug!(
            connection_id = %connection.id(),
            listener = listener.id(),
            streams = %path,
            "Callback subscribed"
        );

        Ok(Subscription {
            client: Arc::downgrade(&self.inner),
            connection,
            listener,
            active: AtomicBool::new(true),
        })
    }

    fn release_fn(&self) -> connection::ReleaseFn {
        let client = Arc::downgrade(&self.inner);
        Box::new(move |id| {
            if let Some(inner) = client.upgrade() {
                inner.release(id);
            }
        })
    }

    /// Close every connection and disable reconnection.
    ///
    /// Terminal: later subscribes fail with [`ClientError::Closed`]. Safe to
    /// call more than once.
    pub fn close(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut map = self.inner.connections.lock();
            if map.closed {
                return;
            }
            map.closed = true;
            map.by_path.drain().map(|(_, connection)| connection).collect()
        };

        self.inner.cancel.cancel();
        self.inner.tracker.close();

        for connection in &drained {
            connection.table.clear();
            for name in connection.path().names() {
                self.inner
                    .registry
                    .get_monitor(name)
                    .set_connection_status(ConnectionStatus::Disconnected);
            }
        }

        tracing::info!(connections = drained.len(), "Stream client closed");
    }

    /// Close the client and wait for every connection task to finish.
    pub async fn shutdown(&self) {
        self.close();
        self.inner.tracker.wait().await;
    }

    /// Whether [`StreamClient::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.connections.lock().closed
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().by_path.len()
    }

    /// Snapshot of every live connection.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .connections
            .lock()
            .by_path
            .values()
            .map(|connection| ConnectionInfo {
                id: connection.id(),
                path: connection.path().path(),
                streams: connection.path().names().to_vec(),
                state: connection.state(),
                reconnect_attempts: connection.reconnect_attempts(),
            })
            .collect()
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("base_url", &self.inner.config.base_url)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Handle for one callback registered with [`StreamClient`].
///
/// Dropping the handle does not unsubscribe.
#[must_use = "dropping the handle keeps the callback registered"]
pub struct Subscription {
    client: Weak<ClientInner>,
    connection: Arc<Connection>,
    listener: Arc<Listener<StreamMessage>>,
    active: AtomicBool,
}

impl Subscription {
    /// Remove this callback.
    ///
    /// Once this returns the callback will not be invoked again. If it was
    /// the connection's last callback the connection is closed. Safe to call
    /// more than once, including from inside the callback.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        self.listener.cancel();
        for name in self.connection.path().names() {
            self.connection.table.unregister(name, self.listener.id());
        }

        match self.client.upgrade() {
            Some(inner) => inner.release_if_idle(&self.connection),
            None if self.connection.table.is_empty() => self.connection.request_close(),
            None => {}
        }

        tracing::debug!(
            connection_id = %self.connection.id(),
            listener = self.listener.id(),
            "Callback unsubscribed"
        );
    }

    /// Whether the callback is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.listener.is_active()
    }

    /// Streams this callback receives.
    #[must_use]
    pub fn streams(&self) -> &[String] {
        self.connection.path().names()
    }

    /// Identifier of the connection carrying this callback.
    #[must_use]
    pub fn connection_id(&self) -> Uuid {
        self.connection.id()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("connection", &self.connection.id())
            .field("listener", &self.listener.id())
            .field("active", &self.is_active())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
