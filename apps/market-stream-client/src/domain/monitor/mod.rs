//! Stream Health Monitoring
//!
//! Per-stream counters and timing statistics with push-based snapshot
//! subscription.
//!
//! # Metrics
//!
//! - **Traffic**: message count, running mean message size, per-second rate
//! - **Latency**: most recent ping latency and its running mean
//! - **Errors**: error count with the last error and when it happened
//! - **Quality**: data gaps and stale data events reported by detectors
//!
//! Running means are updated incrementally (`mean += (x - mean) / n`), so a
//! monitor holds constant state regardless of how many messages it has seen.

mod registry;

pub use registry::MonitorRegistry;

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::ReentrantMutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::{Listener, ListenerSet};

/// Interval at which `message_rate` is recomputed.
pub const RATE_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Connection Status
// =============================================================================

/// Connection status of a stream as seen by its monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No live connection.
    #[default]
    Disconnected,
    /// Socket is being opened.
    Connecting,
    /// Socket is open and delivering data.
    Connected,
    /// Waiting to retry after a drop.
    Reconnecting,
    /// Transport error or reconnect budget exhausted.
    Error,
}

impl ConnectionStatus {
    /// Status name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Metrics Snapshot
// =============================================================================

/// Immutable copy of a stream's metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Stream name.
    pub stream: String,
    /// Connection status.
    pub connection_status: ConnectionStatus,
    /// Messages received.
    pub message_count: u64,
    /// Errors recorded.
    pub error_count: u64,
    /// Running mean message size in bytes.
    pub average_message_size: f64,
    /// Messages per second over the last rate window.
    pub message_rate: f64,
    /// Most recent ping latency in milliseconds.
    pub ping_latency: f64,
    /// Running mean ping latency in milliseconds.
    pub average_latency: f64,
    /// Most recent error message.
    pub last_error: Option<String>,
    /// When the most recent error was recorded.
    pub last_error_at: Option<DateTime<Utc>>,
    /// When the most recent message arrived.
    pub last_message_received_at: Option<DateTime<Utc>>,
    /// When the stream last became connected.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Data gaps reported by a sequence detector.
    pub data_gaps: u64,
    /// Stale data events reported by a staleness detector.
    pub stale_data_events: u64,
}

impl MetricsSnapshot {
    /// Default metrics for a stream.
    #[must_use]
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            connection_status: ConnectionStatus::Disconnected,
            message_count: 0,
            error_count: 0,
            average_message_size: 0.0,
            message_rate: 0.0,
            ping_latency: 0.0,
            average_latency: 0.0,
            last_error: None,
            last_error_at: None,
            last_message_received_at: None,
            last_connected_at: None,
            data_gaps: 0,
            stale_data_events: 0,
        }
    }

    /// Whether the stream is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_status == ConnectionStatus::Connected
    }

    /// Most recent sign of life: the last message, or the connect time if
    /// nothing has arrived yet.
    #[must_use]
    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_message_received_at.or(self.last_connected_at)
    }

    /// Time since [`MetricsSnapshot::last_activity_at`], zero if that lies
    /// after `now`.
    #[must_use]
    pub fn silent_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_activity_at()
            .map(|at| (now - at).to_std().unwrap_or_default())
    }
}

// =============================================================================
// Stream Monitor
// =============================================================================

#[derive(Debug)]
struct MonitorState {
    snapshot: MetricsSnapshot,
    window_messages: u64,
    latency_samples: u64,
}

/// Handle returned by [`StreamMonitor::subscribe`].
#[must_use = "dropping the handle keeps the subscriber registered"]
pub struct MonitorSubscription {
    monitor: Weak<StreamMonitor>,
    listener: Arc<Listener<MetricsSnapshot>>,
}

impl MonitorSubscription {
    /// Stop receiving snapshots. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.subscribers.remove(self.listener.id());
        }
        self.listener.cancel();
    }

    /// Whether the subscriber still receives snapshots.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.listener.is_active()
    }
}

impl std::fmt::Debug for MonitorSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorSubscription")
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

/// Health monitor for one stream.
///
/// Every mutating call notifies subscribers with a fresh snapshot. Mutation
/// and notification happen under one re-entrant lock, so subscribers see
/// snapshots in mutation order and may call back into the monitor.
///
/// # Example
///
/// ```rust
/// use market_stream_client::domain::monitor::StreamMonitor;
///
/// let monitor = StreamMonitor::new("btcusdt@trade");
/// monitor.record_message(100);
/// monitor.record_message(300);
///
/// let metrics = monitor.get_metrics();
/// assert_eq!(metrics.message_count, 2);
/// assert!((metrics.average_message_size - 200.0).abs() < f64::EPSILON);
/// monitor.dispose();
/// ```
pub struct StreamMonitor {
    name: String,
    state: ReentrantMutex<RefCell<MonitorState>>,
    subscribers: ListenerSet<MetricsSnapshot>,
    disposed: AtomicBool,
    me: Weak<Self>,
    rate_interval: Duration,
    rate_timer_live: AtomicBool,
    rate_cancel: CancellationToken,
}

impl StreamMonitor {
    /// Create a monitor with the default one-second rate window.
    ///
    /// The rate timer starts on the first tokio runtime that records into the
    /// monitor and restarts if that runtime goes away. Without any runtime
    /// the window is only rolled by [`StreamMonitor::roll_rate_window`].
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_rate_interval(name, RATE_INTERVAL)
    }

    /// Create a monitor with a custom rate window.
    #[must_use]
    pub fn with_rate_interval(name: impl Into<String>, interval: Duration) -> Arc<Self> {
        let name = name.into();
        let monitor = Arc::new_cyclic(|me| Self {
            state: ReentrantMutex::new(RefCell::new(MonitorState {
                snapshot: MetricsSnapshot::new(name.clone()),
                window_messages: 0,
                latency_samples: 0,
            })),
            name,
            subscribers: ListenerSet::new(),
            disposed: AtomicBool::new(false),
            me: me.clone(),
            rate_interval: interval,
            rate_timer_live: AtomicBool::new(false),
            rate_cancel: CancellationToken::new(),
        });
        monitor.ensure_rate_timer();
        monitor
    }

    /// Stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether [`StreamMonitor::dispose`] has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Set the connection status, stamping `last_connected_at` on entry
    /// into `Connected`.
    pub fn set_connection_status(&self, status: ConnectionStatus) {
        self.mutate(|state| {
            let snapshot = &mut state.snapshot;
            if status == ConnectionStatus::Connected
                && snapshot.connection_status != ConnectionStatus::Connected
            {
                snapshot.last_connected_at = Some(Utc::now());
            }
            snapshot.connection_status = status;
        });
    }

    /// Record a received message of `byte_size` bytes.
    pub fn record_message(&self, byte_size: usize) {
        self.ensure_rate_timer();
        self.mutate(|state| {
            let snapshot = &mut state.snapshot;
            snapshot.message_count += 1;
            #[allow(clippy::cast_precision_loss)]
            {
                snapshot.average_message_size = running_mean(
                    snapshot.average_message_size,
                    byte_size as f64,
                    snapshot.message_count,
                );
            }
            snapshot.last_message_received_at = Some(Utc::now());
            state.window_messages += 1;
        });
    }

    /// Record a ping round trip in milliseconds.
    pub fn record_ping_latency(&self, latency_ms: f64) {
        self.mutate(|state| {
            state.latency_samples += 1;
            let snapshot = &mut state.snapshot;
            snapshot.ping_latency = latency_ms;
            snapshot.average_latency =
                running_mean(snapshot.average_latency, latency_ms, state.latency_samples);
        });
    }

    /// Record an error.
    pub fn record_error(&self, error: impl std::fmt::Display) {
        let message = error.to_string();
        self.mutate(|state| {
            let snapshot = &mut state.snapshot;
            snapshot.error_count += 1;
            snapshot.last_error = Some(message);
            snapshot.last_error_at = Some(Utc::now());
        });
    }

    /// Record a detected data gap.
    pub fn record_data_gap(&self) {
        self.mutate(|state| state.snapshot.data_gaps += 1);
    }

    /// Record a detected stale data condition.
    pub fn record_stale_data(&self) {
        self.mutate(|state| state.snapshot.stale_data_events += 1);
    }

    /// Current metrics.
    #[must_use]
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.state.lock().borrow().snapshot.clone()
    }

    /// Register a subscriber.
    ///
    /// The subscriber is invoked immediately with the current snapshot and
    /// again after every mutation until unsubscribed.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> MonitorSubscription
    where
        F: Fn(&MetricsSnapshot) + Send + Sync + 'static,
    {
        let guard = self.state.lock();
        let listener = self.subscribers.add(Box::new(callback));

        if self.is_disposed() {
            self.subscribers.remove(listener.id());
        } else {
            let snapshot = guard.borrow().snapshot.clone();
            if let Err(panic) = listener.deliver(&snapshot) {
                tracing::error!(stream = %self.name, error = %panic, "Monitor subscriber failed");
            }
        }
        drop(guard);

        MonitorSubscription {
            monitor: Arc::downgrade(self),
            listener,
        }
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Recompute `message_rate` from messages seen since the previous roll.
    ///
    /// Called by the rate timer; exposed for hosts without a tokio runtime.
    pub fn roll_rate_window(&self, elapsed: Duration) {
        if self.is_disposed() {
            return;
        }

        let guard = self.state.lock();
        let changed = {
            let mut state = guard.borrow_mut();
            let secs = elapsed.as_secs_f64();
            #[allow(clippy::cast_precision_loss)]
            let rate = if secs > 0.0 {
                state.window_messages as f64 / secs
            } else {
                0.0
            };
            state.window_messages = 0;

            let changed = (state.snapshot.message_rate - rate).abs() > f64::EPSILON;
            state.snapshot.message_rate = rate;
            changed.then(|| state.snapshot.clone())
        };

        if let Some(snapshot) = changed {
            self.notify(&snapshot);
        }
    }

    /// Stop the rate timer and detach all subscribers. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.rate_cancel.cancel();
        self.subscribers.clear();
        tracing::debug!(stream = %self.name, "Stream monitor disposed");
    }

    fn mutate(&self, apply: impl FnOnce(&mut MonitorState)) {
        if self.is_disposed() {
            return;
        }

        let guard = self.state.lock();
        let snapshot = {
            let mut state = guard.borrow_mut();
            apply(&mut state);
            state.snapshot.clone()
        };
        self.notify(&snapshot);
    }

    fn notify(&self, snapshot: &MetricsSnapshot) {
        for panic in self.subscribers.broadcast(snapshot) {
            tracing::error!(stream = %self.name, error = %panic, "Monitor subscriber failed");
        }
    }

    /// Start the rate timer on the current runtime unless one is running.
    ///
    /// A no-op outside a tokio runtime or after dispose.
    pub fn ensure_rate_timer(&self) {
        if self.rate_timer_live.load(Ordering::Acquire) || self.is_disposed() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self
            .rate_timer_live
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let monitor = self.me.clone();
        let cancel = self.rate_cancel.clone();
        let period = self.rate_interval;
        // Clears the live flag when the task ends or its runtime drops it.
        let live = RateTimerLive(self.me.clone());

        runtime.spawn(async move {
            let _live = live;
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else {
                            break;
                        };
                        monitor.roll_rate_window(period);
                    }
                }
            }
        });
        tracing::trace!(stream = %self.name, "Rate timer started");
    }

    /// Whether a rate timer task is currently alive.
    #[must_use]
    pub fn has_rate_timer(&self) -> bool {
        self.rate_timer_live.load(Ordering::Acquire)
    }
}

struct RateTimerLive(Weak<StreamMonitor>);

impl Drop for RateTimerLive {
    fn drop(&mut self) {
        if let Some(monitor) = self.0.upgrade() {
            monitor.rate_timer_live.store(false, Ordering::Release);
        }
    }
}

impl Drop for StreamMonitor {
    fn drop(&mut self) {
        self.rate_cancel.cancel();
    }
}

impl std::fmt::Debug for StreamMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMonitor")
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .field("subscribers", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_precision_loss)]
fn running_mean(mean: f64, sample: f64, count: u64) -> f64 {
    mean + (sample - mean) / count as f64
}

// =============================================================================
// Tests
// =============================================================================
