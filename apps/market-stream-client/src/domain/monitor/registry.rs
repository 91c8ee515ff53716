//! Monitor Registry
//!
//! Keyed store of [`StreamMonitor`] instances shared by every consumer that
//! needs to observe a stream.
//!
//! The registry is an ordinary value: construct one per client in tests, or
//! use [`MonitorRegistry::global`] for the process-wide instance.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use super::{MetricsSnapshot, StreamMonitor};

static GLOBAL_REGISTRY: OnceLock<Arc<MonitorRegistry>> = OnceLock::new();

#[derive(Default)]
struct RegistryState {
    monitors: HashMap<String, Arc<StreamMonitor>>,
    order: Vec<String>,
}

/// Insertion-ordered map of stream name to monitor.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use market_stream_client::domain::monitor::MonitorRegistry;
///
/// let registry = MonitorRegistry::new();
/// let a = registry.get_monitor("btcusdt@trade");
/// let b = registry.get_monitor("btcusdt@trade");
/// assert!(Arc::ptr_eq(&a, &b));
///
/// registry.remove_monitor("btcusdt@trade");
/// let c = registry.get_monitor("btcusdt@trade");
/// assert!(!Arc::ptr_eq(&a, &c));
/// ```
#[derive(Default)]
pub struct MonitorRegistry {
    state: RwLock<RegistryState>,
}

impl MonitorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_REGISTRY.get_or_init(|| Arc::new(Self::new())))
    }

    /// Get the monitor for `name`, creating it on first access.
    ///
    /// Concurrent lookups for the same name always observe one instance.
    pub fn get_monitor(&self, name: &str) -> Arc<StreamMonitor> {
        if let Some(monitor) = self.state.read().monitors.get(name) {
            return Arc::clone(monitor);
        }

        let mut state = self.state.write();
        if let Some(monitor) = state.monitors.get(name) {
            return Arc::clone(monitor);
        }

        let monitor = StreamMonitor::new(name);
        state.monitors.insert(name.to_string(), Arc::clone(&monitor));
        state.order.push(name.to_string());
        tracing::debug!(stream = name, "Stream monitor created");
        monitor
    }

    /// Get the monitor for `name` without creating it.
    #[must_use]
    pub fn find_monitor(&self, name: &str) -> Option<Arc<StreamMonitor>> {
        self.state.read().monitors.get(name).cloned()
    }

    /// All monitors in insertion order.
    #[must_use]
    pub fn get_all_monitors(&self) -> Vec<Arc<StreamMonitor>> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|name| state.monitors.get(name).cloned())
            .collect()
    }

    /// Snapshots of every monitor in insertion order.
    #[must_use]
    pub fn snapshots(&self) -> Vec<MetricsSnapshot> {
        self.get_all_monitors()
            .iter()
            .map(|monitor| monitor.get_metrics())
            .collect()
    }

    /// Dispose and remove the monitor for `name`. Unknown names are ignored.
    ///
    /// Recorders still holding the old instance become no-ops; the next
    /// [`MonitorRegistry::get_monitor`] creates a fresh monitor.
    pub fn remove_monitor(&self, name: &str) {
        let removed = {
            let mut state = self.state.write();
            let removed = state.monitors.remove(name);
            if removed.is_some() {
                state.order.retain(|n| n != name);
            }
            removed
        };

        if let Some(monitor) = removed {
            monitor.dispose();
            tracing::debug!(stream = name, "Stream monitor removed");
        }
    }

    /// Dispose and remove every monitor.
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.write();
            state.order.clear();
            state.monitors.drain().map(|(_, m)| m).collect()
        };

        for monitor in drained {
            monitor.dispose();
        }
    }

    /// Number of monitors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().monitors.len()
    }

    /// Whether the registry holds no monitors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().monitors.is_empty()
    }
}

impl std::fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorRegistry")
            .field("streams", &self.state.read().order)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
