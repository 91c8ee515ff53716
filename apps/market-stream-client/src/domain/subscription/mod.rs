//! Subscription Management Types
//!
//! Listener registration shared by stream callbacks and monitor subscribers,
//! plus the per-connection dispatch table.
//!
//! # Design
//!
//! A [`Listener`] wraps one callback together with an `active` flag and a
//! re-entrant gate. Delivery holds the gate for the duration of the call and
//! cancellation takes the same gate, so once [`Listener::cancel`] returns no
//! further invocation can start or still be running on another thread. The
//! gate is re-entrant so a callback may cancel itself (or record on a
//! monitor) without deadlocking.
//!
//! The [`DispatchTable`] maps stream names to listeners in registration
//! order, so every message for a stream reaches its callbacks in the order
//! they were registered.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{ReentrantMutex, RwLock};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a registered listener.
pub type ListenerId = u64;

/// A stream name string (e.g. `btcusdt@trade`).
pub type StreamName = String;

/// Callback invoked with a borrowed value.
pub type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Listener
// =============================================================================

/// A panic raised by a listener during delivery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("listener {id} panicked: {message}")]
pub struct ListenerPanic {
    /// Listener that panicked.
    pub id: ListenerId,
    /// Panic payload rendered as text.
    pub message: String,
}

/// One registered callback.
pub struct Listener<T> {
    id: ListenerId,
    active: AtomicBool,
    gate: ReentrantMutex<()>,
    callback: Callback<T>,
}

impl<T> Listener<T> {
    /// Create a new active listener.
    #[must_use]
    pub fn new(callback: Callback<T>) -> Self {
        Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            gate: ReentrantMutex::new(()),
            callback,
        }
    }

    /// Listener identifier.
    #[must_use]
    pub const fn id(&self) -> ListenerId {
        self.id
    }

    /// Whether the listener still receives values.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Deliver a value, isolating panics raised by the callback.
    ///
    /// Returns `Ok(false)` if the listener was cancelled and the callback
    /// was not invoked.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerPanic`] if the callback panicked.
    pub fn deliver(&self, value: &T) -> Result<bool, ListenerPanic> {
        let _gate = self.gate.lock();
        if !self.is_active() {
            return Ok(false);
        }

        catch_unwind(AssertUnwindSafe(|| (self.callback)(value)))
            .map(|()| true)
            .map_err(|payload| ListenerPanic {
                id: self.id,
                message: panic_message(payload.as_ref()),
            })
    }

    /// Stop delivery.
    ///
    /// Blocks until an in-flight delivery on another thread has finished.
    /// Returns `true` only for the call that actually deactivated the listener.
    pub fn cancel(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        drop(self.gate.lock());
        was_active
    }
}

impl<T> std::fmt::Debug for Listener<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// =============================================================================
// Listener Set
// =============================================================================

/// Ordered collection of listeners for a single value type.
pub struct ListenerSet<T> {
    listeners: RwLock<Vec<Arc<Listener<T>>>>,
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ListenerSet<T> {
    /// Create an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback, returning its listener.
    pub fn add(&self, callback: Callback<T>) -> Arc<Listener<T>> {
        let listener = Arc::new(Listener::new(callback));
        self.listeners.write().push(Arc::clone(&listener));
        listener
    }

    /// Cancel and remove a listener. Unknown ids are ignored.
    pub fn remove(&self, id: ListenerId) -> bool {
        let removed = {
            let mut listeners = self.listeners.write();
            listeners
                .iter()
                .position(|l| l.id() == id)
                .map(|idx| listeners.remove(idx))
        };

        removed.is_some_and(|listener| listener.cancel())
    }

    /// Cancel and remove every listener.
    pub fn clear(&self) {
        let drained: Vec<_> = self.listeners.write().drain(..).collect();
        for listener in drained {
            listener.cancel();
        }
    }

    /// Listeners in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Listener<T>>> {
        self.listeners.read().clone()
    }

    /// Deliver a value to every listener in registration order.
    ///
    /// A panicking listener does not stop delivery to the rest; its panic is
    /// returned in the result list.
    pub fn broadcast(&self, value: &T) -> Vec<ListenerPanic> {
        self.snapshot()
            .iter()
            .filter_map(|listener| listener.deliver(value).err())
            .collect()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listeners are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

// =============================================================================
// Dispatch Table
// =============================================================================

/// Per-connection mapping from stream name to callbacks.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use market_stream_client::domain::subscription::{DispatchTable, Listener};
///
/// let table: DispatchTable<String> = DispatchTable::new();
/// let listener = Arc::new(Listener::new(Box::new(|_: &String| {})));
/// table.register_listener("btcusdt@trade", Arc::clone(&listener));
/// assert_eq!(table.listeners("btcusdt@trade").len(), 1);
///
/// table.unregister("btcusdt@trade", listener.id());
/// assert!(table.is_empty());
/// ```
pub struct DispatchTable<T> {
    streams: RwLock<HashMap<StreamName, Vec<Arc<Listener<T>>>>>,
}

impl<T> Default for DispatchTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DispatchTable<T> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Register a listener for a stream.
    ///
    /// Combined subscriptions attach one listener to every stream in the set.
    pub fn register_listener(&self, stream: &str, listener: Arc<Listener<T>>) {
        self.streams
            .write()
            .entry(stream.to_string())
            .or_default()
            .push(listener);
    }

    /// Remove a listener from a stream.
    ///
    /// Returns `true` if the listener was registered for that stream. Empty
    /// stream entries are dropped.
    pub fn unregister(&self, stream: &str, id: ListenerId) -> bool {
        let mut streams = self.streams.write();
        let Some(listeners) = streams.get_mut(stream) else {
            return false;
        };

        let before = listeners.len();
        listeners.retain(|l| l.id() != id);
        let removed = listeners.len() != before;

        if listeners.is_empty() {
            streams.remove(stream);
        }

        removed
    }

    /// Listeners for a stream in registration order.
    #[must_use]
    pub fn listeners(&self, stream: &str) -> Vec<Arc<Listener<T>>> {
        self.streams.read().get(stream).cloned().unwrap_or_default()
    }

    /// Whether any callback remains.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }

    /// Cancel and drop every listener.
    pub fn clear(&self) {
        let drained: Vec<_> = self.streams.write().drain().collect();
        for (_, listeners) in drained {
            for listener in listeners {
                listener.cancel();
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, Callback<u32>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Box::new(move |v: &u32| sink.lock().push(*v)))
    }

    fn listener() -> Arc<Listener<u32>> {
        Arc::new(Listener::new(Box::new(|_| {})))
    }

    #[test]
    fn listener_delivers_while_active() {
        let (seen, callback) = recorder();
        let listener = Listener::new(callback);

        assert_eq!(listener.deliver(&7), Ok(true));
        assert!(listener.cancel());
        assert_eq!(listener.deliver(&8), Ok(false));
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[test]
    fn listener_cancel_is_idempotent() {
        let listener: Listener<u32> = Listener::new(Box::new(|_| {}));
        assert!(listener.cancel());
        assert!(!listener.cancel());
    }

    #[test]
    fn listener_isolates_panics() {
        let listener: Listener<u32> = Listener::new(Box::new(|_| panic!("boom")));
        let err = listener.deliver(&1).unwrap_err();
        assert_eq!(err.message, "boom");
        assert!(listener.is_active());
    }

    #[test]
    fn listener_can_cancel_itself_during_delivery() {
        let slot: Arc<Mutex<Option<Arc<Listener<u32>>>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let listener = Arc::new(Listener::new(Box::new(move |_: &u32| {
            if let Some(me) = inner.lock().clone() {
                me.cancel();
            }
        })));
        *slot.lock() = Some(Arc::clone(&listener));

        assert_eq!(listener.deliver(&1), Ok(true));
        assert!(!listener.is_active());
        assert_eq!(listener.deliver(&2), Ok(false));
        slot.lock().take();
    }

    #[test]
    fn set_broadcasts_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let set: ListenerSet<u32> = ListenerSet::new();
        for tag in 0..3 {
            let order = Arc::clone(&order);
            set.add(Box::new(move |_| order.lock().push(tag)));
        }

        assert!(set.broadcast(&0).is_empty());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn set_continues_after_panicking_listener() {
        let (seen, callback) = recorder();
        let set: ListenerSet<u32> = ListenerSet::new();
        set.add(Box::new(|_| panic!("first fails")));
        set.add(callback);

        let panics = set.broadcast(&5);
        assert_eq!(panics.len(), 1);
        assert_eq!(*seen.lock(), vec![5]);
    }

    #[test]
    fn set_remove_and_clear() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let a = set.add(Box::new(|_| {}));
        let b = set.add(Box::new(|_| {}));

        assert!(set.remove(a.id()));
        assert!(!set.remove(a.id()));
        assert_eq!(set.len(), 1);

        set.clear();
        assert!(set.is_empty());
        assert!(!b.is_active());
    }

    #[test]
    fn table_tracks_streams() {
        let table: DispatchTable<u32> = DispatchTable::new();
        let a = listener();
        let b = listener();
        table.register_listener("a", Arc::clone(&a));
        table.register_listener("a", Arc::clone(&b));
        table.register_listener("b", Arc::clone(&a));

        assert_eq!(table.listeners("a").len(), 2);
        assert_eq!(table.listeners("b").len(), 1);
        assert_eq!(table.listeners("a")[0].id(), a.id());

        assert!(table.unregister("a", a.id()));
        assert!(table.unregister("b", a.id()));
        assert!(!table.unregister("b", a.id()));
        assert!(table.listeners("b").is_empty());
        assert_eq!(table.listeners("a").len(), 1);

        assert!(table.unregister("a", b.id()));
        assert!(table.is_empty());
    }

    #[test]
    fn table_clear_cancels_listeners() {
        let table: DispatchTable<u32> = DispatchTable::new();
        let listener = listener();
        table.register_listener("a", Arc::clone(&listener));
        table.clear();
        assert!(table.is_empty());
        assert!(!listener.is_active());
    }
}
