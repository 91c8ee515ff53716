//! Sequence Gap Detection
//!
//! Consumers feed the venue's per-stream sequence numbers (trade ids,
//! update ids) and the tracker records a data gap whenever numbers are
//! skipped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::monitor::MonitorRegistry;

/// Outcome of observing one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// First number seen for the stream.
    First,
    /// Exactly one more than the previous number.
    InOrder,
    /// Same number as the previous one.
    Duplicate,
    /// Numbers were skipped.
    Gap {
        /// How many numbers are missing.
        missing: u64,
    },
    /// Lower than the previous number; the baseline was reset.
    Reset,
}

/// Per-stream sequence tracker feeding `record_data_gap`.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use market_stream_client::application::services::{SequenceCheck, SequenceGapTracker};
/// use market_stream_client::domain::monitor::MonitorRegistry;
///
/// let registry = Arc::new(MonitorRegistry::new());
/// let tracker = SequenceGapTracker::new(Arc::clone(&registry));
///
/// tracker.observe("btcusdt@trade", 100);
/// assert_eq!(tracker.observe("btcusdt@trade", 103), SequenceCheck::Gap { missing: 2 });
/// assert_eq!(registry.get_monitor("btcusdt@trade").get_metrics().data_gaps, 1);
/// ```
#[derive(Debug)]
pub struct SequenceGapTracker {
    registry: Arc<MonitorRegistry>,
    last_seen: Mutex<HashMap<String, u64>>,
}

impl SequenceGapTracker {
    /// Create a tracker recording into `registry`.
    #[must_use]
    pub fn new(registry: Arc<MonitorRegistry>) -> Self {
        Self {
            registry,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Observe `sequence` on `stream`.
    pub fn observe(&self, stream: &str, sequence: u64) -> SequenceCheck {
        let previous = self.last_seen.lock().insert(stream.to_string(), sequence);

        let check = match previous {
            None => SequenceCheck::First,
            Some(prev) if sequence == prev => SequenceCheck::Duplicate,
            Some(prev) if sequence < prev => SequenceCheck::Reset,
            Some(prev) if sequence == prev + 1 => SequenceCheck::InOrder,
            Some(prev) => SequenceCheck::Gap {
                missing: sequence - prev - 1,
            },
        };

        if let SequenceCheck::Gap { missing } = check {
            tracing::warn!(stream, sequence, missing, "Sequence gap detected");
            self.registry.get_monitor(stream).record_data_gap();
        }

        check
    }

    /// Forget the baseline for `stream`, e.g. after a resubscribe.
    pub fn reset(&self, stream: &str) {
        self.last_seen.lock().remove(stream);
    }
}
