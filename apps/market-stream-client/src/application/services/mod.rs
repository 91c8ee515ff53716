//! Application Services
//!
//! Detectors that decide when a stream has a gap or has gone stale and
//! record it on the stream's monitor.
//!
//! - `StalenessWatchdog`: flags connected streams with no recent data
//! - `SequenceGapTracker`: flags skipped venue sequence numbers

mod gaps;
mod staleness;

pub use gaps::{SequenceCheck, SequenceGapTracker};
pub use staleness::{StalenessConfig, StalenessWatchdog};
