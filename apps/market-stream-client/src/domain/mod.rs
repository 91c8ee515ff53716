//! Domain Layer - Core streaming types and business logic.
//!
//! This layer contains the stream health model and subscription bookkeeping.
//! Nothing here performs I/O; the only runtime hook is the monitor's rate
//! timer, which is skipped outside a tokio runtime.

/// Per-stream health monitors and their registry.
pub mod monitor;

/// Stream addressing and frame normalization.
pub mod streaming;

/// Listener registration and per-connection dispatch tables.
pub mod subscription;
