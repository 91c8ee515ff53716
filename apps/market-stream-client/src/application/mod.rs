//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (venue transport).
pub mod ports;

/// Application services for staleness and gap detection.
pub mod services;
