//! Configuration Module
//!
//! Environment-driven settings for the stream client.

mod settings;

pub use settings::{ClientSettings, ConfigError, DEFAULT_BASE_URL};
