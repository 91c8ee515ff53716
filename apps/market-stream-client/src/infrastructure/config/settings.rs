//! Client Configuration Settings
//!
//! Configuration types for the stream client, loaded from environment
//! variables.
//!
//! Values are read through a lookup function so tests can supply them
//! without touching the process environment. Unparseable values fall back
//! to their defaults; combinations that cannot work are rejected.

use std::time::Duration;

/// Default venue endpoint.
pub const DEFAULT_BASE_URL: &str = "wss://stream.binance.com:9443";

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Venue base URL (without the `/ws` or `/stream` path).
    pub base_url: String,
    /// Streams to subscribe to at startup.
    pub streams: Vec<String>,
    /// Subscribe to all startup streams over one combined connection.
    pub combined: bool,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_backoff_factor: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Fractional jitter applied to reconnect delays (0 = none).
    pub reconnect_jitter: f64,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering connection dead.
    pub heartbeat_timeout: Duration,
    /// Age after which a connected stream without messages is stale.
    pub stale_after: Duration,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            streams: vec!["btcusdt@trade".to_string()],
            combined: true,
            reconnect_delay_initial: Duration::from_millis(1000),
            reconnect_delay_max: Duration::from_millis(30_000),
            reconnect_backoff_factor: 2.0,
            max_reconnect_attempts: 10,
            reconnect_jitter: 0.0,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            stale_after: Duration::from_secs(10),
            health_port: 8083,
        }
    }
}

impl ClientSettings {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting settings are inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting settings are inconsistent.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let base_url = lookup("STREAM_CLIENT_BASE_URL")
            .map_or(defaults.base_url, |v| v.trim().to_string());

        let streams = lookup("STREAM_CLIENT_STREAMS").map_or(defaults.streams, |v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        });

        let settings = Self {
            base_url,
            streams,
            combined: parse_bool(&lookup, "STREAM_CLIENT_COMBINED", defaults.combined),
            reconnect_delay_initial: parse_duration_millis(
                &lookup,
                "STREAM_CLIENT_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_duration_millis(
                &lookup,
                "STREAM_CLIENT_RECONNECT_DELAY_MAX_MS",
                defaults.reconnect_delay_max,
            ),
            reconnect_backoff_factor: parse(
                &lookup,
                "STREAM_CLIENT_RECONNECT_BACKOFF_FACTOR",
                defaults.reconnect_backoff_factor,
            ),
            max_reconnect_attempts: parse(
                &lookup,
                "STREAM_CLIENT_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            reconnect_jitter: parse(
                &lookup,
                "STREAM_CLIENT_RECONNECT_JITTER",
                defaults.reconnect_jitter,
            ),
            heartbeat_interval: parse_duration_secs(
                &lookup,
                "STREAM_CLIENT_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_duration_secs(
                &lookup,
                "STREAM_CLIENT_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            stale_after: parse_duration_secs(
                &lookup,
                "STREAM_CLIENT_STALE_AFTER_SECS",
                defaults.stale_after,
            ),
            health_port: parse(&lookup, "STREAM_CLIENT_HEALTH_PORT", defaults.health_port),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Check the settings for combinations that cannot work.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.is_empty() {
            return Err(ConfigError::EmptyValue("STREAM_CLIENT_BASE_URL".to_string()));
        }

        if !self.reconnect_backoff_factor.is_finite() || self.reconnect_backoff_factor < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "STREAM_CLIENT_RECONNECT_BACKOFF_FACTOR".to_string(),
                reason: format!("must be >= 1, got {}", self.reconnect_backoff_factor),
            });
        }

        if self.reconnect_delay_initial > self.reconnect_delay_max {
            return Err(ConfigError::InvalidValue {
                key: "STREAM_CLIENT_RECONNECT_DELAY_INITIAL_MS".to_string(),
                reason: format!(
                    "initial delay {:?} exceeds maximum {:?}",
                    self.reconnect_delay_initial, self.reconnect_delay_max
                ),
            });
        }

        if !(0.0..1.0).contains(&self.reconnect_jitter) {
            return Err(ConfigError::InvalidValue {
                key: "STREAM_CLIENT_RECONNECT_JITTER".to_string(),
                reason: format!("must be in [0, 1), got {}", self.reconnect_jitter),
            });
        }

        for (key, value) in [
            ("STREAM_CLIENT_HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval),
            ("STREAM_CLIENT_HEARTBEAT_TIMEOUT_SECS", self.heartbeat_timeout),
            ("STREAM_CLIENT_STALE_AFTER_SECS", self.stale_after),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable holds a value the client cannot use.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key).map_or(default, |v| match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    })
}

fn parse_duration_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
