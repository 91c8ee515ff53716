//! Stale Data Detection
//!
//! Periodically scans every registered monitor and records a stale data
//! event for connected streams that have gone quiet.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::monitor::MonitorRegistry;

/// Configuration for the staleness watchdog.
#[derive(Debug, Clone)]
pub struct StalenessConfig {
    /// How often monitors are scanned.
    pub check_interval: Duration,
    /// Silence after which a connected stream is stale.
    pub stale_after: Duration,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(10),
        }
    }
}

impl StalenessConfig {
    /// Create configuration from `ClientSettings`.
    #[must_use]
    pub fn from_settings(settings: &crate::ClientSettings) -> Self {
        Self {
            stale_after: settings.stale_after,
            ..Self::default()
        }
    }
}

/// Records one stale event per quiet episode of a connected stream.
///
/// An episode is identified by the last activity timestamp (last message, or
/// the connect time if nothing arrived yet). A newer message starts a new
/// episode, so a stream that recovers and stalls again is flagged again.
#[derive(Debug)]
pub struct StalenessWatchdog {
    registry: Arc<MonitorRegistry>,
    config: StalenessConfig,
    flagged: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl StalenessWatchdog {
    /// Create a watchdog over `registry`.
    #[must_use]
    pub fn new(registry: Arc<MonitorRegistry>, config: StalenessConfig) -> Self {
        Self {
            registry,
            config,
            flagged: Mutex::new(HashMap::new()),
        }
    }

    /// Scan every monitor once. Returns the number of streams newly flagged.
    pub fn check_once(&self, now: DateTime<Utc>) -> usize {
        let monitors = self.registry.get_all_monitors();
        let mut flagged = self.flagged.lock();
        let live: HashSet<&str> = monitors.iter().map(|monitor| monitor.name()).collect();
        flagged.retain(|name, _| live.contains(name.as_str()));

        let mut newly_stale = 0;
        for monitor in &monitors {
            let metrics = monitor.get_metrics();
            if !metrics.is_connected() {
                continue;
            }

            let (Some(last_activity), Some(silent_for)) =
                (metrics.last_activity_at(), metrics.silent_for(now))
            else {
                continue;
            };
            if silent_for < self.config.stale_after {
                continue;
            }

            if flagged.get(monitor.name()) == Some(&last_activity) {
                continue;
            }

            flagged.insert(monitor.name().to_string(), last_activity);
            monitor.record_stale_data();
            newly_stale += 1;

            tracing::warn!(
                stream = monitor.name(),
                silent_ms = u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                "Stream data is stale"
            );
        }

        newly_stale
    }

    /// Number of streams with a remembered stale episode.
    #[must_use]
    pub fn tracked_streams(&self) -> usize {
        self.flagged.lock().len()
    }

    /// Scan on every check interval until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Staleness watchdog cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    self.check_once(Utc::now());
                }
            }
        }
    }
}
