//! Heartbeat Tracking
//!
//! Tracks client-initiated ping/pong exchanges on one socket. The owning
//! session decides when to ping; the tracker measures round trips and
//! detects sockets that stopped answering.

use std::time::Duration;

use tokio::time::Instant;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// Timeout for pong response before connection is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Create configuration from `ClientSettings`.
    #[must_use]
    pub const fn from_settings(settings: &crate::ClientSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }
}

/// Per-socket ping/pong bookkeeping.
///
/// Any inbound frame after a ping proves the socket alive, but only a pong
/// yields a round-trip sample.
#[derive(Debug)]
pub struct HeartbeatTracker {
    config: HeartbeatConfig,
    ping_sent_at: Option<Instant>,
    last_inbound: Instant,
}

impl HeartbeatTracker {
    /// Create a tracker for a socket opened at `now`.
    #[must_use]
    pub const fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            ping_sent_at: None,
            last_inbound: now,
        }
    }

    /// Interval between pings.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        self.config.ping_interval
    }

    /// Record a ping sent at `now`.
    ///
    /// An unanswered earlier ping keeps its timestamp while the socket stays
    /// silent, so the timeout is measured from the first one. Once inbound
    /// traffic has arrived since that ping its pong is presumed lost and the
    /// new ping replaces it.
    pub fn mark_ping_sent(&mut self, now: Instant) {
        match self.ping_sent_at {
            Some(sent) if self.last_inbound <= sent => {}
            _ => self.ping_sent_at = Some(now),
        }
    }

    /// Whether a ping is awaiting its pong.
    #[must_use]
    pub const fn is_waiting_for_pong(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// Record a pong received at `now`, returning the round trip of the
    /// outstanding ping. Unsolicited pongs return `None`.
    pub fn record_pong(&mut self, now: Instant) -> Option<Duration> {
        self.last_inbound = now;
        self.ping_sent_at
            .take()
            .map(|sent| now.saturating_duration_since(sent))
    }

    /// Record any other inbound frame.
    pub fn record_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    /// How long the socket has been silent while a ping is outstanding, if
    /// that exceeds the pong timeout. Silence is measured from the later of
    /// the ping and the last inbound frame.
    #[must_use]
    pub fn timed_out(&self, now: Instant) -> Option<Duration> {
        let sent = self.ping_sent_at?;
        let waited = now.saturating_duration_since(sent.max(self.last_inbound));
        (waited >= self.config.pong_timeout).then_some(waited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig::new(Duration::from_secs(5), Duration::from_secs(10))
    }

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.pong_timeout, Duration::from_secs(60));
    }

    #[test]
    fn pong_yields_round_trip() {
        let start = Instant::now();
        let mut tracker = HeartbeatTracker::new(config(), start);

        tracker.mark_ping_sent(start);
        assert!(tracker.is_waiting_for_pong());

        let rtt = tracker.record_pong(start + Duration::from_millis(42));
        assert_eq!(rtt, Some(Duration::from_millis(42)));
        assert!(!tracker.is_waiting_for_pong());
    }

    #[test]
    fn unsolicited_pong_has_no_round_trip() {
        let start = Instant::now();
        let mut tracker = HeartbeatTracker::new(config(), start);
        assert_eq!(tracker.record_pong(start), None);
    }

    #[test]
    fn repeated_pings_keep_first_timestamp() {
        let start = Instant::now();
        let mut tracker = HeartbeatTracker::new(config(), start);

        tracker.mark_ping_sent(start);
        tracker.mark_ping_sent(start + Duration::from_secs(5));

        assert_eq!(
            tracker.timed_out(start + Duration::from_secs(10)),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn lost_pong_does_not_inflate_round_trip() {
        let start = Instant::now();
        let mut tracker = HeartbeatTracker::new(config(), start);

        tracker.mark_ping_sent(start);
        for secs in 1..=4 {
            tracker.record_inbound(start + Duration::from_secs(secs));
        }
        let second_ping = start + Duration::from_secs(5);
        tracker.mark_ping_sent(second_ping);
        tracker.record_inbound(start + Duration::from_secs(6));
        assert_eq!(tracker.timed_out(start + Duration::from_secs(12)), None);

        let rtt = tracker.record_pong(second_ping + Duration::from_millis(30));
        assert_eq!(rtt, Some(Duration::from_millis(30)));
    }

    #[test]
    fn silent_socket_keeps_first_ping_after_inbound_before_it() {
        let start = Instant::now();
        let mut tracker = HeartbeatTracker::new(config(), start);

        tracker.record_inbound(start + Duration::from_secs(1));
        tracker.mark_ping_sent(start + Duration::from_secs(2));
        tracker.mark_ping_sent(start + Duration::from_secs(7));

        assert_eq!(
            tracker.timed_out(start + Duration::from_secs(12)),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn no_timeout_without_outstanding_ping() {
        let start = Instant::now();
        let tracker = HeartbeatTracker::new(config(), start);
        assert_eq!(tracker.timed_out(start + Duration::from_secs(600)), None);
    }

    #[test]
    fn timeout_after_silence() {
        let start = Instant::now();
        let mut tracker = HeartbeatTracker::new(config(), start);
        tracker.mark_ping_sent(start);

        assert_eq!(tracker.timed_out(start + Duration::from_secs(9)), None);
        assert!(tracker.timed_out(start + Duration::from_secs(10)).is_some());
    }

    #[test]
    fn inbound_traffic_defers_timeout() {
        let start = Instant::now();
        let mut tracker = HeartbeatTracker::new(config(), start);
        tracker.mark_ping_sent(start);
        tracker.record_inbound(start + Duration::from_secs(1));

        assert_eq!(tracker.timed_out(start + Duration::from_secs(10)), None);
        assert_eq!(
            tracker.timed_out(start + Duration::from_secs(11)),
            Some(Duration::from_secs(10))
        );
    }
}
