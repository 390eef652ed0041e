//! Proxy metrics collection.
//!
//! Aggregate counters only. Nothing here identifies a client: no addresses,
//! no session ids, no payload.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

/// Proxy metrics collector.
pub struct ProxyMetrics {
    /// Process start time
    start_time: Instant,
    /// Broker polls issued
    polls: AtomicU64,
    /// Polls released by the broker without a client
    broker_timeouts: AtomicU64,
    /// Polls or answers that failed for any other reason
    broker_failures: AtomicU64,
    /// Offers rejected locally
    offers_rejected: AtomicU64,
    /// Sessions created
    sessions_started: AtomicU64,
    /// Sessions torn down
    sessions_completed: AtomicU64,
    /// Client data channels that opened
    clients_served: AtomicU64,
    /// Relay connections that failed or timed out
    relay_failures: AtomicU64,
    /// Bytes relayed client -> relay
    bytes_to_relay: AtomicU64,
    /// Bytes relayed relay -> client
    bytes_to_client: AtomicU64,
}

impl ProxyMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            polls: AtomicU64::new(0),
            broker_timeouts: AtomicU64::new(0),
            broker_failures: AtomicU64::new(0),
            offers_rejected: AtomicU64::new(0),
            sessions_started: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            clients_served: AtomicU64::new(0),
            relay_failures: AtomicU64::new(0),
            bytes_to_relay: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
        }
    }

    /// Increment poll count.
    pub fn increment_polls(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment broker timeout count.
    pub fn increment_broker_timeouts(&self) {
        self.broker_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment broker failure count.
    pub fn increment_broker_failures(&self) {
        self.broker_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment rejected offer count.
    pub fn increment_offers_rejected(&self) {
        self.offers_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment started session count.
    pub fn increment_sessions_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment completed session count.
    pub fn increment_sessions_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment served client count.
    pub fn increment_clients_served(&self) {
        self.clients_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment relay failure count.
    pub fn increment_relay_failures(&self) {
        self.relay_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes to the client -> relay counter.
    pub fn add_bytes_to_relay(&self, bytes: u64) {
        self.bytes_to_relay.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes to the relay -> client counter.
    pub fn add_bytes_to_client(&self, bytes: u64) {
        self.bytes_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            polls: self.polls.load(Ordering::Relaxed),
            broker_timeouts: self.broker_timeouts.load(Ordering::Relaxed),
            broker_failures: self.broker_failures.load(Ordering::Relaxed),
            offers_rejected: self.offers_rejected.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            clients_served: self.clients_served.load(Ordering::Relaxed),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
            bytes_to_relay: self.bytes_to_relay.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"Snowflake Proxy Metrics
=======================
Uptime: {} seconds

Broker:
  Polls:           {}
  Timeouts:        {}
  Failures:        {}
  Offers Rejected: {}

Sessions:
  Started:        {}
  Completed:      {}
  Clients Served: {}
  Relay Failures: {}

Traffic:
  Client -> Relay: {} bytes
  Relay -> Client: {} bytes
"#,
            snapshot.uptime_secs,
            snapshot.polls,
            snapshot.broker_timeouts,
            snapshot.broker_failures,
            snapshot.offers_rejected,
            snapshot.sessions_started,
            snapshot.sessions_completed,
            snapshot.clients_served,
            snapshot.relay_failures,
            snapshot.bytes_to_relay,
            snapshot.bytes_to_client,
        )
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Seconds since the counters were created
    pub uptime_secs: u64,
    /// Broker polls issued
    pub polls: u64,
    /// Polls that ended without a client
    pub broker_timeouts: u64,
    /// Broker requests that failed or returned an unexpected status
    pub broker_failures: u64,
    /// Offers refused as malformed or mistyped
    pub offers_rejected: u64,
    /// Sessions created
    pub sessions_started: u64,
    /// Sessions fully torn down
    pub sessions_completed: u64,
    /// Client data channels opened
    pub clients_served: u64,
    /// Relay connections that failed to open
    pub relay_failures: u64,
    /// Bytes sent toward the relay
    pub bytes_to_relay: u64,
    /// Bytes sent toward clients
    pub bytes_to_client: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = ProxyMetrics::new();

        metrics.increment_polls();
        metrics.increment_polls();
        metrics.increment_broker_timeouts();
        metrics.add_bytes_to_relay(100);
        metrics.add_bytes_to_client(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.polls, 2);
        assert_eq!(snapshot.broker_timeouts, 1);
        assert_eq!(snapshot.bytes_to_relay, 100);
        assert_eq!(snapshot.bytes_to_client, 7);
        assert_eq!(snapshot.sessions_started, 0);
    }

    #[test]
    fn test_report_mentions_traffic() {
        let metrics = ProxyMetrics::new();
        metrics.add_bytes_to_relay(4096);

        let report = metrics.format_report();
        assert!(report.contains("Client -> Relay: 4096 bytes"));
        assert!(report.contains("Polls:           0"));
    }
}
