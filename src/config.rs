//! Proxy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::parse::{parse_byte_count, AddressSpec};
use crate::rate_limit::{RateLimit, SharedRateLimit};

/// Default broker.
pub const DEFAULT_BROKER_URL: &str = "snowflake-broker.bamsoftware.com";

/// Default relay host.
pub const DEFAULT_RELAY_HOST: &str = "snowflake.bamsoftware.com";

/// Default STUN server.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Smallest rate limit accepted, in bytes per second.
pub const MIN_RATE_LIMIT: u64 = 10 * 1024;

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker base URL, normalised by the broker client
    pub broker_url: String,
    /// Relay to forward client traffic to
    pub relay_addr: AddressSpec,
    /// Use `wss` rather than `ws` for the relay
    pub relay_secure: bool,
    /// Rate limit in bytes per second; `None` is unlimited
    pub rate_limit_bytes: Option<u64>,
    /// Smallest accepted rate limit
    pub min_rate_limit: u64,
    /// Averaging window of the rate limiter
    pub rate_limit_history: Duration,
    /// Time between broker polls
    pub poll_interval: Duration,
    /// Sessions allowed to relay at once
    pub max_clients: usize,
    /// Pool capacity
    pub connections_per_client: usize,
    /// ICE server URLs for the peer transport
    pub ice_servers: Vec<String>,
    /// How long the relay transport may take to open
    pub relay_connect_timeout: Duration,
    /// How long an accepted offer may wait for the client's data channel
    pub datachannel_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            relay_addr: AddressSpec::new(DEFAULT_RELAY_HOST, 443),
            relay_secure: true,
            rate_limit_bytes: None,
            min_rate_limit: MIN_RATE_LIMIT,
            rate_limit_history: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5000),
            max_clients: 1,
            connections_per_client: 1,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            relay_connect_timeout: Duration::from_secs(5),
            datachannel_timeout: Duration::from_secs(20),
        }
    }
}

impl Config {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.broker_url.trim().is_empty() {
            return Err(Error::config("broker_url cannot be empty"));
        }
        if self.relay_addr.host.is_empty() {
            return Err(Error::config("relay host cannot be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll_interval must be positive"));
        }
        if self.connections_per_client == 0 {
            return Err(Error::config("connections_per_client must be at least 1"));
        }
        if self.max_clients == 0 {
            return Err(Error::config("max_clients must be at least 1"));
        }
        if self.rate_limit_history.is_zero() {
            return Err(Error::config("rate_limit_history must be positive"));
        }
        if let Some(rate) = self.rate_limit_bytes {
            if rate < self.min_rate_limit {
                return Err(Error::config(format!(
                    "rate limit {} B/s is below the minimum of {} B/s",
                    rate, self.min_rate_limit
                )));
            }
        }
        Ok(())
    }

    /// Build the rate limiter shared by all sessions.
    pub fn rate_limiter(&self) -> SharedRateLimit {
        SharedRateLimit::new(RateLimit::from_budget(
            self.rate_limit_bytes,
            self.rate_limit_history,
        ))
    }

    /// Pool capacity.
    pub fn pool_capacity(&self) -> usize {
        self.connections_per_client
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Broker URL
    pub broker_url: String,
    /// Relay host name or address
    pub relay_host: String,
    /// Relay port
    pub relay_port: u16,
    /// Use `wss` for the relay
    pub relay_secure: bool,
    /// Byte count such as `"100k"`, or `"off"`
    pub rate_limit: String,
    /// Rate limit window (seconds)
    pub rate_limit_history_secs: f64,
    /// Broker poll interval (milliseconds)
    pub poll_interval_ms: u64,
    /// Sessions allowed to relay at once
    pub max_clients: usize,
    /// Pool capacity
    pub connections_per_client: usize,
    /// ICE server URLs
    pub ice_servers: Vec<String>,
    /// Relay connect timeout (milliseconds)
    pub relay_connect_timeout_ms: u64,
    /// Data channel timeout (milliseconds)
    pub datachannel_timeout_ms: u64,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<Config> {
        let rate_limit_bytes = match self.rate_limit.trim() {
            "" | "off" => None,
            spec => Some(parse_byte_count(spec)?),
        };

        if !self.rate_limit_history_secs.is_finite() || self.rate_limit_history_secs <= 0.0 {
            return Err(Error::config("rate_limit_history_secs must be positive"));
        }
        let rate_limit_history = Duration::try_from_secs_f64(self.rate_limit_history_secs)
            .map_err(|e| Error::config(format!("rate_limit_history_secs: {}", e)))?;

        Ok(Config {
            broker_url: self.broker_url.clone(),
            relay_addr: AddressSpec::new(self.relay_host.clone(), self.relay_port),
            relay_secure: self.relay_secure,
            rate_limit_bytes,
            min_rate_limit: MIN_RATE_LIMIT,
            rate_limit_history,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_clients: self.max_clients,
            connections_per_client: self.connections_per_client,
            ice_servers: self.ice_servers.clone(),
            relay_connect_timeout: Duration::from_millis(self.relay_connect_timeout_ms),
            datachannel_timeout: Duration::from_millis(self.datachannel_timeout_ms),
        })
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            broker_url: config.broker_url.clone(),
            relay_host: config.relay_addr.host.clone(),
            relay_port: config.relay_addr.port,
            relay_secure: config.relay_secure,
            rate_limit: config
                .rate_limit_bytes
                .map_or_else(|| "off".to_string(), |n| n.to_string()),
            rate_limit_history_secs: config.rate_limit_history.as_secs_f64(),
            poll_interval_ms: config.poll_interval.as_millis() as u64,
            max_clients: config.max_clients,
            connections_per_client: config.connections_per_client,
            ice_servers: config.ice_servers.clone(),
            relay_connect_timeout_ms: config.relay_connect_timeout.as_millis() as u64,
            datachannel_timeout_ms: config.datachannel_timeout.as_millis() as u64,
        }
    }
}
