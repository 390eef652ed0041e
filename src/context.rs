//! Application context shared by the orchestrator and its sessions.

use std::sync::Arc;

use crate::broker::{Broker, BrokerTransport};
use crate::config::Config;
use crate::error::Result;
use crate::metrics::ProxyMetrics;
use crate::rate_limit::SharedRateLimit;
use crate::transport::{PeerConnector, RelayConnector};
use crate::ui::Ui;

/// Everything a proxy instance needs, built once at startup.
pub struct Context {
    /// Validated configuration
    pub config: Config,
    /// Limiter shared by every session
    pub rate_limit: SharedRateLimit,
    /// Presentation sink
    pub ui: Arc<dyn Ui>,
    /// Broker client
    pub broker: Broker,
    /// Peer transport factory
    pub peers: Arc<dyn PeerConnector>,
    /// Relay transport factory
    pub relays: Arc<dyn RelayConnector>,
    /// Counters
    pub metrics: Arc<ProxyMetrics>,
}

impl Context {
    /// Validate `config` and assemble a context around it.
    pub fn new(
        config: Config,
        ui: Arc<dyn Ui>,
        broker: Arc<dyn BrokerTransport>,
        peers: Arc<dyn PeerConnector>,
        relays: Arc<dyn RelayConnector>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            rate_limit: config.rate_limiter(),
            broker: Broker::new(&config.broker_url, broker),
            config,
            ui,
            peers,
            relays,
            metrics: Arc::new(ProxyMetrics::new()),
        })
    }
}
