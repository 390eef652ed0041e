//! Snowflake proxy binary
//!
//! Usage: snowflake-proxy [OPTIONS]
//!
//! Polls the broker for clients and relays their traffic until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;

use snowflake::broker::http::HttpTransport;
use snowflake::config::{Config, ConfigFile};
use snowflake::parse::{parse_address, parse_byte_count, AddressSpec};
use snowflake::transport::webrtc::WebRtcConnector;
use snowflake::transport::websocket::WebSocketConnector;
use snowflake::ui::VerboseUi;
use snowflake::{Context, Snowflake};

#[derive(Debug, Parser)]
#[command(name = "snowflake-proxy", version, about = "Snowflake volunteer proxy")]
struct Args {
    /// TOML configuration file; flags override its values
    #[arg(short, long, env = "SNOWFLAKE_CONFIG")]
    config: Option<PathBuf>,

    /// Broker URL
    #[arg(long)]
    broker: Option<String>,

    /// Relay as `host:port` or `[v6]:port`
    #[arg(long, conflicts_with_all = ["relay_host", "relay_port"])]
    relay: Option<String>,

    /// Relay host
    #[arg(long)]
    relay_host: Option<String>,

    /// Relay port
    #[arg(long)]
    relay_port: Option<u16>,

    /// Connect to the relay with `ws` instead of `wss`
    #[arg(long)]
    insecure_relay: bool,

    /// Rate limit in bytes per second, e.g. `100k`; `off` disables it
    #[arg(long)]
    ratelimit: Option<String>,

    /// Broker poll interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Number of pending sessions kept in the pool
    #[arg(long)]
    capacity: Option<usize>,

    /// Sessions allowed to relay at once
    #[arg(long)]
    max_clients: Option<usize>,

    /// ICE server URL; may be repeated
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = build_config(&args)?;

    if args.print_config {
        println!("# Snowflake proxy configuration");
        println!();
        println!("{}", toml::to_string_pretty(&ConfigFile::from_config(&config))?);
        return Ok(());
    }

    run_proxy(config).await
}

fn build_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let file: ConfigFile = toml::from_str(&content)?;
            file.to_config()?
        }
        None => Config::default(),
    };

    if let Some(broker) = &args.broker {
        config.broker_url = broker.clone();
    }
    if let Some(relay) = &args.relay {
        config.relay_addr = parse_address(relay)?;
    }
    if let Some(host) = &args.relay_host {
        config.relay_addr = AddressSpec::new(host.clone(), config.relay_addr.port);
    }
    if let Some(port) = args.relay_port {
        config.relay_addr.port = port;
    }
    if args.insecure_relay {
        config.relay_secure = false;
    }
    if let Some(rate) = &args.ratelimit {
        config.rate_limit_bytes = match rate.trim() {
            "" | "off" => None,
            spec => Some(parse_byte_count(spec)?),
        };
    }
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval = Duration::from_millis(ms);
    }
    if let Some(capacity) = args.capacity {
        config.connections_per_client = capacity;
    }
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }
    if !args.ice_servers.is_empty() {
        config.ice_servers = args.ice_servers.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn run_proxy(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting snowflake proxy {}", snowflake::VERSION);
    tracing::info!("Broker: {}", config.broker_url);
    tracing::info!(
        "Relay: {}://{}",
        if config.relay_secure { "wss" } else { "ws" },
        config.relay_addr
    );
    match config.rate_limit_bytes {
        Some(rate) => tracing::info!("Rate limit: {} B/s", rate),
        None => tracing::info!("Rate limit: off"),
    }

    let ctx = Context::new(
        config.clone(),
        Arc::new(VerboseUi),
        Arc::new(HttpTransport::new()?),
        Arc::new(WebRtcConnector::new()),
        Arc::new(WebSocketConnector::new(config.relay_secure)),
    )?;
    let metrics = Arc::clone(&ctx.metrics);

    let proxy = Snowflake::new(Arc::new(ctx));
    proxy.begin();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    proxy.disable().await;

    println!("{}", metrics.format_report());
    Ok(())
}
