//! # Snowflake proxy
//!
//! A volunteer relay for the Snowflake pluggable transport. The proxy asks a
//! broker for a censored client, answers the client's WebRTC offer, and then
//! shuttles opaque bytes between the client's data channel and a fixed relay
//! reached over a WebSocket.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Snowflake: poll loop + bounded session pool             │
//! ├──────────────────────────────────────────────────────────┤
//! │  ProxyPair: session state machine + RelayPump            │
//! ├────────────────────────────┬─────────────────────────────┤
//! │  Broker (HTTP long-poll)   │  Transports (peer / relay)  │
//! ├────────────────────────────┴─────────────────────────────┤
//! │  RateLimiter shared by every session                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! All collaborators are assembled once into a [`Context`] and passed down
//! explicitly, so several independent proxies can live in one process.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod parse;
pub mod proxy;
pub mod rate_limit;
pub mod snowflake;
pub mod transport;
pub mod ui;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use context::Context;
pub use error::{Error, Result};
pub use snowflake::Snowflake;

/// Proxy version reported in logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
