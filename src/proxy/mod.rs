//! Relay sessions.
//!
//! A [`ProxyPair`] joins one client data channel to one relay connection.
//! It runs as its own task and is driven through a [`PairHandle`].

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;

pub mod pair;
pub mod relay;
pub mod state;

pub use pair::{PairHandle, ProxyPair};
pub use relay::{RelayPump, Side, MAX_BUFFER};
pub use state::SessionState;

/// Opaque per-session identifier sent to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh id from 64 random bits.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// The id as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
