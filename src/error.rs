//! Error types for the snowflake proxy.

use thiserror::Error;

use crate::proxy::SessionState;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while relaying.
#[derive(Error, Debug)]
pub enum Error {
    /// The broker held the poll open and released it without a client (504)
    #[error("timed out waiting for a client offer")]
    BrokerTimeout,

    /// The broker answered with a status we do not understand
    #[error("unexpected broker status {0}")]
    BrokerUnexpected(u16),

    /// The request to the broker could not be opened or sent
    #[error("broker request failed: {0}")]
    BrokerRequest(String),

    /// Malformed `host:port` address spec
    #[error("invalid address spec: {0:?}")]
    InvalidAddress(String),

    /// Malformed byte count
    #[error("invalid byte count: {0:?}")]
    InvalidByteCount(String),

    /// Offer document was malformed or not an offer
    #[error("invalid session description: {0}")]
    InvalidOffer(String),

    /// Peer transport provider failed
    #[error("peer transport error: {0}")]
    Peer(String),

    /// Opening the relay transport failed
    #[error("relay connect failed: {0}")]
    Connect(#[from] ConnectError),

    /// Session lifecycle violation
    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// State the session was in
        from: SessionState,
        /// State that was requested
        to: SessionState,
    },

    /// Send on a transport that is not open
    #[error("transport is not open")]
    ChannelClosed,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

/// Outcome of a failed attempt to open the streaming transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The relay did not open in time
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Transient network failure; the next session may succeed
    #[error("transient failure: {0}")]
    Transient(String),

    /// The relay address or request is unusable
    #[error("refused: {0}")]
    Refused(String),
}

impl ConnectError {
    /// Whether a later attempt has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectError::Timeout(_) | ConnectError::Transient(_))
    }
}

impl Error {
    /// Create a new broker request error
    pub fn broker(msg: impl Into<String>) -> Self {
        Error::BrokerRequest(msg.into())
    }

    /// Create a new peer transport error
    pub fn peer(msg: impl Into<String>) -> Self {
        Error::Peer(msg.into())
    }

    /// Create a new invalid offer error
    pub fn offer(msg: impl Into<String>) -> Self {
        Error::InvalidOffer(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if the next poll cycle is expected to recover from this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::BrokerTimeout | Error::BrokerRequest(_) | Error::Network(_) => true,
            Error::Connect(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::BrokerTimeout;
        assert_eq!(err.to_string(), "timed out waiting for a client offer");

        let err = Error::BrokerUnexpected(1337);
        assert_eq!(err.to_string(), "unexpected broker status 1337");

        let err = Error::from(ConnectError::Timeout(5000));
        assert_eq!(err.to_string(), "relay connect failed: timed out after 5000ms");
    }

    #[test]
    fn test_error_recoverable() {
        assert!(Error::BrokerTimeout.is_recoverable());
        assert!(Error::broker("permission denied").is_recoverable());
        assert!(Error::from(ConnectError::Transient("reset".into())).is_recoverable());
        assert!(!Error::from(ConnectError::Refused("bad url".into())).is_recoverable());
        assert!(!Error::BrokerUnexpected(500).is_recoverable());
        assert!(!Error::offer("not an offer").is_recoverable());
    }
}
