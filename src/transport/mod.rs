//! Transport capabilities consumed by the relay engine.
//!
//! A session pairs two transports:
//!
//! ```text
//!   client <-- peer transport (data channel) --> proxy <-- streaming transport --> relay
//! ```
//!
//! Both sides are seen through the same narrow contract: a [`Channel`] that
//! can `send` and `close` and reports its buffered amount, plus a single
//! inbound stream of [`TransportEvent`]s. The relay engine consumes events in
//! its own dispatch loop, so the session state machine decides what each
//! event means.
//!
//! Providers:
//!
//! 1. **memory**: in-process channels for embedding and tests
//! 2. **websocket** (feature `websocket`): relay connections over tokio-tungstenite
//! 3. **webrtc** (feature `webrtc`): client data channels over webrtc-rs
//!
//! The network providers share [`queued::QueuedChannel`] so that sends never
//! block the relay engine.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ConnectError, Error, Result};
use crate::parse::AddressSpec;

pub mod memory;
pub mod queued;

#[cfg(feature = "webrtc")]
pub mod webrtc;
#[cfg(feature = "websocket")]
pub mod websocket;

/// Inbound event from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport finished opening
    Open,
    /// A binary chunk arrived
    Message(Bytes),
    /// The transport closed
    Close,
    /// The transport failed; treated like a close
    Error(String),
}

/// Transport readiness, mirroring the browser `readyState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Still opening
    Connecting,
    /// Open for sending
    Open,
    /// Close requested
    Closing,
    /// Terminal
    Closed,
}

impl ReadyState {
    /// Check if the transport can no longer carry data.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReadyState::Closing | ReadyState::Closed)
    }
}

/// Outbound half of a transport.
pub trait Channel: Send {
    /// Label used in log lines.
    fn label(&self) -> &str;

    /// Current readiness.
    fn ready_state(&self) -> ReadyState;

    /// Bytes handed to `send` but not yet written to the network.
    fn buffered_amount(&self) -> usize;

    /// Queue a chunk for sending.
    fn send(&mut self, data: Bytes) -> Result<()>;

    /// Begin closing. Idempotent.
    fn close(&mut self);

    /// Check if the transport is open for sending.
    fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }
}

/// Stream of inbound events for one transport.
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// A transport as handed to the relay engine.
pub struct Endpoint {
    /// Outbound half
    pub channel: Box<dyn Channel>,
    /// Inbound events
    pub events: EventStream,
}

impl Endpoint {
    /// Bundle a channel with its events.
    pub fn new(channel: Box<dyn Channel>, events: EventStream) -> Self {
        Self { channel, events }
    }
}

/// Negotiation document type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer from the initiating peer
    Offer,
    /// Provisional answer
    Pranswer,
    /// Final answer
    Answer,
    /// Negotiation rollback
    Rollback,
}

/// An offer or answer as exchanged through the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Document type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Parse the JSON form `{"type": ..., "sdp": ...}`.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::offer(e.to_string()))
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Peer connection for one session, answering a client's offer.
#[async_trait]
pub trait PeerConnection: Send {
    /// Apply the client's offer.
    async fn set_remote_description(&mut self, offer: SessionDescription) -> Result<()>;

    /// The description applied by `set_remote_description`, if any.
    fn remote_description(&self) -> Option<&SessionDescription>;

    /// Create the local answer and wait for candidate gathering to finish.
    async fn create_answer(&mut self) -> Result<SessionDescription>;

    /// Wait for the data channel opened by the client.
    async fn accept_channel(&mut self) -> Result<Endpoint>;

    /// Tear down the connection.
    async fn close(&mut self);
}

/// Creates peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a peer connection using the given ICE server URLs.
    async fn connect(&self, ice_servers: &[String]) -> Result<Box<dyn PeerConnection>>;
}

/// Opens streaming-transport connections to the relay.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Begin connecting to `addr`.
    ///
    /// Returns as soon as the attempt is underway; the endpoint reports
    /// `Open` (or `Error`) through its event stream. `params` are added to
    /// the connection request.
    async fn connect(
        &self,
        addr: &AddressSpec,
        params: &[(String, String)],
    ) -> std::result::Result<Endpoint, ConnectError>;
}
