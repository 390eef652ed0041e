//! In-process transports.
//!
//! Each [`channel`] returns the endpoint given to the relay engine together
//! with a [`MemoryRemote`] that plays the other side: it injects events,
//! records what the engine sent, and can simulate a send buffer that is not
//! draining. The connectors hand their remotes out through an mpsc receiver
//! so a harness can drive whole sessions without a network.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    Channel, Endpoint, PeerConnection, PeerConnector, ReadyState, RelayConnector,
    SessionDescription, TransportEvent,
};
use crate::error::{ConnectError, Error, Result};
use crate::parse::AddressSpec;

#[derive(Debug)]
struct Shared {
    state: ReadyState,
    sent: Vec<Bytes>,
    buffered: usize,
    close_calls: usize,
}

/// Engine-side half of an in-memory transport.
pub struct MemoryChannel {
    label: String,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Channel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ReadyState {
        self.shared.lock().state
    }

    fn buffered_amount(&self) -> usize {
        self.shared.lock().buffered
    }

    fn send(&mut self, data: Bytes) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.state != ReadyState::Open {
            return Err(Error::ChannelClosed);
        }
        shared.sent.push(data);
        Ok(())
    }

    fn close(&mut self) {
        let mut shared = self.shared.lock();
        shared.close_calls += 1;
        if shared.state != ReadyState::Closed {
            shared.state = ReadyState::Closed;
            let _ = self.events.send(TransportEvent::Close);
        }
    }
}

/// Test-side half of an in-memory transport.
#[derive(Clone)]
pub struct MemoryRemote {
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryRemote {
    /// Finish opening.
    pub fn open(&self) {
        self.shared.lock().state = ReadyState::Open;
        let _ = self.events.send(TransportEvent::Open);
    }

    /// Deliver a chunk to the engine.
    pub fn deliver(&self, data: impl Into<Bytes>) {
        let _ = self.events.send(TransportEvent::Message(data.into()));
    }

    /// Close from the remote side.
    pub fn close(&self) {
        self.shared.lock().state = ReadyState::Closed;
        let _ = self.events.send(TransportEvent::Close);
    }

    /// Fail from the remote side.
    pub fn fail(&self, reason: impl Into<String>) {
        self.shared.lock().state = ReadyState::Closed;
        let _ = self.events.send(TransportEvent::Error(reason.into()));
    }

    /// Pretend `n` bytes are stuck in the send buffer.
    pub fn set_buffered(&self, n: usize) {
        self.shared.lock().buffered = n;
    }

    /// Chunks the engine has sent, in order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.shared.lock().sent.clone()
    }

    /// Current readiness as seen by the engine.
    pub fn ready_state(&self) -> ReadyState {
        self.shared.lock().state
    }

    /// How many times the engine called `close`.
    pub fn close_calls(&self) -> usize {
        self.shared.lock().close_calls
    }
}

/// Create an in-memory transport starting in `state`.
pub fn channel(label: impl Into<String>, state: ReadyState) -> (Endpoint, MemoryRemote) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Mutex::new(Shared {
        state,
        sent: Vec::new(),
        buffered: 0,
        close_calls: 0,
    }));

    let channel = MemoryChannel {
        label: label.into(),
        shared: Arc::clone(&shared),
        events: tx.clone(),
    };
    let remote = MemoryRemote { shared, events: tx };

    (Endpoint::new(Box::new(channel), rx), remote)
}

/// A connection attempt observed by [`MemoryRelayConnector`].
pub struct RelayAttempt {
    /// Requested relay
    pub addr: AddressSpec,
    /// Request parameters
    pub params: Vec<(String, String)>,
    /// Relay side of the new transport, still connecting
    pub remote: MemoryRemote,
}

/// Relay connector producing in-memory transports.
pub struct MemoryRelayConnector {
    attempts: mpsc::UnboundedSender<RelayAttempt>,
    refuse: Mutex<Option<ConnectError>>,
}

impl MemoryRelayConnector {
    /// Create a connector and the receiver of its attempts.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayAttempt>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                attempts: tx,
                refuse: Mutex::new(None),
            },
            rx,
        )
    }

    /// Make every following attempt fail with `err`.
    pub fn refuse_with(&self, err: ConnectError) {
        *self.refuse.lock() = Some(err);
    }
}

#[async_trait]
impl RelayConnector for MemoryRelayConnector {
    async fn connect(
        &self,
        addr: &AddressSpec,
        params: &[(String, String)],
    ) -> std::result::Result<Endpoint, ConnectError> {
        if let Some(err) = self.refuse.lock().clone() {
            return Err(err);
        }

        let (endpoint, remote) = channel("memory-relay", ReadyState::Connecting);
        let _ = self.attempts.send(RelayAttempt {
            addr: addr.clone(),
            params: params.to_vec(),
            remote,
        });
        Ok(endpoint)
    }
}

/// Test-side handle on a [`MemoryPeerConnection`].
pub struct MemoryPeer {
    remote: Arc<Mutex<Option<SessionDescription>>>,
    channels: mpsc::UnboundedSender<Endpoint>,
    closed: Arc<Mutex<bool>>,
}

impl MemoryPeer {
    /// The offer the engine applied, if any.
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    /// Open a data channel from the client side, still connecting.
    pub fn open_channel(&self) -> MemoryRemote {
        let (endpoint, remote) = channel("memory-client", ReadyState::Connecting);
        let _ = self.channels.send(endpoint);
        remote
    }

    /// Whether the engine closed the peer connection.
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

/// Peer connection whose client is driven through a [`MemoryPeer`].
pub struct MemoryPeerConnection {
    remote: Arc<Mutex<Option<SessionDescription>>>,
    applied: Option<SessionDescription>,
    channels: mpsc::UnboundedReceiver<Endpoint>,
    closed: Arc<Mutex<bool>>,
}

#[async_trait]
impl PeerConnection for MemoryPeerConnection {
    async fn set_remote_description(&mut self, offer: SessionDescription) -> Result<()> {
        *self.remote.lock() = Some(offer.clone());
        self.applied = Some(offer);
        Ok(())
    }

    fn remote_description(&self) -> Option<&SessionDescription> {
        self.applied.as_ref()
    }

    async fn create_answer(&mut self) -> Result<SessionDescription> {
        if self.applied.is_none() {
            return Err(Error::peer("no remote description"));
        }
        Ok(SessionDescription::answer("v=0\r\ns=memory\r\n"))
    }

    async fn accept_channel(&mut self) -> Result<Endpoint> {
        self.channels
            .recv()
            .await
            .ok_or_else(|| Error::peer("peer went away"))
    }

    async fn close(&mut self) {
        *self.closed.lock() = true;
    }
}

/// Peer connector producing in-memory peer connections.
pub struct MemoryPeerConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryPeerConnector {
    /// Create a connector and the receiver of its peers.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { peers: tx }, rx)
    }
}

#[async_trait]
impl PeerConnector for MemoryPeerConnector {
    async fn connect(&self, _ice_servers: &[String]) -> Result<Box<dyn PeerConnection>> {
        let remote = Arc::new(Mutex::new(None));
        let closed = Arc::new(Mutex::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let _ = self.peers.send(MemoryPeer {
            remote: Arc::clone(&remote),
            channels: tx,
            closed: Arc::clone(&closed),
        });

        Ok(Box::new(MemoryPeerConnection {
            remote,
            applied: None,
            channels: rx,
            closed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_events_and_sends() {
        let (mut endpoint, remote) = channel("test", ReadyState::Connecting);

        assert!(endpoint.channel.send(Bytes::from("early")).is_err());

        remote.open();
        assert_eq!(endpoint.events.recv().await, Some(TransportEvent::Open));
        assert!(endpoint.channel.is_open());

        endpoint.channel.send(Bytes::from("hello")).unwrap();
        assert_eq!(remote.sent(), vec![Bytes::from("hello")]);

        remote.deliver("reply");
        assert_eq!(
            endpoint.events.recv().await,
            Some(TransportEvent::Message(Bytes::from("reply")))
        );
    }

    #[tokio::test]
    async fn test_channel_close_is_idempotent() {
        let (mut endpoint, remote) = channel("test", ReadyState::Open);

        endpoint.channel.close();
        endpoint.channel.close();

        assert_eq!(remote.close_calls(), 2);
        assert_eq!(remote.ready_state(), ReadyState::Closed);
        assert_eq!(endpoint.events.recv().await, Some(TransportEvent::Close));
        assert!(endpoint.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_connector_refusal() {
        let (connector, mut attempts) = MemoryRelayConnector::new();
        let addr = AddressSpec::new("127.0.0.1", 9901);

        let endpoint = connector.connect(&addr, &[]).await.unwrap();
        assert_eq!(endpoint.channel.ready_state(), ReadyState::Connecting);
        assert_eq!(attempts.recv().await.unwrap().addr, addr);

        connector.refuse_with(ConnectError::Refused("nope".into()));
        assert!(connector.connect(&addr, &[]).await.is_err());
    }
}
