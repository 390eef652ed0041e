//! Client data channels over webrtc-rs.
//!
//! The client always initiates: it sends an offer and opens the data
//! channel. This side applies the offer, answers once candidate gathering
//! has finished (no trickle ICE through the broker) and then waits for the
//! channel to show up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::queued::{ChannelState, Outbound, QueuedChannel};
use super::{
    Endpoint, PeerConnection, PeerConnector, ReadyState, SessionDescription, TransportEvent,
};
use crate::error::{Error, Result};

/// How often the writer re-reads the SCTP buffer while it is non-empty.
const IN_FLIGHT_REFRESH: Duration = Duration::from_millis(50);

fn peer_error(context: &str, err: webrtc::Error) -> Error {
    Error::peer(format!("{}: {}", context, err))
}

fn ready_state(state: RTCDataChannelState) -> ReadyState {
    match state {
        RTCDataChannelState::Open => ReadyState::Open,
        RTCDataChannelState::Closing => ReadyState::Closing,
        RTCDataChannelState::Closed => ReadyState::Closed,
        _ => ReadyState::Connecting,
    }
}

/// Creates webrtc-rs peer connections.
#[derive(Debug, Clone, Default)]
pub struct WebRtcConnector;

impl WebRtcConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, ice_servers: &[String]) -> Result<Box<dyn PeerConnection>> {
        // Data channels only, so no codecs are registered.
        let mut media_engine = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| peer_error("interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut config = RTCConfiguration::default();
        if !ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }];
        }

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| peer_error("peer connection", e))?,
        );

        let (channels_tx, channels_rx) = mpsc::unbounded_channel();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            tracing::debug!(label = %dc.label(), "data channel announced");
            let _ = channels_tx.send(dc);
            Box::pin(async {})
        }));

        Ok(Box::new(WebRtcPeer {
            pc,
            remote: None,
            channels: channels_rx,
        }))
    }
}

/// One answered peer connection.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    remote: Option<SessionDescription>,
    channels: mpsc::UnboundedReceiver<Arc<RTCDataChannel>>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn set_remote_description(&mut self, offer: SessionDescription) -> Result<()> {
        let desc = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| peer_error("offer", e))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| peer_error("remote description", e))?;
        self.remote = Some(offer);
        Ok(())
    }

    fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    async fn create_answer(&mut self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| peer_error("answer", e))?;

        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| peer_error("local description", e))?;
        let _ = gathered.recv().await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::peer("no local description after gathering"))?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn accept_channel(&mut self) -> Result<Endpoint> {
        let dc = self
            .channels
            .recv()
            .await
            .ok_or_else(|| Error::peer("peer connection dropped"))?;
        Ok(wrap_channel(dc))
    }

    async fn close(&mut self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!("peer connection close: {}", e);
        }
    }
}

fn wrap_channel(dc: Arc<RTCDataChannel>) -> Endpoint {
    let state = ChannelState::new(ready_state(dc.ready_state()));
    let (channel, outbound) =
        QueuedChannel::new(format!("datachannel {}", dc.label()), Arc::clone(&state));
    let (events, rx) = mpsc::unbounded_channel();

    {
        let state = Arc::clone(&state);
        let events = events.clone();
        dc.on_open(Box::new(move || {
            state.set(ReadyState::Open);
            let _ = events.send(TransportEvent::Open);
            Box::pin(async {})
        }));
    }
    {
        let events = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = events.send(TransportEvent::Message(msg.data));
            Box::pin(async {})
        }));
    }
    {
        let events = events.clone();
        dc.on_error(Box::new(move |err| {
            let _ = events.send(TransportEvent::Error(err.to_string()));
            Box::pin(async {})
        }));
    }
    {
        let state = Arc::clone(&state);
        let events = events.clone();
        dc.on_close(Box::new(move || {
            state.set(ReadyState::Closed);
            let _ = events.send(TransportEvent::Close);
            Box::pin(async {})
        }));
    }

    // Opened before the handlers were installed.
    if state.get() == ReadyState::Open {
        let _ = events.send(TransportEvent::Open);
    }

    tokio::spawn(write_loop(dc, state, outbound));
    Endpoint::new(Box::new(channel), rx)
}

async fn write_loop(
    dc: Arc<RTCDataChannel>,
    state: Arc<ChannelState>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    loop {
        tokio::select! {
            work = outbound.recv() => match work {
                Some(Outbound::Data(data)) => {
                    let len = data.len();
                    let result = dc.send(&data).await;
                    state.written(len);
                    if let Err(e) = result {
                        tracing::debug!(label = %dc.label(), "data channel send failed: {}", e);
                        break;
                    }
                    state.set_in_flight(dc.buffered_amount().await);
                }
                Some(Outbound::Close) | None => break,
            },
            _ = tokio::time::sleep(IN_FLIGHT_REFRESH), if state.in_flight() > 0 => {
                state.set_in_flight(dc.buffered_amount().await);
            }
        }
    }

    state.set_in_flight(0);
    if let Err(e) = dc.close().await {
        tracing::debug!(label = %dc.label(), "data channel close: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_state_mapping() {
        assert_eq!(ready_state(RTCDataChannelState::Unspecified), ReadyState::Connecting);
        assert_eq!(ready_state(RTCDataChannelState::Connecting), ReadyState::Connecting);
        assert_eq!(ready_state(RTCDataChannelState::Open), ReadyState::Open);
        assert_eq!(ready_state(RTCDataChannelState::Closing), ReadyState::Closing);
        assert_eq!(ready_state(RTCDataChannelState::Closed), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_rejects_malformed_offer() {
        let mut peer = WebRtcConnector::new().connect(&[]).await.unwrap();
        let result = peer
            .set_remote_description(SessionDescription::offer("not sdp"))
            .await;
        assert!(matches!(result, Err(Error::Peer(_))));
        assert!(peer.remote_description().is_none());
        peer.close().await;
    }
}
