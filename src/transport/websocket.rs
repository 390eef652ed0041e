//! Relay connections over WebSocket.
//!
//! Each connection is driven by one task that first completes the handshake
//! and then multiplexes between frames from the relay and chunks queued by
//! the engine. Only binary frames carry data.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::queued::{ChannelState, Outbound, QueuedChannel};
use super::{Endpoint, ReadyState, RelayConnector, TransportEvent};
use crate::error::ConnectError;
use crate::parse::AddressSpec;

/// Build the relay URL: `ws[s]://host[:port]/?params`.
///
/// IPv6 hosts are bracketed and the port is left out when it is the
/// scheme's default.
pub fn build_url(addr: &AddressSpec, secure: bool, params: &[(String, String)]) -> String {
    let (scheme, default_port) = if secure { ("wss", 443) } else { ("ws", 80) };

    let mut url = if addr.host.contains(':') {
        format!("{}://[{}]", scheme, addr.host)
    } else {
        format!("{}://{}", scheme, addr.host)
    };
    if addr.port != default_port {
        url.push_str(&format!(":{}", addr.port));
    }
    url.push('/');

    if !params.is_empty() {
        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        url.push('?');
        url.push_str(&query.join("&"));
    }
    url
}

/// Sort a handshake failure into retryable and final conditions.
pub fn classify(err: &WsError) -> ConnectError {
    match err {
        WsError::Url(_) | WsError::Http(_) | WsError::HttpFormat(_) => {
            ConnectError::Refused(err.to_string())
        }
        _ => ConnectError::Transient(err.to_string()),
    }
}

/// Opens relay connections with tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    secure: bool,
}

impl WebSocketConnector {
    /// Create a connector; `secure` selects `wss`.
    pub fn new(secure: bool) -> Self {
        Self { secure }
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(
        &self,
        addr: &AddressSpec,
        params: &[(String, String)],
    ) -> Result<Endpoint, ConnectError> {
        let url = build_url(addr, self.secure, params);
        let request = url
            .as_str()
            .into_client_request()
            .map_err(|e| classify(&e))?;

        let state = ChannelState::new(ReadyState::Connecting);
        let (channel, outbound) = QueuedChannel::new(format!("relay {}", addr), Arc::clone(&state));
        let (events, rx) = mpsc::unbounded_channel();

        tracing::debug!(relay = %addr, "opening websocket");
        tokio::spawn(drive(request, state, outbound, events));

        Ok(Endpoint::new(Box::new(channel), rx))
    }
}

async fn drive(
    request: Request,
    state: Arc<ChannelState>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let stream = tokio::select! {
        result = tokio_tungstenite::connect_async(request) => match result {
            Ok((stream, _)) => stream,
            Err(e) => {
                let err = classify(&e);
                tracing::warn!("websocket handshake failed: {}", err);
                state.set(ReadyState::Closed);
                let _ = events.send(TransportEvent::Error(err.to_string()));
                return;
            }
        },
        // Nothing can be queued before open, so this is a close.
        _ = outbound.recv() => {
            state.set(ReadyState::Closed);
            let _ = events.send(TransportEvent::Close);
            return;
        }
    };

    state.set(ReadyState::Open);
    let _ = events.send(TransportEvent::Open);

    let (mut sink, mut source) = stream.split();
    let last = loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(TransportEvent::Message(data));
                }
                Some(Ok(Message::Text(text))) => {
                    let data = Bytes::copy_from_slice(text.as_bytes());
                    let _ = events.send(TransportEvent::Message(data));
                }
                Some(Ok(Message::Close(_))) | None => break TransportEvent::Close,
                Some(Ok(_)) => {}
                Some(Err(e)) => break TransportEvent::Error(e.to_string()),
            },
            work = outbound.recv() => match work {
                Some(Outbound::Data(data)) => {
                    let len = data.len();
                    let result = sink.send(Message::Binary(data)).await;
                    state.written(len);
                    if let Err(e) = result {
                        break TransportEvent::Error(e.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.close().await;
                    break TransportEvent::Close;
                }
            },
        }
    };

    if let TransportEvent::Error(reason) = &last {
        tracing::debug!("websocket failed: {}", reason);
    }
    state.set(ReadyState::Closed);
    let _ = events.send(last);
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_build_url() {
        let addr = AddressSpec::new("snowflake.bamsoftware.com", 443);
        assert_eq!(build_url(&addr, true, &[]), "wss://snowflake.bamsoftware.com/");
        assert_eq!(
            build_url(&addr, false, &[]),
            "ws://snowflake.bamsoftware.com:443/"
        );

        let addr = AddressSpec::new("::1", 9901);
        let params = vec![("client_ip".to_string(), "2001:db8::1".to_string())];
        assert_eq!(
            build_url(&addr, false, &params),
            "ws://[::1]:9901/?client_ip=2001%3Adb8%3A%3A1"
        );

        let addr = AddressSpec::new("192.0.2.1", 80);
        let params = vec![("client_ip".to_string(), "198.51.100.7".to_string())];
        assert_eq!(
            build_url(&addr, false, &params),
            "ws://192.0.2.1/?client_ip=198.51.100.7"
        );
    }

    #[tokio::test]
    async fn test_echo_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_binary() {
                    ws.send(frame).await.unwrap();
                }
            }
        });

        let connector = WebSocketConnector::new(false);
        let mut endpoint = connector
            .connect(&AddressSpec::new("127.0.0.1", port), &[])
            .await
            .unwrap();

        assert_eq!(endpoint.events.recv().await, Some(TransportEvent::Open));
        endpoint.channel.send(Bytes::from_static(b"ping")).unwrap();
        assert_eq!(
            endpoint.events.recv().await,
            Some(TransportEvent::Message(Bytes::from_static(b"ping")))
        );
        assert_eq!(endpoint.channel.buffered_amount(), 0);

        endpoint.channel.close();
        assert_eq!(endpoint.events.recv().await, Some(TransportEvent::Close));
        assert_eq!(endpoint.channel.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = WebSocketConnector::new(false);
        let mut endpoint = connector
            .connect(&AddressSpec::new("127.0.0.1", port), &[])
            .await
            .unwrap();

        assert!(matches!(
            endpoint.events.recv().await,
            Some(TransportEvent::Error(_))
        ));
        assert!(endpoint.channel.ready_state().is_terminal());
    }
}
