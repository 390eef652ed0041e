//! Test doubles shared by the unit tests.

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::broker::{BrokerResponse, BrokerTransport};
use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::transport::memory::{
    MemoryPeer, MemoryPeerConnector, MemoryRelayConnector, RelayAttempt,
};
use crate::ui::Ui;

/// A request seen by [`FakeBrokerTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: String,
    pub session_id: String,
    pub body: String,
}

enum Scripted {
    Response(BrokerResponse),
    Error(String),
}

/// Broker transport replaying scripted replies.
///
/// Once the script runs out every request hangs, like a broker holding a
/// long-poll open.
#[derive(Default)]
pub struct FakeBrokerTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl FakeBrokerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: BrokerResponse) {
        self.script.lock().push_back(Scripted::Response(response));
    }

    pub fn push_error(&self, msg: &str) {
        self.script.lock().push_back(Scripted::Error(msg.to_string()));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, suffix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.ends_with(suffix))
            .count()
    }
}

#[async_trait]
impl BrokerTransport for FakeBrokerTransport {
    async fn post(&self, url: &str, session_id: &str, body: String) -> Result<BrokerResponse> {
        self.requests.lock().push(RecordedRequest {
            url: url.to_string(),
            session_id: session_id.to_string(),
            body,
        });

        let next = self.script.lock().pop_front();
        match next {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::Error(msg)) => Err(Error::broker(msg)),
            None => std::future::pending().await,
        }
    }
}

/// Ui recording every call.
#[derive(Default)]
pub struct RecordingUi {
    pub statuses: Mutex<Vec<String>>,
    pub actives: Mutex<Vec<bool>>,
    pub logs: Mutex<Vec<String>>,
}

impl RecordingUi {
    pub fn last_status(&self) -> Option<String> {
        self.statuses.lock().last().cloned()
    }

    pub fn saw_status(&self, status: &str) -> bool {
        self.statuses.lock().iter().any(|s| s == status)
    }
}

impl Ui for RecordingUi {
    fn set_status(&self, status: &str) {
        self.statuses.lock().push(status.to_string());
    }

    fn set_active(&self, active: bool) {
        self.actives.lock().push(active);
    }

    fn log(&self, line: &str) {
        self.logs.lock().push(line.to_string());
    }
}

/// A context wired to in-memory collaborators, plus their test-side handles.
pub struct Harness {
    pub ctx: Arc<Context>,
    pub broker: Arc<FakeBrokerTransport>,
    pub ui: Arc<RecordingUi>,
    pub relays: Arc<MemoryRelayConnector>,
    pub peers: mpsc::UnboundedReceiver<MemoryPeer>,
    pub attempts: mpsc::UnboundedReceiver<RelayAttempt>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let broker = Arc::new(FakeBrokerTransport::new());
        let ui = Arc::new(RecordingUi::default());
        let (peers, peer_rx) = MemoryPeerConnector::new();
        let (relays, attempts) = MemoryRelayConnector::new();
        let relays = Arc::new(relays);

        let ctx = Context::new(
            config,
            Arc::clone(&ui) as Arc<dyn Ui>,
            Arc::clone(&broker) as Arc<dyn BrokerTransport>,
            Arc::new(peers),
            Arc::clone(&relays) as Arc<dyn crate::transport::RelayConnector>,
        )
        .unwrap();

        Self {
            ctx: Arc::new(ctx),
            broker,
            ui,
            relays,
            peers: peer_rx,
            attempts,
        }
    }
}

/// An offer document as the broker would relay it.
pub fn offer_json(sdp: &str) -> String {
    crate::transport::SessionDescription::offer(sdp).to_json()
}

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
