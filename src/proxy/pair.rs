//! One relay session.
//!
//! A pair moves through `Init -> Negotiating -> Relaying -> Closed`:
//!
//! 1. **Init**: waits for an offer. Offers that fail to parse, carry the
//!    wrong type tag, or cannot be applied are refused and the pair stays
//!    reusable.
//! 2. **Negotiating**: answers the offer through the broker and waits for
//!    the client's data channel. Once the channel opens the relay
//!    connection is started.
//! 3. **Relaying**: both transports are open and the [`RelayPump`] moves
//!    data under the shared rate limiter.
//! 4. **Closed**: both transports are gone and the cleanup callback has run.
//!
//! The session runs in its own task. Transport events, timers and commands
//! from the [`PairHandle`] are consumed in a single dispatch loop, so the
//! lifecycle is only ever changed from one place.

use std::future::pending;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use super::relay::{RelayPump, Side};
use super::state::SessionState;
use super::SessionId;
use crate::broker::BROKER_FAILURE_STATUS;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::parse::ip_from_sdp;
use crate::transport::{EventStream, PeerConnection, SdpType, SessionDescription, TransportEvent};

type Cleanup = Box<dyn FnOnce(&SessionId) + Send>;

enum Command {
    Offer {
        text: String,
        reply: oneshot::Sender<bool>,
    },
    Close,
}

enum Step {
    Continue,
    Client(TransportEvent),
    Relay(TransportEvent),
    Flush,
    ConnectTimeout,
    OpenTimeout,
    Stop,
}

/// A relay session between one client and the relay.
pub struct ProxyPair {
    id: SessionId,
    ctx: Arc<Context>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    peer: Option<Box<dyn PeerConnection>>,
    pump: RelayPump,
    client_events: Option<EventStream>,
    relay_events: Option<EventStream>,
    /// Set while the UI shows this session as serving a client
    serving: bool,
    flush_at: Option<Instant>,
    connect_deadline: Option<Instant>,
    open_deadline: Option<Instant>,
    on_cleanup: Option<Cleanup>,
}

impl ProxyPair {
    /// Create a session in `Init`.
    pub fn new(id: SessionId, ctx: Arc<Context>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Init);
        ctx.metrics.increment_sessions_started();

        Self {
            id,
            pump: RelayPump::new(ctx.rate_limit.clone(), Arc::clone(&ctx.metrics)),
            ctx,
            state: SessionState::Init,
            state_tx,
            peer: None,
            client_events: None,
            relay_events: None,
            serving: false,
            flush_at: None,
            connect_deadline: None,
            open_deadline: None,
            on_cleanup: None,
        }
    }

    /// Run `f` once, after both transports are torn down.
    pub fn on_cleanup(mut self, f: impl FnOnce(&SessionId) + Send + 'static) -> Self {
        self.on_cleanup = Some(Box::new(f));
        self
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Start the session task.
    pub fn spawn(self) -> PairHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = PairHandle {
            id: self.id.clone(),
            commands,
            state: self.state_tx.subscribe(),
        };
        tokio::spawn(self.run(rx));
        handle
    }

    /// Validate and apply an offer document.
    ///
    /// Returns `false` on a malformed document, a non-offer type tag, or a
    /// session that is past `Init`. The session is left unchanged and can
    /// take another offer.
    pub async fn receive_offer(&mut self, text: &str) -> bool {
        match self.apply_offer(text).await {
            Ok(()) => {
                tracing::info!(session = %self.id, "offer accepted");
                true
            }
            Err(e) => {
                tracing::warn!(session = %self.id, "rejecting offer: {}", e);
                self.ctx.metrics.increment_offers_rejected();
                self.ctx.ui.log(&format!("Invalid offer: {}", e));
                false
            }
        }
    }

    async fn apply_offer(&mut self, text: &str) -> Result<()> {
        if !self.state.can_transition(SessionState::Negotiating) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: SessionState::Negotiating,
            });
        }

        let offer = SessionDescription::from_json(text)?;
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::offer(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }

        if self.peer.is_none() {
            let peer = self.ctx.peers.connect(&self.ctx.config.ice_servers).await?;
            self.peer = Some(peer);
        }
        let peer = self
            .peer
            .as_mut()
            .ok_or_else(|| Error::peer("no peer connection"))?;

        if let Err(e) = peer.set_remote_description(offer).await {
            // Start over with a fresh connection on the next offer.
            if let Some(mut peer) = self.peer.take() {
                peer.close().await;
            }
            return Err(e);
        }

        self.set_state(SessionState::Negotiating)
    }

    fn set_state(&mut self, to: SessionState) -> Result<()> {
        self.state.transition(to)?;
        self.state_tx.send_replace(to);
        Ok(())
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        if self.await_offer(&mut commands).await {
            match self.negotiate(&mut commands).await {
                Ok(true) => self.relay_loop(&mut commands).await,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(session = %self.id, "negotiation failed: {}", e);
                    self.ctx.ui.log(&format!("Negotiation failed: {}", e));
                }
            }
        }
        self.close().await;
    }

    async fn await_offer(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Offer { text, reply } => {
                    let accepted = self.receive_offer(&text).await;
                    let _ = reply.send(accepted);
                    if accepted {
                        return true;
                    }
                }
                Command::Close => return false,
            }
        }
        false
    }

    /// Answer the applied offer and wait for the client's data channel.
    ///
    /// Returns `Ok(false)` when interrupted by a close or the data-channel
    /// timeout.
    async fn negotiate(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Result<bool> {
        let deadline = Instant::now() + self.ctx.config.datachannel_timeout;
        let peer = self
            .peer
            .as_mut()
            .ok_or_else(|| Error::peer("no peer connection"))?;

        let answer = tokio::select! {
            answer = peer.create_answer() => answer?,
            _ = sleep_until(deadline) => {
                tracing::info!(session = %self.id, "timed out creating an answer");
                return Ok(false);
            }
            _ = interrupted(commands) => return Ok(false),
        };

        let broker = self.ctx.broker.clone();
        let metrics = Arc::clone(&self.ctx.metrics);
        let ui = Arc::clone(&self.ctx.ui);
        let id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = broker.submit_answer(&id, &answer).await {
                metrics.increment_broker_failures();
                tracing::warn!(session = %id, "answer not delivered: {}", e);
                if let Error::BrokerUnexpected(_) = e {
                    ui.set_status(BROKER_FAILURE_STATUS);
                }
            }
        });

        let endpoint = tokio::select! {
            endpoint = peer.accept_channel() => endpoint?,
            _ = sleep_until(deadline) => {
                tracing::info!(session = %self.id, "client never opened a data channel");
                self.ctx.ui.log("Timed out waiting for the client data channel");
                return Ok(false);
            }
            _ = interrupted(commands) => return Ok(false),
        };

        tracing::debug!(session = %self.id, "data channel {} accepted", endpoint.channel.label());
        self.open_deadline = Some(deadline);
        self.client_events = Some(endpoint.events);
        self.pump.attach(Side::Client, endpoint.channel);
        Ok(true)
    }

    async fn relay_loop(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        loop {
            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Offer { reply, .. }) => {
                        let _ = reply.send(false);
                        Step::Continue
                    }
                    Some(Command::Close) | None => Step::Stop,
                },
                event = next_event(&mut self.client_events) => Step::Client(event),
                event = next_event(&mut self.relay_events) => Step::Relay(event),
                _ = sleep_opt(self.flush_at) => Step::Flush,
                _ = sleep_opt(self.connect_deadline) => Step::ConnectTimeout,
                _ = sleep_opt(self.open_deadline) => Step::OpenTimeout,
            };

            let keep_going = match step {
                Step::Continue => true,
                Step::Stop => false,
                Step::Client(event) => self.on_client_event(event).await,
                Step::Relay(event) => self.on_relay_event(event),
                Step::Flush => {
                    self.flush();
                    true
                }
                Step::ConnectTimeout => self.on_connect_timeout(),
                Step::OpenTimeout => {
                    tracing::info!(session = %self.id, "data channel never opened");
                    self.ctx.ui.log("Timed out waiting for the client data channel");
                    false
                }
            };

            if !keep_going || self.pump.is_finished() {
                return;
            }
        }
    }

    async fn on_client_event(&mut self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Open => {
                if self.pump.has(Side::Relay) {
                    return true;
                }
                tracing::info!(session = %self.id, "client data channel open");
                self.open_deadline = None;
                self.serving = true;
                self.ctx.metrics.increment_clients_served();
                self.ctx.ui.set_status("connected");
                self.ctx.ui.set_active(true);

                if let Err(e) = self.connect_relay().await {
                    tracing::warn!(session = %self.id, "relay connect failed: {}", e);
                    self.ctx.metrics.increment_relay_failures();
                    self.ctx.ui.log(&format!("Relay connect failed: {}", e));
                    return false;
                }
                self.flush();
            }
            TransportEvent::Message(data) => {
                self.pump.enqueue(Side::Client, data);
                self.flush();
            }
            TransportEvent::Close | TransportEvent::Error(_) => {
                if let TransportEvent::Error(reason) = &event {
                    tracing::warn!(session = %self.id, "client transport error: {}", reason);
                }
                tracing::info!(session = %self.id, "client disconnected");
                self.client_events = None;
                self.open_deadline = None;
                self.pump.mark_closed(Side::Client);
                self.ctx.ui.set_status("disconnected by webrtc.");
                if self.serving {
                    self.serving = false;
                    self.ctx.ui.set_active(false);
                }
                self.flush();
            }
        }
        true
    }

    fn on_relay_event(&mut self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Open => {
                tracing::info!(session = %self.id, "relay connection open");
                self.connect_deadline = None;
                if self.state == SessionState::Negotiating {
                    if let Err(e) = self.set_state(SessionState::Relaying) {
                        tracing::warn!(session = %self.id, "{}", e);
                        return false;
                    }
                }
                self.flush();
            }
            TransportEvent::Message(data) => {
                self.pump.enqueue(Side::Relay, data);
                self.flush();
            }
            TransportEvent::Close | TransportEvent::Error(_) => {
                if let TransportEvent::Error(reason) = &event {
                    tracing::warn!(session = %self.id, "relay transport error: {}", reason);
                }
                if self.connect_deadline.take().is_some() {
                    self.ctx.metrics.increment_relay_failures();
                }
                tracing::info!(session = %self.id, "relay disconnected");
                self.relay_events = None;
                self.pump.mark_closed(Side::Relay);
                self.ctx.ui.set_status("disconnected.");
                self.flush();
            }
        }
        true
    }

    fn on_connect_timeout(&mut self) -> bool {
        self.connect_deadline = None;
        if self.pump.is_ready(Side::Relay) {
            return true;
        }
        let timeout = self.ctx.config.relay_connect_timeout;
        tracing::warn!(session = %self.id, "relay did not open within {:?}", timeout);
        self.ctx.metrics.increment_relay_failures();
        self.ctx.ui.log("Timed out connecting to the relay");
        false
    }

    async fn connect_relay(&mut self) -> Result<()> {
        let mut params = Vec::new();
        let client_ip = self
            .peer
            .as_ref()
            .and_then(|peer| peer.remote_description())
            .and_then(|desc| ip_from_sdp(&desc.sdp));
        if let Some(ip) = client_ip {
            params.push(("client_ip".to_string(), ip.to_string()));
        }

        let addr = &self.ctx.config.relay_addr;
        tracing::debug!(session = %self.id, relay = %addr, "connecting to relay");
        let endpoint = self.ctx.relays.connect(addr, &params).await?;

        self.connect_deadline = Some(Instant::now() + self.ctx.config.relay_connect_timeout);
        self.relay_events = Some(endpoint.events);
        self.pump.attach(Side::Relay, endpoint.channel);
        Ok(())
    }

    fn flush(&mut self) {
        let flush = self.pump.flush();
        if flush.sent > 0 {
            tracing::trace!(session = %self.id, chunks = flush.sent, "flushed");
        }
        self.flush_at = flush.reschedule.map(|delay| Instant::now() + delay);
    }

    /// Tear everything down. Idempotent; queued data is discarded.
    async fn close(&mut self) {
        if self.state.is_closed() {
            return;
        }

        self.flush_at = None;
        self.connect_deadline = None;
        self.open_deadline = None;
        self.client_events = None;
        self.relay_events = None;
        self.pump.close_all();
        if let Some(mut peer) = self.peer.take() {
            peer.close().await;
        }
        if self.serving {
            self.serving = false;
            self.ctx.ui.set_active(false);
        }

        if let Err(e) = self.set_state(SessionState::Closed) {
            tracing::warn!(session = %self.id, "{}", e);
        }
        self.ctx.metrics.increment_sessions_completed();
        tracing::info!(session = %self.id, "session closed");

        if let Some(cleanup) = self.on_cleanup.take() {
            cleanup(&self.id);
        }
    }
}

/// Handle to a running [`ProxyPair`].
#[derive(Clone)]
pub struct PairHandle {
    id: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
}

impl PairHandle {
    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Latest lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Hand an offer document to the session. See [`ProxyPair::receive_offer`].
    pub async fn offer(&self, text: String) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Offer { text, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Ask the session to close. Queued data is discarded.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Wait until the session is closed.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.is_closed()).await;
    }
}

/// Resolves on a close request; refuses offers in the meantime.
async fn interrupted(commands: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Offer { reply, .. }) => {
                let _ = reply.send(false);
            }
            Some(Command::Close) | None => return,
        }
    }
}

async fn next_event(events: &mut Option<EventStream>) -> TransportEvent {
    match events {
        Some(events) => events.recv().await.unwrap_or(TransportEvent::Close),
        None => pending().await,
    }
}

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}
