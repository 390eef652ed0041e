//! Poll loop and session pool.
//!
//! Every poll interval the orchestrator picks a pool slot, either an idle
//! session or a new one while the pool has room, and long-polls the broker
//! on its behalf. An offer is handed to the slot's session. A failed poll or
//! a rejected offer puts the slot back to idle so the next cycle reuses it.
//! Sessions leave the pool when their cleanup callback fires.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;

use crate::context::Context;
use crate::error::Error;
use crate::proxy::{PairHandle, ProxyPair, SessionId, SessionState};

pub use crate::broker::BROKER_FAILURE_STATUS;

struct Slot {
    handle: PairHandle,
    /// Claimed by a poll in flight or by an accepted offer
    active: bool,
    /// The broker request in flight for this slot
    request: Option<AbortHandle>,
}

#[derive(Default)]
struct Pool {
    slots: Vec<Slot>,
}

impl Pool {
    fn find_mut(&mut self, id: &SessionId) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.handle.id() == id)
    }

    fn remove(&mut self, id: &SessionId) {
        self.slots.retain(|s| s.handle.id() != id);
    }
}

struct Inner {
    ctx: Arc<Context>,
    pool: Arc<Mutex<Pool>>,
    retries: AtomicU64,
    disabled: AtomicBool,
}

/// The proxy: a bounded pool of sessions fed by a broker poll loop.
pub struct Snowflake {
    inner: Arc<Inner>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Snowflake {
    /// Create an idle proxy.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                pool: Arc::new(Mutex::new(Pool::default())),
                retries: AtomicU64::new(0),
                disabled: AtomicBool::new(false),
            }),
            poll_task: Mutex::new(None),
        }
    }

    /// Start polling. The first poll happens immediately.
    ///
    /// Does nothing if already started or after [`disable`](Self::disable).
    pub fn begin(&self) {
        if self.inner.disabled.load(Ordering::SeqCst) {
            return;
        }
        let mut poll_task = self.poll_task.lock();
        if poll_task.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let period = inner.ctx.config.poll_interval;
        tracing::info!(
            broker = inner.ctx.broker.url(),
            relay = %inner.ctx.config.relay_addr,
            "starting snowflake proxy, polling every {:?}",
            period
        );
        inner.ctx.ui.log("Starting up Snowflake proxy");

        *poll_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                inner.poll_broker();
            }
        }));
    }

    /// Stop polling and force-close every session.
    ///
    /// Returns once all sessions have closed. Queued data is discarded.
    pub async fn disable(&self) {
        self.inner.disabled.store(true, Ordering::SeqCst);
        let poll_task = self.poll_task.lock().take();
        if let Some(task) = poll_task {
            task.abort();
            let _ = task.await;
        }

        let slots = std::mem::take(&mut self.inner.pool.lock().slots);
        tracing::info!("disabling proxy, closing {} sessions", slots.len());
        self.inner.ctx.ui.log("Disabling Snowflake proxy");

        for slot in &slots {
            if let Some(request) = &slot.request {
                request.abort();
            }
            slot.handle.close();
        }
        for slot in &slots {
            slot.handle.closed().await;
        }
        self.inner.ctx.ui.set_active(false);
    }

    /// Perform one poll cycle now. Returns whether the broker was contacted.
    pub fn poll_broker(&self) -> bool {
        if self.inner.disabled.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.poll_broker()
    }

    /// Number of sessions in the pool.
    pub fn session_count(&self) -> usize {
        self.inner.pool.lock().slots.len()
    }

    /// Handles to the pooled sessions.
    pub fn sessions(&self) -> Vec<PairHandle> {
        self.inner
            .pool
            .lock()
            .slots
            .iter()
            .map(|s| s.handle.clone())
            .collect()
    }

    /// Polls issued so far.
    pub fn retries(&self) -> u64 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    /// Whether [`disable`](Self::disable) was called.
    pub fn is_disabled(&self) -> bool {
        self.inner.disabled.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn poll_broker(self: &Arc<Self>) -> bool {
        let Some(handle) = self.next_available_slot() else {
            tracing::debug!("at client capacity, skipping poll");
            self.ctx.ui.log("At client capacity.");
            return false;
        };

        let retries = self.retries.fetch_add(1, Ordering::SeqCst);
        self.ctx.metrics.increment_polls();
        let mut status = String::from("Polling for client ... ");
        if retries > 0 {
            status.push_str(&format!("[retries: {}]", retries));
        }
        self.ctx.ui.set_status(&status);

        let id = handle.id().clone();
        let inner = Arc::clone(self);
        let request = tokio::spawn(async move { inner.serve_slot(handle).await });

        // The request may already have finished and idled the slot.
        let mut pool = self.pool.lock();
        if let Some(slot) = pool.find_mut(&id) {
            if slot.active && !request.is_finished() {
                slot.request = Some(request.abort_handle());
            }
        }
        true
    }

    /// Claim an idle session, or create one while the pool has room.
    fn next_available_slot(self: &Arc<Self>) -> Option<PairHandle> {
        let config = &self.ctx.config;
        let mut pool = self.pool.lock();

        let relaying = pool
            .slots
            .iter()
            .filter(|s| s.handle.state() == SessionState::Relaying)
            .count();
        if relaying >= config.max_clients {
            return None;
        }

        if let Some(slot) = pool
            .slots
            .iter_mut()
            .find(|s| !s.active && s.handle.state() == SessionState::Init)
        {
            slot.active = true;
            return Some(slot.handle.clone());
        }

        if pool.slots.len() >= config.pool_capacity() {
            return None;
        }

        let pool_ref: Weak<Mutex<Pool>> = Arc::downgrade(&self.pool);
        let handle = ProxyPair::new(SessionId::generate(), Arc::clone(&self.ctx))
            .on_cleanup(move |id| {
                if let Some(pool) = pool_ref.upgrade() {
                    pool.lock().remove(id);
                }
            })
            .spawn();
        tracing::debug!(session = %handle.id(), "new session");

        pool.slots.push(Slot {
            handle: handle.clone(),
            active: true,
            request: None,
        });
        Some(handle)
    }

    async fn serve_slot(&self, handle: PairHandle) {
        let id = handle.id().clone();

        let accepted = match self.ctx.broker.request_offer(&id).await {
            Ok(offer) => {
                tracing::info!(session = %id, "received offer from broker");
                handle.offer(offer).await
            }
            Err(Error::BrokerTimeout) => {
                self.ctx.metrics.increment_broker_timeouts();
                false
            }
            Err(Error::BrokerUnexpected(status)) => {
                self.ctx.metrics.increment_broker_failures();
                self.ctx.ui.set_status(BROKER_FAILURE_STATUS);
                self.ctx
                    .ui
                    .log(&format!("Broker error: unexpected status {}", status));
                false
            }
            Err(e) => {
                self.ctx.metrics.increment_broker_failures();
                self.ctx.ui.log(&format!("Broker error: {}", e));
                false
            }
        };

        let mut pool = self.pool.lock();
        if let Some(slot) = pool.find_mut(&id) {
            slot.request = None;
            if !accepted {
                slot.active = false;
            }
        }
    }
}
