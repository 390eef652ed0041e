//! Rate-limited bidirectional pump between the client and the relay.
//!
//! Chunks arriving from either transport are queued per direction and
//! drained by [`RelayPump::flush`]. A pass alternates between the two
//! queues, one chunk each, while the shared limiter allows it and the
//! destination's send buffer is under [`MAX_BUFFER`]. Whatever cannot be
//! sent now is left for a later pass at the time the limiter reports.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::metrics::ProxyMetrics;
use crate::rate_limit::SharedRateLimit;
use crate::transport::Channel;

/// Ceiling on a destination's unsent bytes before the pump stops feeding it.
pub const MAX_BUFFER: usize = 10 * 1024 * 1024;

/// Shortest delay between two scheduled passes.
pub const MIN_RESCHEDULE: Duration = Duration::from_millis(10);

/// One end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The restricted client, over the peer transport
    Client,
    /// The relay server, over the streaming transport
    Relay,
}

impl Side {
    /// The other end.
    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Relay,
            Side::Relay => Side::Client,
        }
    }
}

/// Result of a flush pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flush {
    /// Chunks handed to a transport in this pass
    pub sent: usize,
    /// When backlog remains, the delay before the next pass
    pub reschedule: Option<Duration>,
}

#[derive(Default)]
struct End {
    channel: Option<Box<dyn Channel>>,
    /// Chunks waiting to be sent to this end
    queue: VecDeque<Bytes>,
    closed: bool,
}

impl End {
    fn is_ready(&self) -> bool {
        !self.closed && self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    fn is_terminal(&self) -> bool {
        self.closed
            || self
                .channel
                .as_ref()
                .is_some_and(|c| c.ready_state().is_terminal())
    }

    fn buffered(&self) -> usize {
        self.channel.as_ref().map_or(0, |c| c.buffered_amount())
    }

    fn can_accept(&self) -> bool {
        !self.queue.is_empty() && self.is_ready() && self.buffered() < MAX_BUFFER
    }
}

/// Queues and transports of one session.
pub struct RelayPump {
    rate_limit: SharedRateLimit,
    metrics: Arc<ProxyMetrics>,
    client: End,
    relay: End,
}

impl RelayPump {
    /// Create an empty pump sharing `rate_limit`.
    pub fn new(rate_limit: SharedRateLimit, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            rate_limit,
            metrics,
            client: End::default(),
            relay: End::default(),
        }
    }

    fn end(&self, side: Side) -> &End {
        match side {
            Side::Client => &self.client,
            Side::Relay => &self.relay,
        }
    }

    fn end_mut(&mut self, side: Side) -> &mut End {
        match side {
            Side::Client => &mut self.client,
            Side::Relay => &mut self.relay,
        }
    }

    /// Install the transport for `side`.
    pub fn attach(&mut self, side: Side, channel: Box<dyn Channel>) {
        let end = self.end_mut(side);
        end.channel = Some(channel);
        end.closed = false;
    }

    /// Whether a transport was installed for `side` and not yet released.
    pub fn has(&self, side: Side) -> bool {
        self.end(side).channel.is_some()
    }

    /// Whether `side` is open for sending.
    pub fn is_ready(&self, side: Side) -> bool {
        self.end(side).is_ready()
    }

    /// Whether `side` can no longer carry data.
    pub fn is_terminal(&self, side: Side) -> bool {
        self.end(side).is_terminal()
    }

    /// Queue a chunk that arrived from `from` for the opposite end.
    pub fn enqueue(&mut self, from: Side, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.end_mut(from.opposite()).queue.push_back(data);
    }

    /// Chunks waiting to be sent to `side`.
    pub fn queued(&self, side: Side) -> usize {
        self.end(side).queue.len()
    }

    /// Record that `side` reported close or error.
    pub fn mark_closed(&mut self, side: Side) {
        self.end_mut(side).closed = true;
    }

    /// Both ends are gone, or were never attached.
    pub fn is_finished(&self) -> bool {
        let done = |end: &End| end.channel.is_none() || end.is_terminal();
        done(&self.client) && done(&self.relay)
    }

    /// Run one draining pass.
    pub fn flush(&mut self) -> Flush {
        let mut sent = 0;
        let mut busy = true;

        while busy && !self.rate_limit.is_limited() {
            busy = false;
            if self.relay.can_accept() {
                sent += self.send_one(Side::Relay);
                busy = true;
            }
            if self.client.can_accept() {
                sent += self.send_one(Side::Client);
                busy = true;
            }
        }

        self.propagate_close(Side::Client);
        self.propagate_close(Side::Relay);

        let backlog = |end: &End| end.is_ready() && (!end.queue.is_empty() || end.buffered() > 0);
        let reschedule = if backlog(&self.client) || backlog(&self.relay) {
            Some(self.rate_limit.wait_time().max(MIN_RESCHEDULE))
        } else {
            None
        };

        Flush { sent, reschedule }
    }

    fn send_one(&mut self, to: Side) -> usize {
        let rate_limit = self.rate_limit.clone();
        let end = self.end_mut(to);
        let Some(chunk) = end.queue.pop_front() else {
            return 0;
        };
        let Some(channel) = end.channel.as_mut() else {
            return 0;
        };

        let len = chunk.len();
        rate_limit.update(len);
        if let Err(e) = channel.send(chunk) {
            tracing::debug!(to = channel.label(), "dropping {} byte chunk: {}", len, e);
            end.closed = true;
            return 0;
        }

        match to {
            Side::Relay => self.metrics.add_bytes_to_relay(len as u64),
            Side::Client => self.metrics.add_bytes_to_client(len as u64),
        }
        1
    }

    /// Once `dead` is gone, close the opposite end after it has drained.
    fn propagate_close(&mut self, dead: Side) {
        if !self.end(dead).is_terminal() {
            return;
        }
        self.end_mut(dead).queue.clear();

        let live = self.end_mut(dead.opposite());
        if live.is_terminal() || !live.queue.is_empty() || live.buffered() > 0 {
            return;
        }
        if let Some(channel) = live.channel.as_mut() {
            if channel.is_open() {
                tracing::debug!(
                    "{} closed, closing {} after drain",
                    match dead {
                        Side::Client => "client",
                        Side::Relay => "relay",
                    },
                    channel.label()
                );
                channel.close();
            }
        }
    }

    /// Discard all queued data and close both transports.
    pub fn close_all(&mut self) {
        for end in [&mut self.client, &mut self.relay] {
            end.queue.clear();
            if let Some(mut channel) = end.channel.take() {
                if !channel.ready_state().is_terminal() {
                    channel.close();
                }
            }
            end.closed = true;
        }
    }
}
