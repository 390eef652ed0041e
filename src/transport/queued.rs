//! Non-blocking [`Channel`] in front of an async writer task.
//!
//! The relay engine sends synchronously, while network transports write
//! asynchronously. A `QueuedChannel` hands chunks to a writer task over an
//! unbounded queue and counts them as buffered until the task reports them
//! written, which gives the engine the `buffered_amount` it throttles on.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Channel, ReadyState};
use crate::error::{Error, Result};

/// Work for a writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Write a chunk
    Data(Bytes),
    /// Close the transport
    Close,
}

/// Readiness and buffer level shared between a channel and its tasks.
#[derive(Debug)]
pub struct ChannelState {
    state: AtomicU8,
    /// Queued for the writer task
    buffered: AtomicUsize,
    /// Accepted by the transport but not yet on the wire
    in_flight: AtomicUsize,
}

impl ChannelState {
    /// Create state starting at `state` with nothing buffered.
    pub fn new(state: ReadyState) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(encode(state)),
            buffered: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Current readiness.
    pub fn get(&self) -> ReadyState {
        decode(self.state.load(Ordering::Acquire))
    }

    /// Set readiness.
    pub fn set(&self, state: ReadyState) {
        self.state.store(encode(state), Ordering::Release);
    }

    /// Record `n` bytes as written.
    pub fn written(&self, n: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
                Some(b.saturating_sub(n))
            });
    }

    /// Report what the transport itself still holds.
    pub fn set_in_flight(&self, n: usize) {
        self.in_flight.store(n, Ordering::Release);
    }

    /// Bytes the transport itself still holds.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Bytes queued or in flight.
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire) + self.in_flight()
    }
}

fn encode(state: ReadyState) -> u8 {
    match state {
        ReadyState::Connecting => 0,
        ReadyState::Open => 1,
        ReadyState::Closing => 2,
        ReadyState::Closed => 3,
    }
}

fn decode(value: u8) -> ReadyState {
    match value {
        0 => ReadyState::Connecting,
        1 => ReadyState::Open,
        2 => ReadyState::Closing,
        _ => ReadyState::Closed,
    }
}

/// Channel whose writes are performed by a separate task.
pub struct QueuedChannel {
    label: String,
    state: Arc<ChannelState>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl QueuedChannel {
    /// Create a channel and the receiving end for its writer task.
    pub fn new(
        label: impl Into<String>,
        state: Arc<ChannelState>,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                label: label.into(),
                state,
                outbound,
            },
            rx,
        )
    }
}

impl Channel for QueuedChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn buffered_amount(&self) -> usize {
        self.state.buffered()
    }

    fn send(&mut self, data: Bytes) -> Result<()> {
        if self.state.get() != ReadyState::Open {
            return Err(Error::ChannelClosed);
        }
        let len = data.len();
        self.state.buffered.fetch_add(len, Ordering::AcqRel);
        if self.outbound.send(Outbound::Data(data)).is_err() {
            self.state.written(len);
            self.state.set(ReadyState::Closed);
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.state.get().is_terminal() {
            return;
        }
        self.state.set(ReadyState::Closing);
        let _ = self.outbound.send(Outbound::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_counts_buffered_until_written() {
        let state = ChannelState::new(ReadyState::Open);
        let (mut channel, mut rx) = QueuedChannel::new("test", Arc::clone(&state));

        channel.send(Bytes::from_static(b"abcd")).unwrap();
        channel.send(Bytes::from_static(b"ef")).unwrap();
        assert_eq!(channel.buffered_amount(), 6);

        match rx.try_recv().unwrap() {
            Outbound::Data(data) => {
                assert_eq!(data, "abcd");
                state.written(data.len());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(channel.buffered_amount(), 2);

        state.set_in_flight(10);
        assert_eq!(channel.buffered_amount(), 12);
    }

    #[test]
    fn test_close_once() {
        let state = ChannelState::new(ReadyState::Open);
        let (mut channel, mut rx) = QueuedChannel::new("test", Arc::clone(&state));

        channel.close();
        channel.close();
        assert_eq!(channel.ready_state(), ReadyState::Closing);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert!(rx.try_recv().is_err());
        assert!(channel.send(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_send_before_open_fails() {
        let state = ChannelState::new(ReadyState::Connecting);
        let (mut channel, _rx) = QueuedChannel::new("test", state);
        assert!(matches!(
            channel.send(Bytes::from_static(b"x")),
            Err(Error::ChannelClosed)
        ));
        assert_eq!(channel.buffered_amount(), 0);
    }
}
