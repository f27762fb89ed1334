//! Peer channels
//!
//! A [`Channel`] is the logical pipe to one connected peer. Its state only
//! moves forward: `Initiated -> Active -> Disconnected`.

use crate::network::address::{Multiaddr, PeerAddress};
use crate::network::identity::NodeId;
use crate::network::message::Message;
use crate::network::queue::{FlushScheduler, MessageQueue, QueueConfig};
use futures::Sink;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Peer not connected: {0}")]
    NotConnected(NodeId),
    #[error("Channel to {0} is disconnected")]
    Disconnected(NodeId),
    #[error("Outbound queue for {id} overflowed ({pending} pending)")]
    QueueOverflow { id: NodeId, pending: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChannelState {
    Initiated = 0,
    Active = 1,
    Disconnected = 2,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Initiated,
            1 => ChannelState::Active,
            _ => ChannelState::Disconnected,
        }
    }
}

/// Monotonic state latch shared by a channel and its queue
#[derive(Debug)]
pub struct StateCell {
    value: AtomicU8,
    closed: CancellationToken,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            value: AtomicU8::new(ChannelState::Initiated as u8),
            closed: CancellationToken::new(),
        }
    }

    pub fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.value.load(Ordering::SeqCst))
    }

    /// Move forward to `to`; returns true if this call changed the state
    pub fn advance(&self, to: ChannelState) -> bool {
        let previous = self.value.fetch_max(to as u8, Ordering::SeqCst);
        let changed = previous < to as u8;
        if changed && to == ChannelState::Disconnected {
            self.closed.cancel();
        }
        changed
    }

    /// Resolves once the state reaches `Disconnected`
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// A connected peer
pub struct Channel {
    id: NodeId,
    remote_addr: SocketAddr,
    outbound: bool,
    state: Arc<StateCell>,
    queue: MessageQueue,
}

impl Channel {
    pub fn new(id: NodeId, remote_addr: SocketAddr, outbound: bool, config: QueueConfig) -> Self {
        let state = Arc::new(StateCell::new());
        let queue = MessageQueue::new(id.short(), state.clone(), config);
        Self {
            id,
            remote_addr,
            outbound,
            state,
            queue,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Active
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == ChannelState::Disconnected
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Address this channel was reached at
    pub fn peer_address(&self) -> PeerAddress {
        PeerAddress::from_multiaddr(Multiaddr::new(self.remote_addr, self.id.clone()))
    }

    /// Start flushing the queue into `sink`
    pub fn activate<S>(&self, sink: S, scheduler: &FlushScheduler)
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
    {
        self.queue.activate(sink, scheduler);
    }

    /// `Initiated -> Active`; false from any other state
    pub fn mark_active(&self) -> bool {
        self.state
            .value
            .compare_exchange(
                ChannelState::Initiated as u8,
                ChannelState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn send_message(&self, msg: Message) -> bool {
        self.queue.send_message(msg)
    }

    /// Latch `Disconnected` and stop the flush task; safe to call repeatedly
    pub async fn disconnect(&self) {
        if self.state.advance(ChannelState::Disconnected) {
            log::info!("Channel to {} ({}) disconnected", self.id.short(), self.remote_addr);
        }
        self.queue.close().await;
    }

    /// Resolves once the channel is disconnected, by either side
    pub async fn closed(&self) {
        self.state.closed().await
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .field("state", &self.state())
            .field("pending", &self.queue.size())
            .finish()
    }
}
