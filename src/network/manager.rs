//! Channel registry with queue overflow enforcement
//!
//! A peer that lets more than `max_queue_size` messages pile up in its
//! outbound queue is treated as unresponsive: the next send to it is refused
//! and the channel is torn down.

use crate::network::channel::{Channel, ChannelError};
use crate::network::identity::NodeId;
use crate::network::message::{DisconnectReason, Message};
use crate::network::peer::PeerManager;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default ceiling on pending outbound messages per channel
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

pub struct ChannelManager {
    channels: RwLock<HashMap<NodeId, Arc<Channel>>>,
    peer_manager: Arc<PeerManager>,
    max_queue_size: usize,
}

impl ChannelManager {
    pub fn new(peer_manager: Arc<PeerManager>, max_queue_size: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            peer_manager,
            max_queue_size,
        }
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Register a channel, returning any channel it replaced
    pub async fn add(&self, channel: Arc<Channel>) -> Option<Arc<Channel>> {
        self.channels
            .write()
            .await
            .insert(channel.id().clone(), channel)
    }

    pub async fn remove(&self, id: &NodeId) -> Option<Arc<Channel>> {
        self.channels.write().await.remove(id)
    }

    pub async fn get(&self, id: &NodeId) -> Option<Arc<Channel>> {
        self.channels.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }

    pub async fn active_channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .read()
            .await
            .values()
            .filter(|c| c.is_active())
            .cloned()
            .collect()
    }

    pub fn is_overflowing(&self, channel: &Channel) -> bool {
        channel.queue().size() > self.max_queue_size
    }

    /// Queue a message for one peer, tearing the channel down on overflow
    pub async fn send_to(&self, id: &NodeId, msg: Message) -> Result<(), ChannelError> {
        let channel = self
            .get(id)
            .await
            .ok_or_else(|| ChannelError::NotConnected(id.clone()))?;

        if self.is_overflowing(&channel) {
            let pending = channel.queue().size();
            log::warn!(
                "Peer {} has {} pending messages (limit {}), disconnecting",
                id.short(),
                pending,
                self.max_queue_size
            );
            self.release(&channel).await;
            return Err(ChannelError::QueueOverflow {
                id: id.clone(),
                pending,
            });
        }

        if channel.send_message(msg) {
            Ok(())
        } else {
            Err(ChannelError::Disconnected(id.clone()))
        }
    }

    /// Queue a message for every active channel; returns how many accepted it
    pub async fn broadcast(&self, msg: Message) -> usize {
        self.broadcast_except(msg, None).await
    }

    pub async fn broadcast_except(&self, msg: Message, except: Option<&NodeId>) -> usize {
        let mut sent = 0;
        for channel in self.active_channels().await {
            if Some(channel.id()) == except {
                continue;
            }
            match self.send_to(channel.id(), msg.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => log::debug!("Broadcast skipped {}: {}", channel.id().short(), e),
            }
        }
        sent
    }

    /// Tear down every overflowing channel; returns their ids
    pub async fn enforce_queue_limits(&self) -> Vec<NodeId> {
        let overflowing: Vec<Arc<Channel>> = self
            .channels
            .read()
            .await
            .values()
            .filter(|c| self.is_overflowing(c))
            .cloned()
            .collect();

        let mut removed = Vec::with_capacity(overflowing.len());
        for channel in overflowing {
            log::warn!(
                "Peer {} exceeded queue limit with {} pending",
                channel.id().short(),
                channel.queue().size()
            );
            self.release(&channel).await;
            removed.push(channel.id().clone());
        }
        removed
    }

    /// Disconnect a channel and forget it
    pub async fn disconnect(&self, id: &NodeId, reason: DisconnectReason) -> bool {
        match self.get(id).await {
            Some(channel) => {
                log::info!("Disconnecting {}: {:?}", id.short(), reason);
                channel.send_message(reason.to_message());
                self.release(&channel).await;
                true
            }
            None => false,
        }
    }

    /// Disconnect every channel with `reason`
    pub async fn close_all(&self, reason: DisconnectReason) {
        let channels: Vec<Arc<Channel>> = self
            .channels
            .write()
            .await
            .drain()
            .map(|(_, c)| c)
            .collect();
        for channel in channels {
            channel.send_message(reason.to_message());
            channel.disconnect().await;
            self.peer_manager.remove_peer(channel.id()).await;
        }
    }

    /// Disconnect a channel, unregister it if still current, and notify the
    /// peer manager
    pub async fn release(&self, channel: &Arc<Channel>) {
        channel.disconnect().await;
        let mut channels = self.channels.write().await;
        let superseded = channels
            .get(channel.id())
            .is_some_and(|current| !Arc::ptr_eq(current, channel));
        if superseded {
            return;
        }
        channels.remove(channel.id());
        drop(channels);
        self.peer_manager.remove_peer(channel.id()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::network::message::{Command, Hello};
    use crate::network::peer::{PeerEvent, PeerInfo};
    use crate::network::queue::QueueConfig;

    async fn setup(max_queue_size: usize) -> (ChannelManager, Arc<PeerManager>, Arc<Channel>) {
        let peers = Arc::new(PeerManager::default());
        let manager = ChannelManager::new(peers.clone(), max_queue_size);

        let id = KeyPair::generate().node_id();
        let addr = "127.0.0.1:9000".parse().unwrap();
        let hello = Hello::new("chain-p2p", id.to_base58(), 9000);
        peers
            .add_peer(PeerInfo::new(id.clone(), addr, true, &hello))
            .await
            .unwrap();

        let channel = Arc::new(Channel::new(id, addr, true, QueueConfig::default()));
        channel.mark_active();
        manager.add(channel.clone()).await;
        (manager, peers, channel)
    }

    fn block(tag: u8) -> Message {
        Message::new(Command::Application(1), vec![tag])
    }

    #[tokio::test]
    async fn test_overflow_detected_by_guard_not_queue() {
        let (manager, _, channel) = setup(10).await;

        for tag in 0..25 {
            assert!(channel.send_message(block(tag)));
        }
        assert_eq!(channel.queue().size(), 25);
        assert!(manager.is_overflowing(&channel));
    }

    #[tokio::test]
    async fn test_send_to_tears_down_on_overflow() {
        let (manager, peers, channel) = setup(10).await;
        let mut events = peers.subscribe();
        let id = channel.id().clone();

        for tag in 0..11 {
            manager.send_to(&id, block(tag)).await.unwrap();
        }
        let result = manager.send_to(&id, block(99)).await;
        assert!(matches!(
            result,
            Err(ChannelError::QueueOverflow { pending: 11, .. })
        ));

        assert!(channel.is_disconnected());
        assert!(manager.get(&id).await.is_none());
        assert!(!peers.is_connected(&id).await);
        assert!(matches!(events.recv().await.unwrap(), PeerEvent::Disconnected(_)));

        assert!(matches!(
            manager.send_to(&id, block(100)).await,
            Err(ChannelError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_enforce_queue_limits() {
        let (manager, _, channel) = setup(2).await;
        assert!(manager.enforce_queue_limits().await.is_empty());

        for tag in 0..3 {
            channel.send_message(block(tag));
        }
        assert_eq!(manager.enforce_queue_limits().await, vec![channel.id().clone()]);
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_broadcast_skips_inactive() {
        let (manager, _, channel) = setup(10).await;
        let idle = Arc::new(Channel::new(
            KeyPair::generate().node_id(),
            "127.0.0.1:9001".parse().unwrap(),
            false,
            QueueConfig::default(),
        ));
        manager.add(idle.clone()).await;

        assert_eq!(manager.broadcast(block(1)).await, 1);
        assert_eq!(channel.queue().size(), 1);
        assert_eq!(idle.queue().size(), 0);
        assert_eq!(manager.broadcast_except(block(2), Some(channel.id())).await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_and_close_all() {
        let (manager, peers, channel) = setup(10).await;
        assert!(manager.disconnect(channel.id(), DisconnectReason::Shutdown).await);
        assert!(!manager.disconnect(channel.id(), DisconnectReason::Shutdown).await);
        assert_eq!(peers.peer_count().await, 0);

        let (manager, peers, channel) = setup(10).await;
        manager.close_all(DisconnectReason::Shutdown).await;
        assert!(channel.is_disconnected());
        assert!(manager.is_empty().await);
        assert_eq!(peers.peer_count().await, 0);
    }
}
