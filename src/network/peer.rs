//! Peer management for P2P networking
//!
//! Tracks connected peers by identity and broadcasts connect/disconnect
//! events to whoever consumes them (sync, RPC, status reporting).

use crate::network::address::{Multiaddr, PeerAddress};
use crate::network::identity::NodeId;
use crate::network::message::Hello;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

/// Default maximum number of connected peers
pub const MAX_PEERS: usize = 25;

/// Capacity of the peer event channel
const EVENT_CAPACITY: usize = 256;

/// Upper bound on remembered dial strings
const MAX_KNOWN_PEERS: usize = 1000;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Max peers reached")]
    MaxPeersReached,
    #[error("Already connected to {0}")]
    AlreadyConnected(NodeId),
}

/// Information about a connected peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: NodeId,
    /// Address of the live connection
    pub addr: SocketAddr,
    /// Whether we dialed the peer
    pub outbound: bool,
    pub protocol_version: u32,
    pub user_agent: String,
    /// Port the peer accepts connections on
    pub listen_port: u16,
    pub connected_at: DateTime<Utc>,
}

impl PeerInfo {
    pub fn new(id: NodeId, addr: SocketAddr, outbound: bool, hello: &Hello) -> Self {
        Self {
            id,
            addr,
            outbound,
            protocol_version: hello.version,
            user_agent: hello.user_agent.clone(),
            listen_port: hello.listen_port,
            connected_at: Utc::now(),
        }
    }

    /// Where other nodes can dial this peer
    pub fn dial_address(&self) -> PeerAddress {
        let listen = SocketAddr::new(self.addr.ip(), self.listen_port);
        PeerAddress::from_multiaddr(Multiaddr::new(listen, self.id.clone()))
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected(PeerInfo),
    Disconnected(NodeId),
}

/// Manages all peer connections
pub struct PeerManager {
    peers: RwLock<HashMap<NodeId, PeerInfo>>,
    /// Dials in flight, to avoid connecting twice
    pending: Mutex<HashSet<NodeId>>,
    /// Dial strings learned from peer exchange
    known_peers: RwLock<HashSet<String>>,
    max_peers: usize,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerManager {
    pub fn new(max_peers: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            peers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            known_peers: RwLock::new(HashSet::new()),
            max_peers,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Register a connected peer
    pub async fn add_peer(&self, info: PeerInfo) -> Result<(), PeerError> {
        let mut peers = self.peers.write().await;

        if peers.contains_key(&info.id) {
            return Err(PeerError::AlreadyConnected(info.id));
        }
        if peers.len() >= self.max_peers {
            return Err(PeerError::MaxPeersReached);
        }

        log::info!(
            "Added peer {} at {} (outbound: {}, agent: {})",
            info.id.short(),
            info.addr,
            info.outbound,
            info.user_agent
        );
        peers.insert(info.id.clone(), info.clone());
        drop(peers);

        self.pending.lock().remove(&info.id);
        // No subscribers is fine
        let _ = self.events.send(PeerEvent::Connected(info));
        Ok(())
    }

    /// Remove a peer; only the first call for a connection emits an event
    pub async fn remove_peer(&self, id: &NodeId) -> Option<PeerInfo> {
        let removed = self.peers.write().await.remove(id);
        if removed.is_some() {
            log::info!("Removed peer {}", id.short());
            let _ = self.events.send(PeerEvent::Disconnected(id.clone()));
        }
        removed
    }

    pub async fn is_connected(&self, id: &NodeId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    pub async fn get_peer_info(&self, id: &NodeId) -> Option<PeerInfo> {
        self.peers.read().await.get(id).cloned()
    }

    pub async fn get_all_peer_info(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Claim a dial to `id`; false if already connected or being dialed
    pub async fn begin_dial(&self, id: &NodeId) -> bool {
        if self.is_connected(id).await {
            return false;
        }
        self.pending.lock().insert(id.clone())
    }

    /// Release a dial claim after failure
    pub fn end_dial(&self, id: &NodeId) {
        self.pending.lock().remove(id);
    }

    pub fn pending_dials(&self) -> usize {
        self.pending.lock().len()
    }

    /// Remember dial strings; returns how many were new
    pub async fn add_known_peers(&self, addrs: Vec<String>) -> usize {
        let mut known = self.known_peers.write().await;
        let mut added = 0;
        for addr in addrs {
            if known.len() >= MAX_KNOWN_PEERS {
                break;
            }
            if known.insert(addr) {
                added += 1;
            }
        }
        added
    }

    pub async fn get_known_peers(&self) -> Vec<String> {
        self.known_peers.read().await.iter().cloned().collect()
    }

    pub async fn forget_known_peer(&self, addr: &str) -> bool {
        self.known_peers.write().await.remove(addr)
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new(MAX_PEERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn info(port: u16) -> PeerInfo {
        let hello = Hello::new("chain-p2p", "unused", 30303);
        PeerInfo::new(
            KeyPair::generate().node_id(),
            SocketAddr::from(([10, 0, 0, 1], port)),
            true,
            &hello,
        )
    }

    #[tokio::test]
    async fn test_add_and_remove_peer() {
        let manager = PeerManager::new(4);
        let mut events = manager.subscribe();
        let peer = info(5000);

        manager.add_peer(peer.clone()).await.unwrap();
        assert!(manager.is_connected(&peer.id).await);
        assert!(matches!(events.recv().await.unwrap(), PeerEvent::Connected(p) if p.id == peer.id));

        assert!(manager.remove_peer(&peer.id).await.is_some());
        assert!(manager.remove_peer(&peer.id).await.is_none());
        assert!(matches!(events.recv().await.unwrap(), PeerEvent::Disconnected(id) if id == peer.id));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_limits_and_duplicates() {
        let manager = PeerManager::new(1);
        let peer = info(5000);

        manager.add_peer(peer.clone()).await.unwrap();
        assert!(matches!(
            manager.add_peer(peer).await,
            Err(PeerError::AlreadyConnected(_))
        ));
        assert!(matches!(
            manager.add_peer(info(5001)).await,
            Err(PeerError::MaxPeersReached)
        ));
        assert_eq!(manager.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_dial_claims() {
        let manager = PeerManager::default();
        let peer = info(5000);

        assert!(manager.begin_dial(&peer.id).await);
        assert!(!manager.begin_dial(&peer.id).await);
        manager.end_dial(&peer.id);
        assert!(manager.begin_dial(&peer.id).await);

        manager.add_peer(peer.clone()).await.unwrap();
        assert_eq!(manager.pending_dials(), 0);
        assert!(!manager.begin_dial(&peer.id).await);
    }

    #[tokio::test]
    async fn test_known_peers() {
        let manager = PeerManager::default();
        let added = manager
            .add_known_peers(vec!["a".into(), "b".into(), "a".into()])
            .await;
        assert_eq!(added, 2);
        assert!(manager.forget_known_peer("a").await);
        assert_eq!(manager.get_known_peers().await, vec!["b".to_string()]);
    }

    #[test]
    fn test_dial_address_uses_listen_port() {
        let peer = info(49152);
        let dial = peer.dial_address();
        assert_eq!(dial.socket_addr(), Some("10.0.0.1:30303".parse().unwrap()));
        assert_eq!(dial.id(), &peer.id);
    }
}
