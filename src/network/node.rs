//! P2P Node implementation
//!
//! The main node that orchestrates all networking components: the listener,
//! discovery rounds, dialing, protocol binding and the per-connection read
//! loops. Application messages are handed out on an mpsc channel; everything
//! else (ping, peer exchange, disconnect) is answered here.

use crate::config::{ConfigError, P2pConfig};
use crate::crypto::{KeyError, KeyPair};
use crate::discovery::{
    DiscoveryError, DiscoveryService, NoOpDiscoveryService, OverlayDiscoveryService, ServiceState,
};
use crate::network::address::{AddressError, Multiaddr, PeerAddress};
use crate::network::binding::{BindingError, BoundChannel, InboundStream, ProtocolBinding};
use crate::network::channel::{Channel, ChannelError};
use crate::network::identity::NodeId;
use crate::network::limit::{ConnectionLimiter, ConnectionPermit};
use crate::network::manager::ChannelManager;
use crate::network::message::{Command, DisconnectReason, Message};
use crate::network::nat::{self, NatManager, NatProtocol};
use crate::network::peer::{PeerEvent, PeerManager};
use crate::network::queue::FlushScheduler;
use crate::network::transport::{authenticate, dial, Listener, SecureSession, TransportError};
use futures::stream::StreamExt;
use libp2p::core::Endpoint;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often queue limits are enforced and peers pinged
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(15);

/// Capacity of the inbound application message channel
const INBOUND_CAPACITY: usize = 1000;

/// Most dial strings returned in one Peers message
const MAX_PEERS_RESPONSE: usize = 100;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Node is not started")]
    NotStarted,
    #[error("Node is already started")]
    AlreadyStarted,
    #[error("Refusing to dial self")]
    SelfDial,
    #[error("Address has no socket address: {0}")]
    Undialable(String),
    #[error("Already connected or dialing {0}")]
    DialInProgress(NodeId),
    #[error("Dialed {expected} but authenticated {actual}")]
    IdentityMismatch { expected: NodeId, actual: NodeId },
    #[error("No tokio runtime available")]
    NoRuntime,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Binding error: {0}")]
    Binding(#[from] BindingError),
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("Address error: {0}")]
    Address(#[from] AddressError),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

/// An application message received from a peer
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: NodeId,
    pub message: Message,
}

/// Point-in-time view of the node
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub listen_addr: Option<SocketAddr>,
    pub peer_count: usize,
    pub active_channels: usize,
    pub known_peers: usize,
    pub discovery: ServiceState,
    pub local_record: Option<String>,
}

/// The main P2P node
pub struct Node {
    config: P2pConfig,
    keypair: KeyPair,
    local_id: NodeId,
    peer_manager: Arc<PeerManager>,
    channels: Arc<ChannelManager>,
    discovery: Arc<dyn DiscoveryService>,
    limiter: Arc<ConnectionLimiter>,
    /// Serializes `start` calls
    start_lock: tokio::sync::Mutex<()>,
    /// Set once the node is fully started
    binding: OnceLock<Arc<ProtocolBinding>>,
    listen_addr: OnceLock<SocketAddr>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node with the discovery backend the config asks for
    pub fn new(config: P2pConfig) -> Result<(Arc<Self>, mpsc::Receiver<InboundMessage>), NodeError> {
        config.validate()?;
        let keypair = config.keypair()?;

        let discovery: Arc<dyn DiscoveryService> = if config.discovery_enabled {
            Arc::new(OverlayDiscoveryService::create(
                &keypair,
                config.listen_ip()?,
                config.listen_port,
                &config.bootnodes,
            )?)
        } else {
            Arc::new(NoOpDiscoveryService)
        };

        Ok(Self::with_discovery(config, keypair, discovery))
    }

    /// Create a node around an existing discovery service
    pub fn with_discovery(
        config: P2pConfig,
        keypair: KeyPair,
        discovery: Arc<dyn DiscoveryService>,
    ) -> (Arc<Self>, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let peer_manager = Arc::new(PeerManager::new(config.max_peers));
        let channels = Arc::new(ChannelManager::new(
            peer_manager.clone(),
            config.max_queue_size,
        ));
        let local_id = keypair.node_id();
        let limiter = Arc::new(ConnectionLimiter::new(config.max_inbound_per_ip));

        let node = Arc::new(Self {
            config,
            keypair,
            local_id,
            peer_manager,
            channels,
            discovery,
            limiter,
            start_lock: tokio::sync::Mutex::new(()),
            binding: OnceLock::new(),
            listen_addr: OnceLock::new(),
            inbound_tx,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        (node, inbound_rx)
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr.get().copied()
    }

    /// Our dial string, once listening
    pub fn local_address(&self) -> Option<PeerAddress> {
        let addr = self.listen_addr()?;
        Some(PeerAddress::from_multiaddr(Multiaddr::new(
            addr,
            self.local_id.clone(),
        )))
    }

    pub fn peer_manager(&self) -> Arc<PeerManager> {
        self.peer_manager.clone()
    }

    pub fn channels(&self) -> Arc<ChannelManager> {
        self.channels.clone()
    }

    pub fn discovery(&self) -> Arc<dyn DiscoveryService> {
        self.discovery.clone()
    }

    pub fn limiter(&self) -> Arc<ConnectionLimiter> {
        self.limiter.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.peer_manager.subscribe()
    }

    pub fn local_record_export(&self) -> Option<String> {
        self.discovery.local_record_export()
    }

    /// Bind, start discovery and spawn the background loops
    ///
    /// Nothing is recorded until discovery has started, so a failed start
    /// can be retried.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, NodeError> {
        let _guard = self.start_lock.lock().await;
        if self.listen_addr.get().is_some() {
            return Err(NodeError::AlreadyStarted);
        }
        let scheduler = FlushScheduler::try_current().ok_or(NodeError::NoRuntime)?;

        let listener = Listener::bind(self.config.listen_addr()?).await?;
        let local_addr = listener.local_addr();

        let binding = ProtocolBinding::new(
            self.local_id.clone(),
            self.config.protocol.clone(),
            local_addr.port(),
            self.peer_manager.clone(),
            scheduler,
        )
        .with_queue_config(self.config.queue_config())
        .with_handshake_timeout(self.config.handshake_timeout());

        self.discovery.start().await?;
        if self.binding.set(Arc::new(binding)).is_err() {
            return Err(NodeError::AlreadyStarted);
        }
        let _ = self.listen_addr.set(local_addr);
        log::info!("Node {} started on {}", self.local_id, local_addr);
        if let Some(record) = self.local_record_export() {
            log::info!("Local node record: {}", record);
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.clone().accept_loop(listener)));
        tasks.push(tokio::spawn(self.clone().maintenance_loop()));
        if self.config.discovery_enabled {
            tasks.push(tokio::spawn(self.clone().discovery_loop()));
        }
        if self.config.upnp_enabled {
            tasks.push(tokio::spawn(self.clone().nat_loop(local_addr.port())));
        }
        self.tasks.lock().extend(tasks);

        for peer in &self.config.static_peers {
            match PeerAddress::from_dial_string(peer) {
                Ok(address) => self.spawn_connect(address),
                Err(e) => log::warn!("Skipping static peer {}: {}", peer, e),
            }
        }

        Ok(local_addr)
    }

    fn binding(&self) -> Result<&Arc<ProtocolBinding>, NodeError> {
        self.binding.get().ok_or(NodeError::NotStarted)
    }

    /// Dial a peer given as a dial string
    pub async fn connect_to(self: &Arc<Self>, dial_string: &str) -> Result<(), NodeError> {
        let address = PeerAddress::from_dial_string(dial_string)?;
        self.connect(&address).await
    }

    /// Dial, authenticate and bind a peer
    pub async fn connect(self: &Arc<Self>, address: &PeerAddress) -> Result<(), NodeError> {
        let binding = self.binding()?.clone();
        if address.id() == &self.local_id {
            return Err(NodeError::SelfDial);
        }
        let target = address
            .socket_addr()
            .ok_or_else(|| NodeError::Undialable(address.to_external_form()))?;
        if !self.peer_manager.begin_dial(address.id()).await {
            return Err(NodeError::DialInProgress(address.id().clone()));
        }

        let result = self.dial_and_bind(&binding, address, target).await;
        if result.is_err() {
            self.peer_manager.end_dial(address.id());
        }
        result
    }

    async fn dial_and_bind(
        self: &Arc<Self>,
        binding: &ProtocolBinding,
        address: &PeerAddress,
        target: SocketAddr,
    ) -> Result<(), NodeError> {
        log::debug!("Dialing {} at {}", address.id().short(), target);
        let stream = dial(target).await?;
        let session = authenticate(
            stream,
            target,
            &self.keypair,
            Endpoint::Dialer,
            self.config.handshake_timeout(),
        )
        .await?;

        let actual = session.remote_id().clone();
        if &actual != address.id() {
            return Err(NodeError::IdentityMismatch {
                expected: address.id().clone(),
                actual,
            });
        }

        let bound = binding.init_channel(session, binding.protocol(), true).await?;
        self.register(bound, None).await;
        Ok(())
    }

    /// Dial in the background, logging failures
    fn spawn_connect(self: &Arc<Self>, address: PeerAddress) {
        let node = self.clone();
        tokio::spawn(async move {
            match node.connect(&address).await {
                Ok(()) | Err(NodeError::DialInProgress(_)) => {}
                Err(e) => log::warn!("Failed to connect to {}: {}", address, e),
            }
        });
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let Some(permit) = self.limiter.try_acquire(addr.ip()) else {
                        log::debug!("Rejecting connection from {}: per-IP limit reached", addr);
                        drop(stream);
                        continue;
                    };
                    log::debug!("Incoming connection from {}", addr);
                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.accept_connection(stream, addr, permit).await {
                            log::warn!("Inbound connection from {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => log::error!("Accept error: {}", e),
            }
        }
        log::debug!("Accept loop stopped");
    }

    async fn accept_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        addr: SocketAddr,
        permit: ConnectionPermit,
    ) -> Result<(), NodeError> {
        let binding = self.binding()?.clone();
        let session = authenticate(
            stream,
            addr,
            &self.keypair,
            Endpoint::Listener,
            self.config.handshake_timeout(),
        )
        .await?;
        let bound = binding.init_channel(session, binding.protocol(), false).await?;
        self.register(bound, Some(permit)).await;
        Ok(())
    }

    /// Track a freshly bound channel and spawn its read loop
    ///
    /// An inbound connection's permit is held until its read loop ends.
    async fn register<Io>(
        self: &Arc<Self>,
        bound: BoundChannel<Io>,
        permit: Option<ConnectionPermit>,
    ) where
        Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let BoundChannel {
            channel, inbound, ..
        } = bound;

        if let Some(previous) = self.channels.add(channel.clone()).await {
            previous.disconnect().await;
        }
        if channel.is_outbound() {
            channel.send_message(Message::new(Command::GetPeers, Vec::new()));
        }

        let node = self.clone();
        tokio::spawn(async move {
            node.read_loop(channel, inbound).await;
            drop(permit);
        });
    }

    async fn read_loop<Io>(self: Arc<Self>, channel: Arc<Channel>, mut inbound: InboundStream<Io>)
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = channel.closed() => break,
                next = inbound.next() => next,
            };
            match next {
                Some(Ok(msg)) => self.handle_message(&channel, msg).await,
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", channel.id().short(), e);
                    break;
                }
                None => {
                    log::info!("Peer {} closed the connection", channel.id().short());
                    break;
                }
            }
        }
        self.channels.release(&channel).await;
    }

    async fn handle_message(self: &Arc<Self>, channel: &Arc<Channel>, msg: Message) {
        log::trace!("{} from {}", msg.type_name(), channel.id().short());
        match msg.command {
            Command::Ping => {
                let nonce = msg.nonce().unwrap_or_default();
                channel.send_message(Message::pong(nonce));
            }
            Command::Pong => {}
            Command::GetPeers => {
                let peers: Vec<String> = self
                    .peer_manager
                    .get_all_peer_info()
                    .await
                    .into_iter()
                    .filter(|info| &info.id != channel.id())
                    .take(MAX_PEERS_RESPONSE)
                    .map(|info| info.dial_address().to_external_form())
                    .collect();
                match Message::with_json(Command::Peers, &peers) {
                    Ok(reply) => {
                        channel.send_message(reply);
                    }
                    Err(e) => log::warn!("Failed to encode peer list: {}", e),
                }
            }
            Command::Peers => match msg.json::<Vec<String>>() {
                Ok(peers) => self.handle_peers(peers).await,
                Err(e) => log::warn!("Bad peer list from {}: {}", channel.id().short(), e),
            },
            Command::Disconnect => {
                let reason = msg.json::<DisconnectReason>().ok();
                log::info!("Peer {} disconnecting: {:?}", channel.id().short(), reason);
                channel.disconnect().await;
            }
            Command::Hello => {
                log::warn!("Unexpected Hello from {}", channel.id().short());
            }
            _ => {
                let inbound = InboundMessage {
                    from: channel.id().clone(),
                    message: msg,
                };
                if self.inbound_tx.send(inbound).await.is_err() {
                    log::debug!("Inbound receiver dropped");
                }
            }
        }
    }

    async fn handle_peers(self: &Arc<Self>, peers: Vec<String>) {
        let added = self.peer_manager.add_known_peers(peers.clone()).await;
        log::debug!("Learned {} new peer addresses", added);
        if self.config.is_bootnode {
            return;
        }

        for peer in peers {
            if self.peer_manager.peer_count().await >= self.config.max_peers {
                break;
            }
            let Ok(address) = PeerAddress::from_dial_string(&peer) else {
                continue;
            };
            if address.id() == &self.local_id || self.peer_manager.is_connected(address.id()).await
            {
                continue;
            }
            self.spawn_connect(address);
        }
    }

    /// One discovery round: search, then dial active peers we are not connected to
    pub async fn discover_peers(self: &Arc<Self>) -> Result<usize, NodeError> {
        match self.discovery.search_for_peers().await {
            Ok(records) => log::debug!("Discovery round returned {} records", records.len()),
            Err(DiscoveryError::Cancelled) => return Ok(0),
            Err(e) => return Err(e.into()),
        }
        if self.config.is_bootnode {
            return Ok(0);
        }

        let mut dialed = 0;
        for peer in self.discovery.stream_known_peers() {
            if self.peer_manager.peer_count().await + self.peer_manager.pending_dials()
                >= self.config.max_peers
            {
                break;
            }
            let address = PeerAddress::from_discovery_peer(&peer);
            if address.id() == &self.local_id || self.peer_manager.is_connected(address.id()).await
            {
                continue;
            }
            self.spawn_connect(address);
            dialed += 1;
        }
        Ok(dialed)
    }

    async fn discovery_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.discovery_interval());
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.discover_peers().await {
                        log::warn!("Discovery round failed: {}", e);
                    }
                }
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let dropped = self.channels.enforce_queue_limits().await;
                    if !dropped.is_empty() {
                        log::warn!("Dropped {} overflowing peers", dropped.len());
                    }
                    self.channels.broadcast(Message::ping(rand::random())).await;
                }
            }
        }
    }

    /// IPv4 address a gateway should forward to
    fn nat_local_ip(&self) -> Option<Ipv4Addr> {
        match self.config.listen_ip() {
            Ok(IpAddr::V4(ip)) if !ip.is_unspecified() => Some(ip),
            Ok(IpAddr::V4(_)) => nat::local_ipv4(),
            Ok(IpAddr::V6(_)) | Err(_) => None,
        }
    }

    /// Forward the listen port through a UPnP gateway and keep it leased
    async fn nat_loop(self: Arc<Self>, port: u16) {
        let Some(local_ip) = self.nat_local_ip() else {
            log::warn!("UPnP needs a local IPv4 address; skipping");
            return;
        };
        let manager = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            found = NatManager::discover(local_ip) => match found {
                Ok(manager) => manager,
                Err(e) => {
                    log::warn!("UPnP unavailable: {}", e);
                    return;
                }
            },
        };

        manager.start().await;
        if let Err(e) = manager.request_port_forward(port, NatProtocol::Tcp).await {
            log::warn!("Failed to forward port {}: {}", port, e);
        }

        let mut ticker = tokio::time::interval(nat::RENEWAL_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    manager.renew_all().await;
                }
            }
        }
        manager.stop().await;
    }

    /// Queue a message for one peer
    pub async fn send_to(&self, id: &NodeId, msg: Message) -> Result<(), NodeError> {
        Ok(self.channels.send_to(id, msg).await?)
    }

    /// Queue a message for every active peer
    pub async fn broadcast(&self, msg: Message) -> usize {
        self.channels.broadcast(msg).await
    }

    pub async fn status(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.local_id.clone(),
            listen_addr: self.listen_addr(),
            peer_count: self.peer_manager.peer_count().await,
            active_channels: self.channels.active_channels().await.len(),
            known_peers: self.peer_manager.get_known_peers().await.len(),
            discovery: self.discovery.state(),
            local_record: self.local_record_export(),
        }
    }

    /// Stop background loops, disconnect every peer and stop discovery
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        log::info!("Shutting down node {}", self.local_id.short());
        self.shutdown.cancel();
        self.channels.close_all(DisconnectReason::Shutdown).await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("Background task ended abnormally: {}", e);
            }
        }

        self.discovery.stop().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DiscoveryPeer, NodeRecord, NodeRecordBuilder, NodeStatus, StaticOverlay};
    use async_trait::async_trait;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    fn config() -> P2pConfig {
        P2pConfig {
            listen_ip: "127.0.0.1".into(),
            listen_port: 0,
            discovery_enabled: false,
            ..Default::default()
        }
    }

    async fn started() -> (Arc<Node>, mpsc::Receiver<InboundMessage>) {
        let (node, rx) = Node::new(config()).unwrap();
        node.start().await.unwrap();
        (node, rx)
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached");
    }

    fn dial_string(node: &Node) -> String {
        node.local_address().unwrap().to_external_form()
    }

    #[tokio::test]
    async fn test_connect_and_exchange_messages() {
        let (a, mut a_rx) = started().await;
        let (b, _b_rx) = started().await;

        b.connect_to(&dial_string(&a)).await.unwrap();
        wait_until(|| async { a.peer_manager().peer_count().await == 1 }).await;
        assert!(b.peer_manager().is_connected(a.local_id()).await);

        b.send_to(a.local_id(), Message::new(Command::Application(1), vec![1, 2, 3]))
            .await
            .unwrap();
        let received = a_rx.recv().await.unwrap();
        assert_eq!(&received.from, b.local_id());
        assert_eq!(received.message.payload, vec![1, 2, 3]);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_and_self_dial_rejected() {
        let (a, _a_rx) = started().await;
        let (b, _b_rx) = started().await;

        assert!(matches!(
            a.connect_to(&dial_string(&a)).await,
            Err(NodeError::SelfDial)
        ));

        b.connect_to(&dial_string(&a)).await.unwrap();
        assert!(matches!(
            b.connect_to(&dial_string(&a)).await,
            Err(NodeError::DialInProgress(_))
        ));

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_identity_rejected() {
        let (a, _a_rx) = started().await;
        let (b, _b_rx) = started().await;

        let imposter = format!(
            "/ip4/127.0.0.1/tcp/{}/ipfs/{}",
            a.listen_addr().unwrap().port(),
            KeyPair::generate().node_id()
        );
        assert!(matches!(
            b.connect_to(&imposter).await,
            Err(NodeError::IdentityMismatch { .. })
        ));
        assert_eq!(b.peer_manager().peer_count().await, 0);
        assert_eq!(b.peer_manager().pending_dials(), 0);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_exchange_dials_learned_peers() {
        let (hub, _hub_rx) = started().await;
        let (first, _first_rx) = started().await;
        let (second, _second_rx) = started().await;

        first.connect_to(&dial_string(&hub)).await.unwrap();
        wait_until(|| async { hub.peer_manager().peer_count().await == 1 }).await;

        second.connect_to(&dial_string(&hub)).await.unwrap();
        wait_until(|| async { second.peer_manager().is_connected(first.local_id()).await }).await;
        assert!(second.status().await.known_peers >= 1);

        for node in [hub, first, second] {
            node.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_remote_shutdown_removes_peer() {
        let (a, _a_rx) = started().await;
        let (b, _b_rx) = started().await;
        let mut events = a.subscribe();

        b.connect_to(&dial_string(&a)).await.unwrap();
        wait_until(|| async { a.peer_manager().peer_count().await == 1 }).await;
        b.shutdown().await.unwrap();

        wait_until(|| async { a.peer_manager().peer_count().await == 0 }).await;
        assert!(a.channels().is_empty().await);
        let mut saw_disconnect = false;
        while let Ok(event) = events.try_recv() {
            saw_disconnect |= matches!(event, PeerEvent::Disconnected(id) if &id == b.local_id());
        }
        assert!(saw_disconnect);

        a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_round_dials_known_peers() {
        let a_key = KeyPair::generate();
        let (a, _a_rx) = Node::new(P2pConfig {
            private_key: Some(a_key.private_key_hex()),
            ..config()
        })
        .unwrap();
        let a_addr = a.start().await.unwrap();

        let b_key = KeyPair::generate();
        let b_record = NodeRecordBuilder::new()
            .ip(a_addr.ip())
            .tcp(1)
            .sign(&b_key)
            .unwrap();
        let overlay = Arc::new(StaticOverlay::new(b_record, vec![]));
        let discovery = Arc::new(OverlayDiscoveryService::new(overlay.clone()));
        let (b, _b_rx) = Node::with_discovery(
            P2pConfig {
                discovery_enabled: true,
                discovery_interval_secs: 3600,
                ..config()
            },
            b_key,
            discovery,
        );
        b.start().await.unwrap();

        let a_record = NodeRecordBuilder::new()
            .ip(a_addr.ip())
            .tcp(a_addr.port())
            .sign(&a_key)
            .unwrap();
        overlay.insert(a_record, NodeStatus::Active);

        b.discover_peers().await.unwrap();
        wait_until(|| async { b.peer_manager().is_connected(a.local_id()).await }).await;
        assert_eq!(b.status().await.discovery, ServiceState::Started);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
        assert_eq!(b.status().await.discovery, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_bootnode_does_not_dial() {
        let (node, _rx) = Node::new(P2pConfig {
            is_bootnode: true,
            discovery_enabled: true,
            ..config()
        })
        .unwrap();
        node.start().await.unwrap();

        assert_eq!(node.discover_peers().await.unwrap(), 0);
        assert!(node.local_record_export().unwrap().starts_with("enr:"));
        node.shutdown().await.unwrap();
    }

    /// Discovery whose first start fails
    #[derive(Default)]
    struct FlakyDiscovery {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl DiscoveryService for FlakyDiscovery {
        async fn start(&self) -> Result<(), DiscoveryError> {
            if self.starts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(DiscoveryError::StartFailed("bootstrap unreachable".into()));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<(), DiscoveryError> {
            Ok(())
        }

        async fn search_for_peers(&self) -> Result<Vec<NodeRecord>, DiscoveryError> {
            Ok(Vec::new())
        }

        fn stream_known_peers(&self) -> Vec<DiscoveryPeer> {
            Vec::new()
        }

        fn local_record_export(&self) -> Option<String> {
            None
        }

        fn state(&self) -> ServiceState {
            ServiceState::Stopped
        }
    }

    #[tokio::test]
    async fn test_failed_discovery_start_can_be_retried() {
        let (node, _rx) = Node::with_discovery(
            config(),
            KeyPair::generate(),
            Arc::new(FlakyDiscovery::default()),
        );

        assert!(matches!(node.start().await, Err(NodeError::Discovery(_))));
        assert!(node.listen_addr().is_none());
        assert!(matches!(
            node.connect_to(&format!("/ip4/127.0.0.1/tcp/1/ipfs/{}", KeyPair::generate().node_id()))
                .await,
            Err(NodeError::NotStarted)
        ));

        let addr = node.start().await.unwrap();
        assert_eq!(node.listen_addr(), Some(addr));
        assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_limited_per_ip() {
        let (node, _rx) = Node::new(P2pConfig {
            max_inbound_per_ip: 1,
            ..config()
        })
        .unwrap();
        let addr = node.start().await.unwrap();
        let local_ip: IpAddr = "127.0.0.1".parse().unwrap();

        // Holds the only slot while its handshake is pending
        let _first = tokio::net::TcpStream::connect(addr).await.unwrap();
        let limiter = node.limiter();
        wait_until(|| {
            let limiter = limiter.clone();
            async move { limiter.connections_from(&local_ip) == 1 }
        })
        .await;

        let mut second = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(limiter.connections_from(&local_ip), 1);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_before_start_fails() {
        let (node, _rx) = Node::new(config()).unwrap();
        let target = KeyPair::generate().node_id();
        let result = node
            .connect_to(&format!("/ip4/127.0.0.1/tcp/1/ipfs/{}", target))
            .await;
        assert!(matches!(result, Err(NodeError::NotStarted)));
        assert!(node.local_record_export().is_none());
    }
}
