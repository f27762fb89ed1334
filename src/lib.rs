//! chain-p2p: peer discovery and flow-controlled peer channels for a
//! blockchain node
//!
//! This crate provides:
//! - secp256k1 node identities rendered as libp2p peer ids
//! - Signed node records (`enr:` text) and a record-to-peer converter
//! - A lifecycle-managed discovery service over a pluggable overlay
//! - Noise-encrypted TCP transport with a Hello handshake
//! - Per-IP inbound limits and optional UPnP port forwarding
//! - Per-peer channels whose outbound queue favors responses over requests
//! - Queue overflow enforcement and a node orchestrating all of it
//!
//! # Example
//!
//! ```rust,no_run
//! use chain_p2p::{Node, P2pConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (node, mut inbound) = Node::new(P2pConfig::default())?;
//! let addr = node.start().await?;
//! println!("Listening on {} as {}", addr, node.local_id());
//!
//! while let Some(msg) = inbound.recv().await {
//!     println!("{} from {}", msg.message.type_name(), msg.from);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, P2pConfig};
pub use crypto::KeyPair;
pub use discovery::{
    convert_to_discovery_peer, DiscoveryError, DiscoveryPeer, DiscoveryService, NodeRecord,
    NodeRecordBuilder, OverlayDiscoveryService, StaticOverlay,
};
pub use network::{
    Channel, ChannelManager, Message, MessageQueue, Node, NodeError, NodeId, PeerAddress,
    PeerManager, ProtocolBinding,
};
