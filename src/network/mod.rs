//! P2P Networking module
//!
//! Turns authenticated connections into flow-controlled peer channels.
//!
//! # Features
//! - Node identities and dial-string addresses
//! - Noise-encrypted TCP transport
//! - Per-IP inbound connection limits
//! - UPnP port forwarding
//! - Hello handshake and protocol binding
//! - Per-channel outbound queues with response priority
//! - Queue overflow enforcement
//! - Peer exchange and discovery-driven dialing

pub mod address;
pub mod binding;
pub mod channel;
pub mod codec;
pub mod identity;
pub mod limit;
pub mod manager;
pub mod message;
pub mod nat;
pub mod node;
pub mod peer;
pub mod queue;
pub mod transport;

pub use address::{discovery_peer_to_dial_id, AddressError, AddressKind, Multiaddr, PeerAddress};
pub use binding::{BindingError, BoundChannel, ProtocolBinding, DEFAULT_HANDSHAKE_TIMEOUT};
pub use channel::{Channel, ChannelError, ChannelState};
pub use codec::MessageCodec;
pub use identity::{IdentityError, NodeId};
pub use limit::{ConnectionLimiter, ConnectionPermit, DEFAULT_MAX_INBOUND_PER_IP};
pub use manager::{ChannelManager, DEFAULT_MAX_QUEUE_SIZE};
pub use message::{
    Command, DisconnectReason, Hello, Message, MAGIC, MAX_MESSAGE_SIZE, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};
pub use nat::{NatError, NatManager, NatProtocol, NatStatus, PortMapper, PortMapping};
pub use node::{InboundMessage, Node, NodeError, NodeInfo};
pub use peer::{PeerError, PeerEvent, PeerInfo, PeerManager, MAX_PEERS};
pub use queue::{FlushScheduler, MessageQueue, QueueConfig};
pub use transport::{
    authenticate, dial, AuthenticatedStream, Listener, NoiseIo, SecureSession, TransportError,
};
