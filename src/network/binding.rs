//! Protocol binding
//!
//! Upgrades an authenticated stream into a registered, active [`Channel`].
//! The peer manager only learns about the connection after every check has
//! passed, so a failed binding leaves nothing behind.

use crate::network::channel::Channel;
use crate::network::codec::MessageCodec;
use crate::network::identity::NodeId;
use crate::network::message::{Command, Hello, Message, MIN_PROTOCOL_VERSION};
use crate::network::peer::{PeerError, PeerInfo, PeerManager};
use crate::network::queue::{FlushScheduler, QueueConfig};
use crate::network::transport::SecureSession;
use futures::stream::{SplitStream, StreamExt};
use futures::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::codec::Framed;

/// Default time allowed for the Hello exchange
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("Protocol mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: String, actual: String },
    #[error("Refusing connection to self")]
    SelfConnection,
    #[error("Handshake timed out")]
    Timeout,
    #[error("Incompatible protocol version {0}")]
    IncompatibleVersion(u32),
    #[error("Handshake identity does not match the authenticated key")]
    IdentityMismatch,
    #[error("Expected Hello, got {0}")]
    UnexpectedMessage(&'static str),
    #[error("Connection closed during handshake")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
}

/// Inbound half of a bound connection
pub type InboundStream<Io> = SplitStream<Framed<Io, MessageCodec>>;

/// Result of a successful binding
pub struct BoundChannel<Io> {
    pub channel: Arc<Channel>,
    pub inbound: InboundStream<Io>,
    pub hello: Hello,
}

pub struct ProtocolBinding {
    local_id: NodeId,
    protocol: String,
    listen_port: u16,
    peer_manager: Arc<PeerManager>,
    scheduler: FlushScheduler,
    queue_config: QueueConfig,
    handshake_timeout: Duration,
}

impl ProtocolBinding {
    pub fn new(
        local_id: NodeId,
        protocol: impl Into<String>,
        listen_port: u16,
        peer_manager: Arc<PeerManager>,
        scheduler: FlushScheduler,
    ) -> Self {
        Self {
            local_id,
            protocol: protocol.into(),
            listen_port,
            peer_manager,
            scheduler,
            queue_config: QueueConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = config;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    fn local_hello(&self) -> Hello {
        Hello::new(&self.protocol, self.local_id.to_base58(), self.listen_port)
    }

    /// Turn an authenticated session into an active channel
    pub async fn init_channel<S: SecureSession>(
        &self,
        session: S,
        negotiated_protocol: &str,
        outbound: bool,
    ) -> Result<BoundChannel<S::Io>, BindingError> {
        if negotiated_protocol != self.protocol {
            return Err(BindingError::ProtocolMismatch {
                expected: self.protocol.clone(),
                actual: negotiated_protocol.to_string(),
            });
        }

        let remote_id = session.remote_id().clone();
        if remote_id == self.local_id {
            return Err(BindingError::SelfConnection);
        }
        let remote_addr = session.remote_addr();

        let mut framed = Framed::new(session.into_io(), MessageCodec);
        let hello = match tokio::time::timeout(
            self.handshake_timeout,
            self.exchange_hello(&mut framed, &remote_id),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(BindingError::Timeout),
        };

        self.peer_manager
            .add_peer(PeerInfo::new(remote_id.clone(), remote_addr, outbound, &hello))
            .await?;

        let channel = Arc::new(Channel::new(
            remote_id,
            remote_addr,
            outbound,
            self.queue_config,
        ));
        let (sink, inbound) = framed.split();
        channel.activate(sink, &self.scheduler);
        channel.mark_active();
        log::debug!(
            "Channel to {} at {} active (outbound: {})",
            channel.id().short(),
            remote_addr,
            outbound
        );

        Ok(BoundChannel {
            channel,
            inbound,
            hello,
        })
    }

    async fn exchange_hello<Io>(
        &self,
        framed: &mut Framed<Io, MessageCodec>,
        remote_id: &NodeId,
    ) -> Result<Hello, BindingError>
    where
        Io: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        framed
            .send(Message::with_json(Command::Hello, &self.local_hello())?)
            .await?;

        let msg = framed.next().await.ok_or(BindingError::ConnectionClosed)??;
        if msg.command != Command::Hello {
            return Err(BindingError::UnexpectedMessage(msg.type_name()));
        }

        let hello: Hello = msg.json()?;
        if hello.version < MIN_PROTOCOL_VERSION {
            return Err(BindingError::IncompatibleVersion(hello.version));
        }
        if hello.protocol != self.protocol {
            return Err(BindingError::ProtocolMismatch {
                expected: self.protocol.clone(),
                actual: hello.protocol,
            });
        }
        if hello.node_id != remote_id.to_base58() {
            return Err(BindingError::IdentityMismatch);
        }
        Ok(hello)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use std::net::SocketAddr;
    use tokio::io::DuplexStream;

    const PROTOCOL: &str = "chain-p2p/1";

    struct TestSession {
        io: DuplexStream,
        remote_id: NodeId,
        remote_addr: SocketAddr,
    }

    impl SecureSession for TestSession {
        type Io = DuplexStream;

        fn remote_id(&self) -> &NodeId {
            &self.remote_id
        }

        fn remote_addr(&self) -> SocketAddr {
            self.remote_addr
        }

        fn into_io(self) -> DuplexStream {
            self.io
        }
    }

    struct Side {
        keypair: KeyPair,
        peers: Arc<PeerManager>,
        binding: ProtocolBinding,
    }

    fn side(port: u16) -> Side {
        let keypair = KeyPair::generate();
        let peers = Arc::new(PeerManager::default());
        let binding = ProtocolBinding::new(
            keypair.node_id(),
            PROTOCOL,
            port,
            peers.clone(),
            FlushScheduler::try_current().unwrap(),
        )
        .with_handshake_timeout(Duration::from_secs(2));
        Side {
            keypair,
            peers,
            binding,
        }
    }

    fn sessions(a: &Side, b: &Side) -> (TestSession, TestSession) {
        let (io_a, io_b) = tokio::io::duplex(64 * 1024);
        (
            TestSession {
                io: io_a,
                remote_id: b.keypair.node_id(),
                remote_addr: "127.0.0.1:9002".parse().unwrap(),
            },
            TestSession {
                io: io_b,
                remote_id: a.keypair.node_id(),
                remote_addr: "127.0.0.1:9001".parse().unwrap(),
            },
        )
    }

    #[tokio::test]
    async fn test_binding_produces_active_channels() {
        let a = side(9001);
        let b = side(9002);
        let (sa, sb) = sessions(&a, &b);

        let (ra, rb) = tokio::join!(
            a.binding.init_channel(sa, PROTOCOL, true),
            b.binding.init_channel(sb, PROTOCOL, false)
        );
        let bound_a = ra.unwrap();
        let mut bound_b = rb.unwrap();

        assert!(bound_a.channel.is_active());
        assert_eq!(bound_a.channel.id(), &b.keypair.node_id());
        assert_eq!(bound_a.hello.listen_port, 9002);
        assert!(a.peers.is_connected(&b.keypair.node_id()).await);
        assert!(b.peers.is_connected(&a.keypair.node_id()).await);
        assert!(!bound_b.channel.is_outbound());

        assert!(bound_a.channel.send_message(Message::ping(5)));
        let received = bound_b.inbound.next().await.unwrap().unwrap();
        assert_eq!(received.nonce(), Some(5));

        bound_a.channel.disconnect().await;
        bound_b.channel.disconnect().await;
    }

    #[tokio::test]
    async fn test_protocol_mismatch_registers_nothing() {
        let a = side(9001);
        let b = side(9002);
        let (sa, _sb) = sessions(&a, &b);

        let result = a.binding.init_channel(sa, "other/1", true).await;
        assert!(matches!(result, Err(BindingError::ProtocolMismatch { .. })));
        assert_eq!(a.peers.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let a = side(9001);
        let (io, _other) = tokio::io::duplex(1024);
        let session = TestSession {
            io,
            remote_id: a.keypair.node_id(),
            remote_addr: "127.0.0.1:9001".parse().unwrap(),
        };

        let result = a.binding.init_channel(session, PROTOCOL, true).await;
        assert!(matches!(result, Err(BindingError::SelfConnection)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_registers_nothing() {
        let a = side(9001);
        let b = side(9002);
        let (sa, _silent) = sessions(&a, &b);

        let result = a.binding.init_channel(sa, PROTOCOL, true).await;
        assert!(matches!(result, Err(BindingError::Timeout)));
        assert_eq!(a.peers.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_identity_mismatch_rejected() {
        let a = side(9001);
        let b = side(9002);
        let (mut sa, sb) = sessions(&a, &b);
        // A believes it authenticated someone other than B
        sa.remote_id = KeyPair::generate().node_id();

        let (ra, _rb) = tokio::join!(
            a.binding.init_channel(sa, PROTOCOL, true),
            b.binding.init_channel(sb, PROTOCOL, false)
        );
        assert!(matches!(ra, Err(BindingError::IdentityMismatch)));
        assert_eq!(a.peers.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_closed_stream_fails() {
        let a = side(9001);
        let b = side(9002);
        let (sa, sb) = sessions(&a, &b);
        drop(sb);

        let result = a.binding.init_channel(sa, PROTOCOL, true).await;
        assert!(result.is_err());
        assert_eq!(a.peers.peer_count().await, 0);
    }
}
