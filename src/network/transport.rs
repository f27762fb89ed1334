//! TCP transport and peer authentication
//!
//! Before any framed traffic, both ends run a libp2p noise handshake with
//! their node key. The peer id the handshake proves is what the protocol
//! binding uses as the remote [`NodeId`]. Everything after the handshake is
//! encrypted.

use crate::crypto::KeyPair;
use crate::network::identity::NodeId;
use libp2p::core::upgrade::{InboundConnectionUpgrade, OutboundConnectionUpgrade};
use libp2p::core::Endpoint;
use libp2p::noise;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};

/// Protocol name offered to the noise upgrade
const NOISE_PROTOCOL: &str = "/noise";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Authentication timed out")]
    Timeout,
    #[error("Noise handshake failed: {0}")]
    Noise(#[from] noise::Error),
}

/// An authenticated connection exposing the remote's verified identity
pub trait SecureSession: Send {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn remote_id(&self) -> &NodeId;

    fn remote_addr(&self) -> SocketAddr;

    fn into_io(self) -> Self::Io;
}

/// Encrypted stream produced by the handshake
pub type NoiseIo<T> = Compat<noise::Output<Compat<T>>>;

/// A stream whose remote end proved ownership of `remote_id`
pub struct AuthenticatedStream<T> {
    io: NoiseIo<T>,
    remote_id: NodeId,
    remote_addr: SocketAddr,
}

impl<T> SecureSession for AuthenticatedStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Io = NoiseIo<T>;

    fn remote_id(&self) -> &NodeId {
        &self.remote_id
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn into_io(self) -> Self::Io {
        self.io
    }
}

impl<T> std::fmt::Debug for AuthenticatedStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedStream")
            .field("remote_id", &self.remote_id)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// TCP listener for incoming peer connections
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Actual bound address (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), TransportError> {
        Ok(self.listener.accept().await?)
    }
}

/// Connect to a peer
pub async fn dial(addr: SocketAddr) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Run the noise handshake on a fresh stream
///
/// `role` is `Dialer` on the side that opened the connection.
pub async fn authenticate<T>(
    io: T,
    remote_addr: SocketAddr,
    keypair: &KeyPair,
    role: Endpoint,
    timeout: Duration,
) -> Result<AuthenticatedStream<T>, TransportError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match tokio::time::timeout(timeout, handshake(io, remote_addr, keypair, role)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

async fn handshake<T>(
    io: T,
    remote_addr: SocketAddr,
    keypair: &KeyPair,
    role: Endpoint,
) -> Result<AuthenticatedStream<T>, TransportError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = noise::Config::new(&keypair.to_identity())?;
    let (peer_id, output) = match role {
        Endpoint::Dialer => config.upgrade_outbound(io.compat(), NOISE_PROTOCOL).await?,
        Endpoint::Listener => config.upgrade_inbound(io.compat(), NOISE_PROTOCOL).await?,
    };

    let remote_id = NodeId::from_peer_id(peer_id);
    log::debug!("Authenticated {} as {}", remote_addr, remote_id);

    Ok(AuthenticatedStream {
        io: output.compat(),
        remote_id,
        remote_addr,
    })
}
