//! Peer addressing
//!
//! Dial targets are libp2p multiaddrs of the form
//! `/ip4/<ip>/tcp/<port>/ipfs/<base58 id>`. A [`PeerAddress`] pairs a
//! [`NodeId`] with either such an address or a plain transport string.

use crate::discovery::DiscoveryPeer;
use crate::network::identity::NodeId;
use libp2p::multiaddr::Protocol;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Identity tag written when formatting dial strings
pub const PEER_ID_TAG: &str = "ipfs";

/// Address parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Malformed address: {0}")]
    Malformed(String),
    #[error("Unsupported protocol segment: {0}")]
    UnsupportedProtocol(String),
    #[error("No peer ID present in address: {0}")]
    MissingPeerId(String),
}

/// A dial address: one IP, one TCP port and the identity expected there
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    inner: libp2p::Multiaddr,
    socket_addr: SocketAddr,
    peer_id: NodeId,
}

impl Multiaddr {
    pub fn new(socket_addr: SocketAddr, peer_id: NodeId) -> Self {
        let inner = libp2p::Multiaddr::empty()
            .with(Protocol::from(socket_addr.ip()))
            .with(Protocol::Tcp(socket_addr.port()))
            .with(Protocol::P2p(*peer_id.peer_id()));
        Self {
            inner,
            socket_addr,
            peer_id,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    pub fn peer_id(&self) -> &NodeId {
        &self.peer_id
    }

    pub fn as_libp2p(&self) -> &libp2p::Multiaddr {
        &self.inner
    }

    /// `ip4` or `ip6`
    pub fn family(&self) -> &'static str {
        match self.socket_addr.ip() {
            IpAddr::V4(_) => "ip4",
            IpAddr::V6(_) => "ip6",
        }
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.inner.to_string();
        f.write_str(&text.replace("/p2p/", &format!("/{}/", PEER_ID_TAG)))
    }
}

impl FromStr for Multiaddr {
    type Err = AddressError;

    /// Accepts both the `ipfs` and the `p2p` identity tag
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = s
            .trim()
            .parse::<libp2p::Multiaddr>()
            .map_err(|e| AddressError::Malformed(format!("{}: {}", s, e)))?;

        let mut protocols = parsed.iter();
        let ip = match protocols.next() {
            Some(Protocol::Ip4(ip)) => IpAddr::V4(ip),
            Some(Protocol::Ip6(ip)) => IpAddr::V6(ip),
            Some(other) => return Err(AddressError::UnsupportedProtocol(other.to_string())),
            None => return Err(AddressError::Malformed(s.to_string())),
        };
        let port = match protocols.next() {
            Some(Protocol::Tcp(port)) => port,
            Some(other) => return Err(AddressError::UnsupportedProtocol(other.to_string())),
            None => return Err(AddressError::MissingPeerId(s.to_string())),
        };
        let peer_id = match protocols.next() {
            Some(Protocol::P2p(peer_id)) => NodeId::from_peer_id(peer_id),
            Some(other) => return Err(AddressError::UnsupportedProtocol(other.to_string())),
            None => return Err(AddressError::MissingPeerId(s.to_string())),
        };
        if protocols.next().is_some() {
            return Err(AddressError::Malformed(s.to_string()));
        }

        Ok(Self::new(SocketAddr::new(ip, port), peer_id))
    }
}

/// Transport-specific address forms
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressKind {
    Multiaddr(Multiaddr),
    Simple(String),
}

/// A node identity plus the address it was resolved at
#[derive(Debug, Clone)]
pub struct PeerAddress {
    id: NodeId,
    kind: AddressKind,
}

impl PeerAddress {
    /// An address with no structured transport information
    pub fn simple(id: NodeId, transport: impl Into<String>) -> Self {
        Self {
            id,
            kind: AddressKind::Simple(transport.into()),
        }
    }

    pub fn from_multiaddr(multiaddr: Multiaddr) -> Self {
        Self {
            id: multiaddr.peer_id().clone(),
            kind: AddressKind::Multiaddr(multiaddr),
        }
    }

    /// Parse a dial string; fails if the identity component is missing
    pub fn from_dial_string(address: &str) -> Result<Self, AddressError> {
        Ok(Self::from_multiaddr(address.parse()?))
    }

    /// Dial address of a discovered peer
    pub fn from_discovery_peer(peer: &DiscoveryPeer) -> Self {
        Self::from_multiaddr(Multiaddr::new(peer.address(), peer.node_id().clone()))
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn kind(&self) -> &AddressKind {
        &self.kind
    }

    pub fn as_multiaddr(&self) -> Option<&Multiaddr> {
        match &self.kind {
            AddressKind::Multiaddr(addr) => Some(addr),
            AddressKind::Simple(_) => None,
        }
    }

    /// Socket address, when the transport form carries one
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.kind {
            AddressKind::Multiaddr(addr) => Some(addr.socket_addr()),
            AddressKind::Simple(s) => s.parse().ok(),
        }
    }

    pub fn to_external_form(&self) -> String {
        match &self.kind {
            AddressKind::Multiaddr(addr) => addr.to_string(),
            AddressKind::Simple(s) => s.clone(),
        }
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_external_form())
    }
}

/// Format the dial string for a discovered peer
pub fn discovery_peer_to_dial_id(peer: &DiscoveryPeer) -> String {
    PeerAddress::from_discovery_peer(peer).to_external_form()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_discovery_peer_to_dial_id() {
        let kp = KeyPair::generate();
        let peer = DiscoveryPeer::new(
            kp.public_key_bytes().to_vec(),
            "127.0.0.1:10000".parse().unwrap(),
        )
        .unwrap();

        let expected = format!("/ip4/127.0.0.1/tcp/10000/ipfs/{}", kp.node_id());
        assert_eq!(discovery_peer_to_dial_id(&peer), expected);
    }

    #[test]
    fn test_ipv6_dial_id() {
        let kp = KeyPair::generate();
        let peer = DiscoveryPeer::new(kp.public_key_bytes().to_vec(), "[::1]:30303".parse().unwrap())
            .unwrap();

        let dial = discovery_peer_to_dial_id(&peer);
        assert!(dial.starts_with("/ip6/::1/tcp/30303/ipfs/"));

        let parsed = PeerAddress::from_dial_string(&dial).unwrap();
        assert_eq!(parsed.id(), &kp.node_id());
        assert_eq!(parsed.socket_addr(), Some("[::1]:30303".parse().unwrap()));
    }

    #[test]
    fn test_parse_accepts_p2p_tag() {
        let id = KeyPair::generate().node_id();
        let addr = PeerAddress::from_dial_string(&format!("/ip4/10.0.0.1/tcp/8001/p2p/{}", id))
            .unwrap();

        assert_eq!(addr.id(), &id);
        let multiaddr = addr.as_multiaddr().unwrap();
        assert_eq!(multiaddr.family(), "ip4");
        assert_eq!(multiaddr.to_string(), format!("/ip4/10.0.0.1/tcp/8001/ipfs/{}", id));
    }

    #[test]
    fn test_missing_peer_id_fails() {
        assert_eq!(
            PeerAddress::from_dial_string("/ip4/10.0.0.1/tcp/8001"),
            Err(AddressError::MissingPeerId("/ip4/10.0.0.1/tcp/8001".to_string()))
        );
    }

    #[test]
    fn test_malformed_addresses() {
        let id = KeyPair::generate().node_id();
        assert!(matches!(
            PeerAddress::from_dial_string("10.0.0.1:8001"),
            Err(AddressError::Malformed(_))
        ));
        assert!(matches!(
            PeerAddress::from_dial_string(&format!("/dns/host/tcp/1/ipfs/{}", id)),
            Err(AddressError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            PeerAddress::from_dial_string(&format!("/ip4/1.2.3.4/udp/1/ipfs/{}", id)),
            Err(AddressError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            PeerAddress::from_dial_string(&format!("/ip4/300.0.0.1/tcp/1/ipfs/{}", id)),
            Err(AddressError::Malformed(_))
        ));
        assert!(matches!(
            PeerAddress::from_dial_string(&format!("/ip4/1.2.3.4/tcp/70000/ipfs/{}", id)),
            Err(AddressError::Malformed(_))
        ));
        assert!(matches!(
            PeerAddress::from_dial_string("/ip4/1.2.3.4/tcp/1/ipfs/0OIl"),
            Err(AddressError::Malformed(_))
        ));
        assert!(matches!(
            PeerAddress::from_dial_string(&format!("/ip4/1.2.3.4/tcp/1/ipfs/{}/tcp/2", id)),
            Err(AddressError::Malformed(_))
        ));
    }

    #[test]
    fn test_libp2p_form_matches_dial_string() {
        let id = KeyPair::generate().node_id();
        let addr: Multiaddr = format!("/ip4/10.0.0.1/tcp/8001/ipfs/{}", id).parse().unwrap();

        let libp2p_text = addr.as_libp2p().to_string();
        assert_eq!(libp2p_text, format!("/ip4/10.0.0.1/tcp/8001/p2p/{}", id));
        assert_eq!(addr, libp2p_text.parse().unwrap());
    }

    #[test]
    fn test_equality_by_id_only() {
        let id = KeyPair::generate().node_id();
        let a = PeerAddress::simple(id.clone(), "127.0.0.1:1000");
        let b = PeerAddress::from_multiaddr(Multiaddr::new("10.1.1.1:2000".parse().unwrap(), id));

        assert_eq!(a, b);
        assert!(a.as_multiaddr().is_none());
        assert!(b.as_multiaddr().is_some());
        assert_eq!(a.socket_addr(), Some("127.0.0.1:1000".parse().unwrap()));
    }
}
