//! Record to peer conversion
//!
//! Picks the dialable TCP endpoint of a node record. IPv4 wins when both
//! families are complete. An IPv6 address without its own `tcp6` port
//! borrows the IPv4 `tcp` port.

use crate::discovery::record::NodeRecord;
use crate::network::identity::{IdentityError, NodeId};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A dial-ready peer derived from a node record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryPeer {
    public_key: Vec<u8>,
    node_id: NodeId,
    address: SocketAddr,
}

impl DiscoveryPeer {
    /// Fails if the key is not a compressed secp256k1 public key
    pub fn new(public_key: Vec<u8>, address: SocketAddr) -> Result<Self, IdentityError> {
        let node_id = NodeId::from_public_key(&public_key)?;
        Ok(Self {
            public_key,
            node_id,
            address,
        })
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

impl fmt::Display for DiscoveryPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id().short(), self.address)
    }
}

/// Convert a record into a peer, or `None` if it cannot be dialed over TCP
///
/// Records signed with a scheme other than secp256k1 have no identity the
/// transport can check and are skipped too.
pub fn convert_to_discovery_peer(record: &NodeRecord) -> Option<DiscoveryPeer> {
    let public_key = record.public_key()?;
    let address = tcp_address(record)?;
    DiscoveryPeer::new(public_key, address).ok()
}

fn tcp_address(record: &NodeRecord) -> Option<SocketAddr> {
    if let (Some(ip), Some(port)) = (record.ipv4(), record.tcp()) {
        return Some(SocketAddr::new(IpAddr::V4(ip), port));
    }
    let ip6 = record.ipv6()?;
    let port = record.tcp6().or_else(|| record.tcp())?;
    Some(SocketAddr::new(IpAddr::V6(ip6), port))
}
