//! Node identity
//!
//! A [`NodeId`] is a libp2p [`PeerId`]: the multihash of a node's protobuf
//! encoded public key. Secp256k1 identities are inlined and render as
//! `16Uiu2...` in base58.

use libp2p::identity::{secp256k1, PublicKey};
use libp2p::PeerId;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid base58 identity: {0}")]
    InvalidBase58(String),
    #[error("Invalid identity bytes: {0}")]
    InvalidBytes(String),
    #[error("Invalid secp256k1 public key: {0}")]
    InvalidPublicKey(String),
    #[error("Empty identity")]
    Empty,
}

/// Immutable node identifier
///
/// Equality and hashing follow the peer id, so identities built from a
/// public key, from bytes, or from base58 text are interchangeable.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    peer_id: PeerId,
    base58: String,
}

impl NodeId {
    pub fn from_peer_id(peer_id: PeerId) -> Self {
        let base58 = peer_id.to_base58();
        Self { peer_id, base58 }
    }

    /// Derive the identity of a compressed secp256k1 public key
    pub fn from_public_key(public_key: &[u8]) -> Result<Self, IdentityError> {
        let key = secp256k1::PublicKey::try_from_bytes(public_key)
            .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
        Ok(Self::from_peer_id(PublicKey::from(key).to_peer_id()))
    }

    /// Parse raw multihash bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.is_empty() {
            return Err(IdentityError::Empty);
        }
        let peer_id =
            PeerId::from_bytes(bytes).map_err(|e| IdentityError::InvalidBytes(e.to_string()))?;
        Ok(Self::from_peer_id(peer_id))
    }

    pub fn from_base58(text: &str) -> Result<Self, IdentityError> {
        if text.is_empty() {
            return Err(IdentityError::Empty);
        }
        let peer_id = text
            .parse::<PeerId>()
            .map_err(|e| IdentityError::InvalidBase58(e.to_string()))?;
        Ok(Self::from_peer_id(peer_id))
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.peer_id.to_bytes()
    }

    pub fn to_base58(&self) -> &str {
        &self.base58
    }

    /// Last eight characters, for log lines
    pub fn short(&self) -> &str {
        let start = self.base58.len().saturating_sub(8);
        &self.base58[start..]
    }
}

impl From<PeerId> for NodeId {
    fn from(peer_id: PeerId) -> Self {
        Self::from_peer_id(peer_id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base58)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.base58)
    }
}

impl std::str::FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base58(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const PUB_KEY: &str = "0295a5a50f083697ff8557f3c6fe0cdf8e8ec2141d15f19a5a45571ed9c38ce181";

    fn id() -> NodeId {
        NodeId::from_public_key(&hex::decode(PUB_KEY).unwrap()).unwrap()
    }

    #[test]
    fn test_secp256k1_identity_rendering() {
        let id = id();

        assert_eq!(
            id.to_base58(),
            "16Uiu2HAm5VqDwuJVJVpsLH2wZurYkKbKyG9SHNQWXwo4te69Gb12"
        );
        assert_eq!(id.to_bytes().len(), 39);
        assert_eq!(&id.to_bytes()[..6], &[0x00, 0x25, 0x08, 0x02, 0x12, 0x21]);
    }

    #[test]
    fn test_equality_ignores_construction_path() {
        let from_key = id();
        let from_bytes = NodeId::from_bytes(&from_key.to_bytes()).unwrap();
        let from_text: NodeId = from_key.to_base58().parse().unwrap();
        let from_peer: NodeId = (*from_key.peer_id()).into();

        assert_eq!(from_key, from_bytes);
        assert_eq!(from_key, from_text);

        let mut set = HashSet::new();
        set.insert(from_key);
        set.insert(from_bytes);
        set.insert(from_text);
        set.insert(from_peer);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_rejects_invalid_public_key() {
        assert!(matches!(
            NodeId::from_public_key(&[7u8; 33]),
            Err(IdentityError::InvalidPublicKey(_))
        ));
        assert!(NodeId::from_public_key(&[]).is_err());
    }

    #[test]
    fn test_invalid_base58() {
        assert!(NodeId::from_base58("0OIl").is_err());
        assert_eq!(NodeId::from_base58(""), Err(IdentityError::Empty));
        assert_eq!(NodeId::from_bytes(&[]), Err(IdentityError::Empty));
        assert!(NodeId::from_bytes(&[0xff, 0xff]).is_err());
    }

    #[test]
    fn test_short_form() {
        assert_eq!(id().short(), "te69Gb12");
    }
}
