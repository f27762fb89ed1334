//! Node key management
//!
//! Provides key pair generation and encoding for the secp256k1 node key.
//! The node key signs the local node record and authenticates the noise
//! handshake, so it converts into both the libp2p and the record key types.

use enr::CombinedKey;
use libp2p::identity::{self, secp256k1};
use thiserror::Error;

use crate::network::identity::NodeId;

/// Length of a compressed secp256k1 public key
pub const PUBLIC_KEY_LEN: usize = 33;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Record key error: {0}")]
    RecordKey(String),
}

/// The node's secp256k1 key pair
#[derive(Clone)]
pub struct KeyPair {
    inner: secp256k1::Keypair,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self {
            inner: secp256k1::Keypair::generate(),
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: secp256k1::SecretKey) -> Self {
        Self {
            inner: secp256k1::Keypair::from(secret_key),
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let hex_key = hex_key.trim().trim_start_matches("0x");
        let mut bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key = secp256k1::SecretKey::try_from_bytes(&mut bytes)
            .map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Get the private key as a hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.inner.secret().to_bytes())
    }

    /// Compressed public key bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.inner.public().to_bytes()
    }

    /// Get the public key as a hex string (compressed format)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Identity other nodes know us by
    pub fn node_id(&self) -> NodeId {
        let public = identity::PublicKey::from(self.inner.public().clone());
        NodeId::from_peer_id(public.to_peer_id())
    }

    /// The key as a libp2p identity, for the noise handshake
    pub fn to_identity(&self) -> identity::Keypair {
        identity::Keypair::from(self.inner.clone())
    }

    /// The key in the form node records are signed with
    pub fn to_record_key(&self) -> Result<CombinedKey, KeyError> {
        let mut secret = self.inner.secret().to_bytes();
        CombinedKey::secp256k1_from_bytes(&mut secret).map_err(|e| KeyError::RecordKey(e.to_string()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enr::{CombinedPublicKey, EnrKey, EnrPublicKey};

    #[test]
    fn test_key_pair_generation() {
        let kp = KeyPair::generate();
        assert_eq!(kp.private_key_hex().len(), 64);
        assert_eq!(kp.public_key_bytes()[0] & 0xfe, 0x02);
    }

    #[test]
    fn test_key_pair_from_hex() {
        let kp1 = KeyPair::generate();
        let private_hex = kp1.private_key_hex();

        let kp2 = KeyPair::from_private_key_hex(&format!("0x{}", private_hex)).unwrap();
        assert_eq!(kp1.public_key_hex(), kp2.public_key_hex());
        assert_eq!(kp1.node_id(), kp2.node_id());
    }

    #[test]
    fn test_invalid_private_key() {
        assert!(KeyPair::from_private_key_hex("zz").is_err());
        assert!(KeyPair::from_private_key_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn test_derived_keys_share_identity() {
        let kp = KeyPair::generate();

        let peer_id = kp.to_identity().public().to_peer_id();
        assert_eq!(&peer_id, kp.node_id().peer_id());

        let record_key = kp.to_record_key().unwrap();
        let public = record_key.public();
        assert!(matches!(public, CombinedPublicKey::Secp256k1(_)));
        assert_eq!(public.encode(), kp.public_key_bytes().to_vec());
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = KeyPair::generate();
        let printed = format!("{:?}", kp);
        assert!(!printed.contains(&kp.private_key_hex()));
    }
}
