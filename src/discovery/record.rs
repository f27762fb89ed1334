//! Node records
//!
//! A signed, versioned key/value document advertising a node's public key
//! and reachable endpoints. Encoding, signing and signature checks are done
//! by the `enr` crate; this module exposes the fields discovery needs.

use crate::crypto::{KeyError, KeyPair};
use crate::network::identity::NodeId;
use enr::{CombinedKey, CombinedPublicKey, Enr, EnrPublicKey};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

/// Text form prefix
pub const TEXT_PREFIX: &str = "enr:";

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Invalid record: {0}")]
    Invalid(String),
    #[error("Cannot build record: {0}")]
    Build(String),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

/// A decoded node record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    inner: Enr<CombinedKey>,
}

impl NodeRecord {
    pub fn as_enr(&self) -> &Enr<CombinedKey> {
        &self.inner
    }

    pub fn seq(&self) -> u64 {
        self.inner.seq()
    }

    pub fn signature(&self) -> &[u8] {
        self.inner.signature()
    }

    /// Every field with its raw RLP value, in key order
    pub fn fields(&self) -> Vec<(String, Vec<u8>)> {
        self.inner
            .iter()
            .map(|(key, value)| (String::from_utf8_lossy(key).into_owned(), value.to_vec()))
            .collect()
    }

    /// Compressed secp256k1 public key, `None` for other identity schemes
    pub fn public_key(&self) -> Option<Vec<u8>> {
        match self.inner.public_key() {
            key @ CombinedPublicKey::Secp256k1(_) => Some(key.encode()),
            _ => None,
        }
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.inner.ip4()
    }

    pub fn ipv6(&self) -> Option<Ipv6Addr> {
        self.inner.ip6()
    }

    pub fn tcp(&self) -> Option<u16> {
        self.inner.tcp4()
    }

    pub fn tcp6(&self) -> Option<u16> {
        self.inner.tcp6()
    }

    pub fn udp(&self) -> Option<u16> {
        self.inner.udp4()
    }

    pub fn udp6(&self) -> Option<u16> {
        self.inner.udp6()
    }

    /// Identity derived from the record's secp256k1 key
    pub fn node_id(&self) -> Option<NodeId> {
        NodeId::from_public_key(&self.public_key()?).ok()
    }

    /// Canonical `enr:` text form
    pub fn to_text(&self) -> String {
        let text = self.inner.to_base64();
        if text.starts_with(TEXT_PREFIX) {
            text
        } else {
            format!("{}{}", TEXT_PREFIX, text)
        }
    }

    /// Decode the text form; the `enr:` prefix is optional
    ///
    /// Records with a bad signature are rejected here.
    pub fn from_text(text: &str) -> Result<Self, RecordError> {
        let inner = text
            .trim()
            .parse::<Enr<CombinedKey>>()
            .map_err(RecordError::Invalid)?;
        Ok(Self { inner })
    }

    /// Check the signature against the record's own public key
    pub fn verify(&self) -> bool {
        self.inner.verify()
    }
}

impl From<Enr<CombinedKey>> for NodeRecord {
    fn from(inner: Enr<CombinedKey>) -> Self {
        Self { inner }
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl FromStr for NodeRecord {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_text(s)
    }
}

/// Builds and signs a local node record
#[derive(Debug, Clone)]
pub struct NodeRecordBuilder {
    seq: u64,
    ip4: Option<Ipv4Addr>,
    ip6: Option<Ipv6Addr>,
    tcp: Option<u16>,
    tcp6: Option<u16>,
    udp: Option<u16>,
    udp6: Option<u16>,
}

impl Default for NodeRecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRecordBuilder {
    pub fn new() -> Self {
        Self {
            seq: 1,
            ip4: None,
            ip6: None,
            tcp: None,
            tcp6: None,
            udp: None,
            udp6: None,
        }
    }

    pub fn seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Sets `ip` or `ip6` depending on the address family
    pub fn ip(mut self, ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => self.ip4 = Some(v4),
            IpAddr::V6(v6) => self.ip6 = Some(v6),
        }
        self
    }

    /// Sets the ip and both ports for one address family
    pub fn endpoint(self, ip: IpAddr, port: u16) -> Self {
        let builder = self.ip(ip);
        match ip {
            IpAddr::V4(_) => builder.tcp(port).udp(port),
            IpAddr::V6(_) => builder.tcp6(port).udp6(port),
        }
    }

    pub fn tcp(mut self, port: u16) -> Self {
        self.tcp = Some(port);
        self
    }

    pub fn tcp6(mut self, port: u16) -> Self {
        self.tcp6 = Some(port);
        self
    }

    pub fn udp(mut self, port: u16) -> Self {
        self.udp = Some(port);
        self
    }

    pub fn udp6(mut self, port: u16) -> Self {
        self.udp6 = Some(port);
        self
    }

    /// Sign with the node key
    pub fn sign(self, keypair: &KeyPair) -> Result<NodeRecord, RecordError> {
        self.sign_with(&keypair.to_record_key()?)
    }

    /// Sign with any record key, including non-secp256k1 schemes
    pub fn sign_with(self, key: &CombinedKey) -> Result<NodeRecord, RecordError> {
        let mut builder = Enr::builder();
        builder.seq(self.seq);
        if let Some(ip) = self.ip4 {
            builder.ip4(ip);
        }
        if let Some(ip) = self.ip6 {
            builder.ip6(ip);
        }
        if let Some(port) = self.tcp {
            builder.tcp4(port);
        }
        if let Some(port) = self.tcp6 {
            builder.tcp6(port);
        }
        if let Some(port) = self.udp {
            builder.udp4(port);
        }
        if let Some(port) = self.udp6 {
            builder.udp6(port);
        }

        let inner = builder
            .build(key)
            .map_err(|e| RecordError::Build(e.to_string()))?;
        Ok(NodeRecord { inner })
    }
}
