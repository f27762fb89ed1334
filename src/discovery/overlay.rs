//! Overlay protocol engine seam
//!
//! The discovery service drives an [`Overlay`]: the component that exchanges
//! node records with other nodes and tracks their liveness. [`StaticOverlay`]
//! keeps a known-node table seeded from bootnode records and fed by the node
//! itself; it never speaks UDP.

use crate::crypto::KeyPair;
use crate::discovery::record::{NodeRecord, NodeRecordBuilder};
use crate::discovery::DiscoveryError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Liveness of a known node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Answered recently
    Active,
    /// Known but not yet contacted
    Unknown,
    /// Stopped answering
    Disconnected,
}

/// Snapshot entry of the known-node table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownNode {
    pub record: NodeRecord,
    pub status: NodeStatus,
}

#[async_trait]
pub trait Overlay: Send + Sync {
    async fn start(&self) -> Result<(), DiscoveryError>;

    async fn stop(&self) -> Result<(), DiscoveryError>;

    /// Run one lookup round and return the records it surfaced
    async fn search_for_new_peers(&self) -> Result<Vec<NodeRecord>, DiscoveryError>;

    /// Point-in-time copy of the known-node table
    fn known_nodes(&self) -> Vec<KnownNode>;

    fn local_node_record(&self) -> NodeRecord;
}

/// Known-node table seeded from bootnode records
pub struct StaticOverlay {
    local_record: NodeRecord,
    bootnodes: Vec<NodeRecord>,
    /// Keyed by compressed public key
    table: RwLock<HashMap<Vec<u8>, KnownNode>>,
    running: AtomicBool,
}

impl StaticOverlay {
    pub fn new(local_record: NodeRecord, bootnodes: Vec<NodeRecord>) -> Self {
        Self {
            local_record,
            bootnodes,
            table: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Sign a local record for `ip:port` and parse the bootnode record texts
    pub fn create(
        keypair: &KeyPair,
        ip: IpAddr,
        port: u16,
        bootnodes: &[String],
    ) -> Result<Self, DiscoveryError> {
        let local_record = NodeRecordBuilder::new().endpoint(ip, port).sign(keypair)?;

        let bootnodes = bootnodes
            .iter()
            .map(|text| NodeRecord::from_text(text))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(local_record, bootnodes))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Add or replace a node; records with an older sequence number are ignored
    pub fn insert(&self, record: NodeRecord, status: NodeStatus) -> bool {
        let Some(key) = record.public_key() else {
            return false;
        };
        if self.local_record.public_key().as_ref() == Some(&key) {
            return false;
        }

        let mut table = self.table.write();
        if let Some(existing) = table.get(&key) {
            if existing.record.seq() > record.seq() {
                return false;
            }
        }
        table.insert(key, KnownNode { record, status });
        true
    }

    pub fn set_status(&self, public_key: &[u8], status: NodeStatus) -> bool {
        match self.table.write().get_mut(public_key) {
            Some(node) => {
                node.status = status;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, public_key: &[u8]) -> Option<KnownNode> {
        self.table.write().remove(public_key)
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    fn seed_bootnodes(&self) -> usize {
        let mut added = 0;
        for record in &self.bootnodes {
            let key = record.public_key().unwrap_or_default();
            if self.table.read().contains_key(&key) {
                continue;
            }
            if self.insert(record.clone(), NodeStatus::Active) {
                added += 1;
            }
        }
        added
    }
}

#[async_trait]
impl Overlay for StaticOverlay {
    async fn start(&self) -> Result<(), DiscoveryError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let added = self.seed_bootnodes();
        log::info!("Overlay started with {} bootnodes", added);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DiscoveryError> {
        self.running.store(false, Ordering::SeqCst);
        self.table.write().clear();
        log::info!("Overlay stopped");
        Ok(())
    }

    async fn search_for_new_peers(&self) -> Result<Vec<NodeRecord>, DiscoveryError> {
        if !self.is_running() {
            return Err(DiscoveryError::NotStarted);
        }
        let added = self.seed_bootnodes();
        if added > 0 {
            log::debug!("Re-seeded {} bootnodes", added);
        }
        Ok(self
            .table
            .read()
            .values()
            .map(|node| node.record.clone())
            .collect())
    }

    fn known_nodes(&self) -> Vec<KnownNode> {
        self.table.read().values().cloned().collect()
    }

    fn local_node_record(&self) -> NodeRecord {
        self.local_record.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kp: &KeyPair, port: u16) -> NodeRecord {
        NodeRecordBuilder::new()
            .ip("127.0.0.1".parse().unwrap())
            .tcp(port)
            .sign(kp)
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_seeds_bootnodes_except_self() {
        let local = KeyPair::generate();
        let boot = KeyPair::generate();
        let bootnodes = vec![record(&boot, 9000).to_text(), record(&local, 9001).to_text()];

        let overlay =
            StaticOverlay::create(&local, "127.0.0.1".parse().unwrap(), 9001, &bootnodes).unwrap();
        assert!(overlay.is_empty());

        overlay.start().await.unwrap();
        assert_eq!(overlay.len(), 1);
        assert_eq!(overlay.known_nodes()[0].status, NodeStatus::Active);
        assert_eq!(overlay.local_node_record().tcp(), Some(9001));
    }

    #[tokio::test]
    async fn test_search_requires_running() {
        let overlay = StaticOverlay::new(record(&KeyPair::generate(), 1), vec![]);
        assert!(matches!(
            overlay.search_for_new_peers().await,
            Err(DiscoveryError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_table_updates() {
        let overlay = StaticOverlay::new(record(&KeyPair::generate(), 1), vec![]);
        overlay.start().await.unwrap();

        let kp = KeyPair::generate();
        let newer = NodeRecordBuilder::new().seq(5).tcp(2).sign(&kp).unwrap();
        let older = NodeRecordBuilder::new().seq(4).tcp(3).sign(&kp).unwrap();

        assert!(overlay.insert(newer.clone(), NodeStatus::Unknown));
        assert!(!overlay.insert(older, NodeStatus::Active));
        assert_eq!(overlay.known_nodes()[0].record, newer);

        let key = kp.public_key_bytes();
        assert!(overlay.set_status(&key, NodeStatus::Disconnected));
        assert_eq!(overlay.known_nodes()[0].status, NodeStatus::Disconnected);
        assert_eq!(overlay.search_for_new_peers().await.unwrap().len(), 1);

        assert!(overlay.remove(&key).is_some());
        assert!(overlay.is_empty());
    }

    #[tokio::test]
    async fn test_stop_clears_table() {
        let boot = KeyPair::generate();
        let overlay = StaticOverlay::new(record(&KeyPair::generate(), 1), vec![record(&boot, 2)]);

        overlay.start().await.unwrap();
        assert_eq!(overlay.len(), 1);
        overlay.stop().await.unwrap();
        assert!(overlay.is_empty());
        assert!(!overlay.is_running());
    }

    #[test]
    fn test_invalid_bootnode_text() {
        let kp = KeyPair::generate();
        let result = StaticOverlay::create(&kp, "127.0.0.1".parse().unwrap(), 1, &["enr:@@".into()]);
        assert!(matches!(result, Err(DiscoveryError::Record(_))));
    }
}
