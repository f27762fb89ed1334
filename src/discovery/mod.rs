//! Peer discovery
//!
//! This module provides:
//! - Node records and their text codec
//! - Record to dialable peer conversion
//! - The discovery service lifecycle over a pluggable overlay

pub mod converter;
pub mod lifecycle;
pub mod overlay;
pub mod record;
pub mod service;

pub use converter::{convert_to_discovery_peer, DiscoveryPeer};
pub use lifecycle::{ServiceLifecycle, ServiceState};
pub use overlay::{KnownNode, NodeStatus, Overlay, StaticOverlay};
pub use record::{NodeRecord, NodeRecordBuilder, RecordError};
pub use service::{DiscoveryService, NoOpDiscoveryService, OverlayDiscoveryService};

use thiserror::Error;

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Discovery is not started")]
    NotStarted,
    #[error("Search cancelled by stop")]
    Cancelled,
    #[error("Discovery failed to start: {0}")]
    StartFailed(String),
    #[error("Overlay error: {0}")]
    Overlay(String),
    #[error("Record error: {0}")]
    Record(#[from] RecordError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
