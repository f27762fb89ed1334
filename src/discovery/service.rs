//! Discovery service
//!
//! Lifecycle-managed wrapper around an [`Overlay`]. The rest of the node
//! only sees the [`DiscoveryService`] trait, so discovery can be switched off
//! by plugging in [`NoOpDiscoveryService`].

use crate::crypto::KeyPair;
use crate::discovery::converter::{convert_to_discovery_peer, DiscoveryPeer};
use crate::discovery::lifecycle::{ServiceLifecycle, ServiceState, StartDecision, StopDecision};
use crate::discovery::overlay::{NodeStatus, Overlay, StaticOverlay};
use crate::discovery::record::NodeRecord;
use crate::discovery::DiscoveryError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait DiscoveryService: Send + Sync {
    /// Idempotent; concurrent callers share one start
    async fn start(&self) -> Result<(), DiscoveryError>;

    /// Idempotent; cancels outstanding searches
    async fn stop(&self) -> Result<(), DiscoveryError>;

    /// Run one discovery round
    async fn search_for_peers(&self) -> Result<Vec<NodeRecord>, DiscoveryError>;

    /// Dialable peers among the active known nodes, as of this call
    fn stream_known_peers(&self) -> Vec<DiscoveryPeer>;

    /// Canonical text of the local node record
    fn local_record_export(&self) -> Option<String>;

    fn state(&self) -> ServiceState;
}

/// Discovery backed by an overlay protocol engine
pub struct OverlayDiscoveryService<O: Overlay> {
    overlay: Arc<O>,
    lifecycle: ServiceLifecycle,
    /// Cancelled on stop; replaced on every successful start claim
    searches: Mutex<CancellationToken>,
}

impl<O: Overlay> OverlayDiscoveryService<O> {
    pub fn new(overlay: Arc<O>) -> Self {
        Self {
            overlay,
            lifecycle: ServiceLifecycle::new(),
            searches: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn overlay(&self) -> &Arc<O> {
        &self.overlay
    }
}

impl OverlayDiscoveryService<StaticOverlay> {
    /// Build a service around a [`StaticOverlay`] for the given bind address
    pub fn create(
        keypair: &KeyPair,
        ip: IpAddr,
        port: u16,
        bootnodes: &[String],
    ) -> Result<Self, DiscoveryError> {
        let overlay = StaticOverlay::create(keypair, ip, port, bootnodes)?;
        Ok(Self::new(Arc::new(overlay)))
    }
}

#[async_trait]
impl<O: Overlay + 'static> DiscoveryService for OverlayDiscoveryService<O> {
    async fn start(&self) -> Result<(), DiscoveryError> {
        match self.lifecycle.begin_start().await {
            StartDecision::AlreadyStarted => Ok(()),
            StartDecision::Failed(error) => Err(DiscoveryError::StartFailed(error)),
            StartDecision::Run(pending) => {
                log::info!("Starting discovery");
                *self.searches.lock() = CancellationToken::new();
                // Dropping this future before the overlay answers settles the
                // start as cancelled through `pending`
                match self.overlay.start().await {
                    Ok(()) => {
                        pending.finish(Ok(()));
                        log::info!("Discovery started");
                        Ok(())
                    }
                    Err(e) => {
                        log::warn!("Discovery failed to start: {}", e);
                        pending.finish(Err(e.to_string()));
                        Err(e)
                    }
                }
            }
        }
    }

    async fn stop(&self) -> Result<(), DiscoveryError> {
        match self.lifecycle.begin_stop().await {
            StopDecision::AlreadyStopped => Ok(()),
            StopDecision::Run(pending) => {
                log::info!("Stopping discovery");
                self.searches.lock().cancel();
                let result = self.overlay.stop().await;
                pending.finish();
                if let Err(e) = &result {
                    log::warn!("Discovery stopped with error: {}", e);
                }
                result
            }
        }
    }

    async fn search_for_peers(&self) -> Result<Vec<NodeRecord>, DiscoveryError> {
        if !self.lifecycle.is_started() {
            return Err(DiscoveryError::NotStarted);
        }
        let token = self.searches.lock().clone();
        tokio::select! {
            _ = token.cancelled() => Err(DiscoveryError::Cancelled),
            result = self.overlay.search_for_new_peers() => {
                if let Ok(records) = &result {
                    log::debug!("Search round surfaced {} records", records.len());
                }
                result
            }
        }
    }

    fn stream_known_peers(&self) -> Vec<DiscoveryPeer> {
        self.overlay
            .known_nodes()
            .into_iter()
            .filter(|node| node.status == NodeStatus::Active)
            .filter_map(|node| convert_to_discovery_peer(&node.record))
            .collect()
    }

    fn local_record_export(&self) -> Option<String> {
        Some(self.overlay.local_node_record().to_text())
    }

    fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }
}

/// Stand-in used when discovery is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpDiscoveryService;

#[async_trait]
impl DiscoveryService for NoOpDiscoveryService {
    async fn start(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn search_for_peers(&self) -> Result<Vec<NodeRecord>, DiscoveryError> {
        Ok(Vec::new())
    }

    fn stream_known_peers(&self) -> Vec<DiscoveryPeer> {
        Vec::new()
    }

    fn local_record_export(&self) -> Option<String> {
        None
    }

    fn state(&self) -> ServiceState {
        ServiceState::Stopped
    }
}
