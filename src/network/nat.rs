//! UPnP NAT traversal
//!
//! Provides:
//! - Gateway discovery and external IP lookup
//! - Port forwards that are tracked and released on stop
//! - Lease renewal for every live forward
//!
//! Gateway calls are blocking, so they run on the blocking pool. The
//! gateway itself sits behind [`PortMapper`] and can be swapped out.

use parking_lot::Mutex;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Port mapping lease duration (1 hour)
pub const PORT_MAPPING_LEASE: u32 = 3600;

/// How often live forwards are renewed (50 minutes)
pub const RENEWAL_INTERVAL: Duration = Duration::from_secs(50 * 60);

/// Time allowed for releasing forwards on stop
const RELEASE_TIMEOUT: Duration = Duration::from_secs(3);

/// Description attached to every mapping
const MAPPING_DESCRIPTION: &str = "chain-p2p";

#[derive(Error, Debug)]
pub enum NatError {
    #[error("UPnP gateway not found: {0}")]
    GatewayNotFound(String),
    #[error("Failed to get external IP: {0}")]
    ExternalIp(String),
    #[error("Failed to add port mapping: {0}")]
    AddMapping(String),
    #[error("Failed to remove port mapping: {0}")]
    RemoveMapping(String),
    #[error("NAT manager is not running")]
    NotRunning,
    #[error("Cannot map internal port zero")]
    ZeroPort,
    #[error("Blocking task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatProtocol {
    Tcp,
    Udp,
}

impl From<NatProtocol> for igd_next::PortMappingProtocol {
    fn from(protocol: NatProtocol) -> Self {
        match protocol {
            NatProtocol::Tcp => igd_next::PortMappingProtocol::TCP,
            NatProtocol::Udp => igd_next::PortMappingProtocol::UDP,
        }
    }
}

impl fmt::Display for NatProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatProtocol::Tcp => f.write_str("TCP"),
            NatProtocol::Udp => f.write_str("UDP"),
        }
    }
}

/// A forward from `external_port` on the gateway to `local_addr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: NatProtocol,
    pub external_port: u16,
    pub local_addr: SocketAddr,
}

/// Blocking access to a gateway's port mapping service
pub trait PortMapper: Send + Sync + 'static {
    fn external_ip(&self) -> Result<IpAddr, NatError>;

    fn add_port(&self, mapping: &PortMapping, lease_secs: u32) -> Result<(), NatError>;

    fn remove_port(&self, mapping: &PortMapping) -> Result<(), NatError>;
}

/// An Internet Gateway Device found on the local network
pub struct IgdPortMapper {
    gateway: igd_next::Gateway,
}

impl IgdPortMapper {
    /// Search the local network for a gateway; blocks
    pub fn search() -> Result<Self, NatError> {
        let gateway = igd_next::search_gateway(Default::default())
            .map_err(|e| NatError::GatewayNotFound(e.to_string()))?;
        log::info!("Found UPnP gateway: {}", gateway.addr);
        Ok(Self { gateway })
    }
}

impl PortMapper for IgdPortMapper {
    fn external_ip(&self) -> Result<IpAddr, NatError> {
        self.gateway
            .get_external_ip()
            .map_err(|e| NatError::ExternalIp(e.to_string()))
    }

    fn add_port(&self, mapping: &PortMapping, lease_secs: u32) -> Result<(), NatError> {
        self.gateway
            .add_port(
                mapping.protocol.into(),
                mapping.external_port,
                mapping.local_addr,
                lease_secs,
                MAPPING_DESCRIPTION,
            )
            .map_err(|e| NatError::AddMapping(e.to_string()))
    }

    fn remove_port(&self, mapping: &PortMapping) -> Result<(), NatError> {
        self.gateway
            .remove_port(mapping.protocol.into(), mapping.external_port)
            .map_err(|e| NatError::RemoveMapping(e.to_string()))
    }
}

/// Status snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatStatus {
    pub running: bool,
    pub external_ip: Option<IpAddr>,
    pub forwarded: Vec<PortMapping>,
}

/// Tracks the port forwards this node asked a gateway for
pub struct NatManager {
    mapper: Arc<dyn PortMapper>,
    local_ip: Ipv4Addr,
    running: AtomicBool,
    external_ip: Mutex<Option<IpAddr>>,
    forwarded: Mutex<Vec<PortMapping>>,
}

impl NatManager {
    pub fn new(mapper: Arc<dyn PortMapper>, local_ip: Ipv4Addr) -> Self {
        Self {
            mapper,
            local_ip,
            running: AtomicBool::new(false),
            external_ip: Mutex::new(None),
            forwarded: Mutex::new(Vec::new()),
        }
    }

    /// Find a gateway on the local network
    pub async fn discover(local_ip: Ipv4Addr) -> Result<Self, NatError> {
        log::info!("Searching for UPnP gateway...");
        let mapper = tokio::task::spawn_blocking(IgdPortMapper::search)
            .await
            .map_err(|e| NatError::Task(e.to_string()))??;
        Ok(Self::new(Arc::new(mapper), local_ip))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn external_ip(&self) -> Option<IpAddr> {
        *self.external_ip.lock()
    }

    pub fn forwarded_ports(&self) -> Vec<PortMapping> {
        self.forwarded.lock().clone()
    }

    pub fn status(&self) -> NatStatus {
        NatStatus {
            running: self.is_running(),
            external_ip: self.external_ip(),
            forwarded: self.forwarded_ports(),
        }
    }

    /// Mark running and look up the external IP; lookup failures are logged
    pub async fn start(&self) {
        log::info!("Starting UPnP service");
        self.running.store(true, Ordering::SeqCst);

        let mapper = self.mapper.clone();
        match blocking(move || mapper.external_ip()).await {
            Ok(ip) => {
                log::info!("External IP: {}", ip);
                *self.external_ip.lock() = Some(ip);
            }
            Err(e) => log::warn!("Failed to start UPnP service: {}", e),
        }
    }

    /// Forward `port` on the gateway to the same port on this host
    pub async fn request_port_forward(
        &self,
        port: u16,
        protocol: NatProtocol,
    ) -> Result<PortMapping, NatError> {
        if !self.is_running() {
            return Err(NatError::NotRunning);
        }
        if port == 0 {
            return Err(NatError::ZeroPort);
        }

        let mapping = PortMapping {
            protocol,
            external_port: port,
            local_addr: SocketAddr::V4(SocketAddrV4::new(self.local_ip, port)),
        };
        let mapper = self.mapper.clone();
        blocking(move || mapper.add_port(&mapping, PORT_MAPPING_LEASE)).await?;

        log::info!("Added UPnP port mapping: {} {} -> {}", protocol, port, mapping.local_addr);
        self.forwarded.lock().push(mapping);
        Ok(mapping)
    }

    /// Renew every live forward; returns how many succeeded
    pub async fn renew_all(&self) -> usize {
        let mut renewed = 0;
        for mapping in self.forwarded_ports() {
            let mapper = self.mapper.clone();
            match blocking(move || mapper.add_port(&mapping, PORT_MAPPING_LEASE)).await {
                Ok(()) => renewed += 1,
                Err(e) => log::warn!("Failed to renew UPnP port mapping: {}", e),
            }
        }
        log::debug!("Renewed {} UPnP port mappings", renewed);
        renewed
    }

    /// Release every forward, giving up after a few seconds
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mappings: Vec<PortMapping> = self.forwarded.lock().drain(..).collect();
        if mappings.is_empty() {
            log::debug!("No UPnP port mappings to release");
            return;
        }
        log::debug!("Releasing {} UPnP port mappings", mappings.len());

        let releases = mappings.into_iter().map(|mapping| {
            let mapper = self.mapper.clone();
            async move {
                let result = blocking(move || mapper.remove_port(&mapping)).await;
                (mapping, result)
            }
        });
        match tokio::time::timeout(RELEASE_TIMEOUT, futures::future::join_all(releases)).await {
            Ok(results) => {
                for (mapping, result) in results {
                    match result {
                        Ok(()) => log::info!("Removed UPnP port mapping for port {}", mapping.external_port),
                        Err(e) => log::debug!("Failed to release port forward: {}", e),
                    }
                }
            }
            Err(_) => log::debug!("Timed out releasing UPnP port mappings"),
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, NatError>
where
    F: FnOnce() -> Result<T, NatError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NatError::Task(e.to_string()))?
}

/// Local IPv4 address used to reach the internet
pub fn local_ipv4() -> Option<Ipv4Addr> {
    // Connecting a UDP socket only picks a route; nothing is sent
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;

    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}
