//! Node configuration
//!
//! Stored as JSON. Every field has a default, so a config file only needs
//! the values it changes.

use crate::crypto::{KeyError, KeyPair};
use crate::network::limit::DEFAULT_MAX_INBOUND_PER_IP;
use crate::network::queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Protocol name both ends must agree on
pub const DEFAULT_PROTOCOL: &str = "chain-p2p/1";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Address to bind and advertise
    pub listen_ip: String,
    pub listen_port: u16,
    /// Hex-encoded node key; a fresh key is generated when absent
    pub private_key: Option<String>,
    /// Bootnode records in `enr:` text form
    pub bootnodes: Vec<String>,
    /// Dial strings connected at startup
    pub static_peers: Vec<String>,
    /// Bootnodes answer lookups but never dial discovered peers
    pub is_bootnode: bool,
    pub discovery_enabled: bool,
    pub discovery_interval_secs: u64,
    pub max_peers: usize,
    /// Live inbound connections accepted from one remote IP
    pub max_inbound_per_ip: usize,
    /// Ask a UPnP gateway to forward the listen port
    pub upnp_enabled: bool,
    /// Pending outbound messages tolerated per channel
    pub max_queue_size: usize,
    pub send_period_ms: u64,
    pub flush_batch_size: usize,
    pub handshake_timeout_secs: u64,
    pub protocol: String,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 30303,
            private_key: None,
            bootnodes: Vec::new(),
            static_peers: Vec::new(),
            is_bootnode: false,
            discovery_enabled: true,
            discovery_interval_secs: 30,
            max_peers: 25,
            max_inbound_per_ip: DEFAULT_MAX_INBOUND_PER_IP,
            upnp_enabled: false,
            max_queue_size: 1000,
            send_period_ms: 10,
            flush_batch_size: 5,
            handshake_timeout_secs: 10,
            protocol: DEFAULT_PROTOCOL.to_string(),
        }
    }
}

impl P2pConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_ip()?;
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be positive".into()));
        }
        if self.max_inbound_per_ip == 0 {
            return Err(ConfigError::Invalid(
                "max_inbound_per_ip must be positive".into(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::Invalid("max_queue_size must be positive".into()));
        }
        if self.send_period_ms == 0 {
            return Err(ConfigError::Invalid("send_period_ms must be positive".into()));
        }
        if self.flush_batch_size == 0 {
            return Err(ConfigError::Invalid("flush_batch_size must be positive".into()));
        }
        if self.discovery_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "discovery_interval_secs must be positive".into(),
            ));
        }
        if self.protocol.trim().is_empty() {
            return Err(ConfigError::Invalid("protocol must not be empty".into()));
        }
        if let Some(key) = &self.private_key {
            KeyPair::from_private_key_hex(key)?;
        }
        Ok(())
    }

    pub fn listen_ip(&self) -> Result<IpAddr, ConfigError> {
        self.listen_ip
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad listen_ip: {}", self.listen_ip)))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.listen_ip()?, self.listen_port))
    }

    /// The configured node key, or a freshly generated one
    pub fn keypair(&self) -> Result<KeyPair, ConfigError> {
        match &self.private_key {
            Some(key) => Ok(KeyPair::from_private_key_hex(key)?),
            None => Ok(KeyPair::generate()),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            send_period: Duration::from_millis(self.send_period_ms),
            batch_size: self.flush_batch_size,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }
}
