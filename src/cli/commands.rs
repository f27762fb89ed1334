//! CLI commands for the p2p node
//!
//! Implements all command handlers for the CLI interface.

use crate::config::P2pConfig;
use crate::crypto::KeyPair;
use crate::discovery::{convert_to_discovery_peer, NodeRecord, NodeRecordBuilder};
use crate::network::{Node, PeerEvent};
use std::net::IpAddr;
use std::path::Path;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Load the config file if it exists, defaults otherwise
pub fn load_config(path: &Path) -> CliResult<P2pConfig> {
    if path.exists() {
        Ok(P2pConfig::load(path)?)
    } else {
        log::debug!("No config at {:?}, using defaults", path);
        Ok(P2pConfig::default())
    }
}

/// Write a default config with a freshly generated node key
pub fn cmd_init_config(path: &Path, force: bool) -> CliResult<()> {
    if path.exists() && !force {
        println!("⚠️  Config already exists at {:?}", path);
        println!("   Use --force to overwrite it (this replaces the node key)");
        return Ok(());
    }

    let keypair = KeyPair::generate();
    let config = P2pConfig {
        private_key: Some(keypair.private_key_hex()),
        ..Default::default()
    };
    config.save(path)?;

    println!("✅ Config written to {:?}", path);
    println!("   🆔 Node ID: {}", keypair.node_id());
    println!("   🔌 Listen: {}", config.listen_addr()?);
    Ok(())
}

/// Print the node identity
pub fn cmd_id(config: &P2pConfig) -> CliResult<()> {
    let keypair = require_key(config)?;
    println!("🆔 Node ID: {}", keypair.node_id());
    println!("   🔑 Public Key: {}", keypair.public_key_hex());
    Ok(())
}

/// Print the signed local record for the configured listen address
pub fn cmd_record(config: &P2pConfig) -> CliResult<()> {
    let keypair = require_key(config)?;
    let record = local_record(&keypair, config.listen_ip()?, config.listen_port)?;
    println!("{}", record.to_text());
    Ok(())
}

/// Decode a record text and show where it can be dialed
pub fn cmd_record_decode(text: &str) -> CliResult<()> {
    let record = NodeRecord::from_text(text)?;

    println!("📇 Node record (seq {})", record.seq());
    match record.node_id() {
        Some(id) => println!("   🆔 Node ID: {}", id),
        None => println!("   🆔 Node ID: (no secp256k1 key)"),
    }
    println!("   ✍️  Signature valid: {}", record.verify());
    for (key, value) in record.fields() {
        println!("   {} = {}", key, hex::encode(value));
    }
    match convert_to_discovery_peer(&record) {
        Some(peer) => println!("   📍 Dialable at {}", peer.address()),
        None => println!("   📍 Not dialable (no usable ip/tcp pair)"),
    }
    Ok(())
}

fn local_record(keypair: &KeyPair, ip: IpAddr, port: u16) -> CliResult<NodeRecord> {
    Ok(NodeRecordBuilder::new().endpoint(ip, port).sign(keypair)?)
}

fn require_key(config: &P2pConfig) -> CliResult<KeyPair> {
    if config.private_key.is_none() {
        return Err("config has no private_key; run init-config first".into());
    }
    Ok(config.keypair()?)
}

/// Run a node until Ctrl+C
pub async fn cmd_start(config: P2pConfig) -> CliResult<()> {
    if config.private_key.is_none() {
        log::warn!("No private_key configured, using an ephemeral identity");
    }

    let (node, mut inbound) = Node::new(config)?;
    let addr = node.start().await?;
    let mut events = node.subscribe();

    println!("🌐 P2P node {} listening on {}", node.local_id(), addr);
    if let Some(local) = node.local_address() {
        println!("   Dial string: {}", local);
    }
    if let Some(record) = node.local_record_export() {
        println!("   Record: {}", record);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("\n📴 Shutting down node...");
                break;
            }
            Some(msg) = inbound.recv() => {
                log::info!(
                    "{} ({} bytes) from {}",
                    msg.message.type_name(),
                    msg.message.payload.len(),
                    msg.from.short()
                );
            }
            Ok(event) = events.recv() => match event {
                PeerEvent::Connected(info) => {
                    println!("🤝 Connected to {} at {}", info.id, info.addr);
                }
                PeerEvent::Disconnected(id) => {
                    println!("👋 Disconnected from {}", id);
                }
            },
        }
    }

    let status = node.status().await;
    node.shutdown().await?;
    println!(
        "✅ Node stopped ({} peers, {} known addresses)",
        status.peer_count, status.known_peers
    );
    Ok(())
}
