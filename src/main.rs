//! p2p-node CLI Application
//!
//! Runs a discovery-enabled peer node and inspects node identities and records.

use chain_p2p::cli;
use chain_p2p::P2pConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "p2p-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer discovery and flow-controlled peer channels", long_about = None)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "p2p.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the P2P node
    Start {
        /// Address to listen on
        #[arg(long)]
        ip: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bootnode records (comma-separated enr: texts)
        #[arg(long)]
        bootnodes: Option<String>,

        /// Peers to dial at startup (comma-separated dial strings)
        #[arg(long)]
        peers: Option<String>,

        /// Answer discovery but never dial discovered peers
        #[arg(long)]
        bootnode: bool,

        /// Disable peer discovery
        #[arg(long)]
        no_discovery: bool,

        /// Forward the listen port through a UPnP gateway
        #[arg(long)]
        upnp: bool,
    },

    /// Print the local node record, or decode one
    Record {
        /// Record text to decode instead
        #[arg(short, long)]
        decode: Option<String>,
    },

    /// Print the node ID
    Id,

    /// Write a default config with a new node key
    InitConfig {
        /// Overwrite an existing config
        #[arg(short, long)]
        force: bool,
    },
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig { force } => cli::cmd_init_config(&cli.config, force),

        Commands::Id => cli::cmd_id(&cli::load_config(&cli.config)?),

        Commands::Record { decode } => match decode {
            Some(text) => cli::cmd_record_decode(&text),
            None => cli::cmd_record(&cli::load_config(&cli.config)?),
        },

        Commands::Start {
            ip,
            port,
            bootnodes,
            peers,
            bootnode,
            no_discovery,
            upnp,
        } => {
            let mut config = cli::load_config(&cli.config)?;
            apply_overrides(
                &mut config,
                ip,
                port,
                bootnodes.as_deref(),
                peers.as_deref(),
                bootnode,
                no_discovery,
            );
            if upnp {
                config.upnp_enabled = true;
            }
            config.validate()?;

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_start(config))
        }
    }
}

fn apply_overrides(
    config: &mut P2pConfig,
    ip: Option<String>,
    port: Option<u16>,
    bootnodes: Option<&str>,
    peers: Option<&str>,
    bootnode: bool,
    no_discovery: bool,
) {
    if let Some(ip) = ip {
        config.listen_ip = ip;
    }
    if let Some(port) = port {
        config.listen_port = port;
    }
    if let Some(bootnodes) = bootnodes {
        config.bootnodes = split_list(bootnodes);
    }
    if let Some(peers) = peers {
        config.static_peers.extend(split_list(peers));
    }
    if bootnode {
        config.is_bootnode = true;
    }
    if no_discovery {
        config.discovery_enabled = false;
    }
}
