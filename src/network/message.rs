//! Network message types for P2P communication
//!
//! Messages carry an opaque payload tagged with a [`Command`]. Whether a
//! message expects a reply decides which outbound queue it waits in.

use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest protocol version we still talk to
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x43, 0x50, 0x32, 0x50]; // "CP2P"

/// Largest frame body accepted from the wire
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Message commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Application handshake exchanged once per connection
    Hello,
    /// Polite close with a reason
    Disconnect,
    /// Keep-alive ping
    Ping,
    /// Keep-alive pong response
    Pong,
    /// Request dial addresses of connected peers
    GetPeers,
    /// Response with peer dial addresses
    Peers,
    /// Application traffic, opaque to this layer and handed to the embedder.
    /// The code is chosen by the application.
    Application(u16),
}

impl Command {
    /// The command a peer answers this one with, if any
    pub fn answer(&self) -> Option<Command> {
        match self {
            Command::Ping => Some(Command::Pong),
            Command::GetPeers => Some(Command::Peers),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Hello => "Hello",
            Command::Disconnect => "Disconnect",
            Command::Ping => "Ping",
            Command::Pong => "Pong",
            Command::GetPeers => "GetPeers",
            Command::Peers => "Peers",
            Command::Application(_) => "Application",
        }
    }
}

/// A framed network message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub command: Command,
    pub payload: Vec<u8>,
    /// Requests wait for a correlated reply; everything else is a response
    pub expects_response: bool,
}

impl Message {
    /// Create a message, classified by whether its command has an answer
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        Self {
            command,
            payload,
            expects_response: command.answer().is_some(),
        }
    }

    /// A message that waits for a correlated reply
    pub fn request(command: Command, payload: Vec<u8>) -> Self {
        Self {
            command,
            payload,
            expects_response: true,
        }
    }

    /// A reply or fire-and-forget message
    pub fn response(command: Command, payload: Vec<u8>) -> Self {
        Self {
            command,
            payload,
            expects_response: false,
        }
    }

    pub fn ping(nonce: u64) -> Self {
        Self::new(Command::Ping, nonce.to_be_bytes().to_vec())
    }

    pub fn pong(nonce: u64) -> Self {
        Self::new(Command::Pong, nonce.to_be_bytes().to_vec())
    }

    /// Build a message with a JSON-encoded payload
    pub fn with_json<T: Serialize>(command: Command, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(command, serde_json::to_vec(value)?))
    }

    /// Decode a JSON payload
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Nonce carried by ping/pong messages
    pub fn nonce(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.payload.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        self.command.name()
    }
}

/// Handshake payload for initial connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version
    pub version: u32,
    /// Negotiated protocol name
    pub protocol: String,
    /// Sender's base58 node id
    pub node_id: String,
    /// Node's listening port (for incoming connections)
    pub listen_port: u16,
    /// Node's user agent string
    pub user_agent: String,
}

impl Hello {
    /// Create a new handshake payload
    pub fn new(protocol: &str, node_id: &str, listen_port: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            protocol: protocol.to_string(),
            node_id: node_id.to_string(),
            listen_port,
            user_agent: format!("chain-p2p/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Reasons carried by a [`Command::Disconnect`] message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    Shutdown,
    QueueOverflow,
    BadProtocol,
    TooManyPeers,
    DuplicateConnection,
}

impl DisconnectReason {
    pub fn to_message(self) -> Message {
        // serde_json cannot fail on a unit enum
        let payload = serde_json::to_vec(&self).unwrap_or_default();
        Message::response(Command::Disconnect, payload)
    }
}
