mod connection;
mod framing;
mod node;
mod protocol;
mod stream;

pub use connection::Connection;
pub use framing::{FrameReader, FrameWriter, DEFAULT_MAX_FRAME_LEN};
pub use node::{HandlerError, MessageHandler, Node, NodeState};
pub use protocol::{decode_request, decode_response, Request, Response};
pub use stream::NodeStream;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use security::TransportSecurity;

/// Immutable identity of a service node in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub role: NodeRole,
    pub host: String,
    pub port: u16,
}

impl NodeIdentity {
    pub fn new(node_id: impl Into<String>, role: NodeRole, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            host: host.into(),
            port,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Collector,
    Processor,
    Storage,
    Notifier,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeRole::Collector => "collector",
            NodeRole::Processor => "processor",
            NodeRole::Storage => "storage",
            NodeRole::Notifier => "notifier",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub identity: NodeIdentity,
    pub security: TransportSecurity,
    /// Upper bound on a single frame; a larger length prefix is a framing
    /// error, which bounds memory per connection.
    pub max_frame_len: usize,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Per-attempt timeout for client-role request/response exchanges.
    pub request_timeout: Duration,
    /// Attempts per logical request, each on a fresh connection, before
    /// the caller must fail over.
    pub max_request_retries: u32,
    /// Bounded wait per connection during shutdown.
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn new(identity: NodeIdentity, security: TransportSecurity) -> Self {
        Self {
            identity,
            security,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            handshake_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            max_request_retries: 3,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("end of stream")]
    EndOfStream,

    #[error("framing error: {0}")]
    Framing(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("security error: {0}")]
    Security(#[from] security::SecurityError),

    #[error("bind failed: {0}")]
    Bind(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("request failed after {0} attempts: {1}")]
    RetriesExhausted(u32, String),
}
