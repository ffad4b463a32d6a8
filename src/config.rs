use std::time::Duration;

use serde::{Deserialize, Serialize};

use network::{NodeIdentity, NodeRole};
use security::TransportSecurity;

use crate::error::{Result, VitalMeshError};

/// A peer this node talks to, as named in configuration. The node id is the
/// expected identity; the handshake confirms it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub node_id: String,
    pub role: NodeRole,
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    /// Parses the CLI form `node_id:role@host:port`.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || {
            VitalMeshError::InvalidConfig(format!(
                "peer '{}' is not of the form node_id:role@host:port",
                spec
            ))
        };
        let (identity, address) = spec.split_once('@').ok_or_else(invalid)?;
        let (node_id, role) = identity.split_once(':').ok_or_else(invalid)?;
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        if node_id.is_empty() || host.is_empty() {
            return Err(invalid());
        }
        let role = match role {
            "collector" => NodeRole::Collector,
            "processor" => NodeRole::Processor,
            "storage" => NodeRole::Storage,
            "notifier" => NodeRole::Notifier,
            other => {
                return Err(VitalMeshError::InvalidConfig(format!(
                    "unknown role '{}' in peer '{}'",
                    other, spec
                )))
            }
        };
        let port = port
            .parse::<u16>()
            .map_err(|e| VitalMeshError::InvalidConfig(format!("invalid port in '{}': {}", spec, e)))?;
        Ok(Self {
            node_id: node_id.to_string(),
            role,
            host: host.to_string(),
            port,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: String,
    pub role: NodeRole,
    pub host: String,
    pub port: u16,
    pub peers: Vec<PeerEndpoint>,
    /// Peer expected to act as primary among this node's storage peers.
    pub primary_peer: Option<String>,
    /// Base64-encoded 32-byte fleet key for message envelopes.
    pub secret_key: String,
    pub transport: TransportSecurity,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub monitor_period: Duration,
    pub max_recovery_attempts: u32,
    pub recovery_cooldown: Duration,
    pub replication_factor: usize,
    pub replication_timeout: Duration,
    pub sync_interval: Duration,
}

impl Config {
    pub fn new(
        node_id: impl Into<String>,
        role: NodeRole,
        host: impl Into<String>,
        port: u16,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            host: host.into(),
            port,
            peers: Vec::new(),
            primary_peer: None,
            secret_key: secret_key.into(),
            transport: TransportSecurity::Plain,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            monitor_period: Duration::from_secs(1),
            max_recovery_attempts: 3,
            recovery_cooldown: Duration::from_secs(300),
            replication_factor: 3,
            replication_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_secs(60),
        }
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(self.node_id.clone(), self.role, self.host.clone(), self.port)
    }

    pub fn peers_with_role(&self, role: NodeRole) -> Vec<PeerEndpoint> {
        self.peers
            .iter()
            .filter(|peer| peer.role == role)
            .cloned()
            .collect()
    }
}

impl From<Config> for network::Config {
    fn from(config: Config) -> Self {
        network::Config::new(config.identity(), config.transport)
    }
}

impl From<Config> for fleet::FaultToleranceConfig {
    fn from(config: Config) -> Self {
        fleet::FaultToleranceConfig {
            heartbeat_timeout: config.heartbeat_timeout,
            monitor_period: config.monitor_period,
            max_recovery_attempts: config.max_recovery_attempts,
            recovery_cooldown: config.recovery_cooldown,
        }
    }
}

impl From<Config> for replication::ReplicationConfig {
    fn from(config: Config) -> Self {
        replication::ReplicationConfig {
            replication_factor: config.replication_factor,
            replication_timeout: config.replication_timeout,
        }
    }
}
