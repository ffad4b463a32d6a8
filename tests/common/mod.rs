#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use network::{Connection, NodeIdentity, NodeRole};
use security::{SecurityContext, TransportSecurity};
use vitalmesh::{Config, PeerEndpoint};

/// Node config for loopback tests: ephemeral port, plain transport, and
/// tunables shortened so failure paths resolve quickly.
pub fn node_config(node_id: &str, role: NodeRole, key: &str) -> Config {
    let mut config = Config::new(node_id, role, "127.0.0.1", 0, key);
    config.heartbeat_interval = Duration::from_millis(100);
    config.heartbeat_timeout = Duration::from_millis(500);
    config.monitor_period = Duration::from_millis(50);
    config.replication_timeout = Duration::from_secs(2);
    config.sync_interval = Duration::from_secs(3600);
    config
}

pub fn peer(node_id: &str, role: NodeRole, addr: SocketAddr) -> PeerEndpoint {
    PeerEndpoint {
        node_id: node_id.to_string(),
        role,
        host: addr.ip().to_string(),
        port: addr.port(),
    }
}

/// Connects and handshakes as an external device talking to the fleet.
pub async fn device_connection(key: &str, port: u16) -> Connection {
    let context = Arc::new(SecurityContext::from_base64_key(key).unwrap());
    let identity = NodeIdentity::new("device-1", NodeRole::Collector, "127.0.0.1", 0);
    let config = network::Config::new(identity, TransportSecurity::Plain);
    let connection = Connection::connect(&config, context, "127.0.0.1", port)
        .await
        .unwrap();
    connection.handshake().await.unwrap();
    connection
}
