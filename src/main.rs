use clap::{Arg, ArgAction, Command};
use tracing::{info, warn};

mod client;
mod config;
mod error;
mod node;
mod roles;

use config::{Config, PeerEndpoint};
use error::{Result, VitalMeshError};
use network::NodeRole;
use node::ServiceNode;
use security::{SecurityContext, TlsSettings, TransportSecurity};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new("vitalmesh")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Fault-tolerant health telemetry service fleet")
        .arg(
            Arg::new("node-id")
                .long("node-id")
                .help("Unique identifier for this node")
                .required(true),
        )
        .arg(
            Arg::new("role")
                .long("role")
                .help("Service role: collector, processor, storage, or notifier")
                .required(true),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .help("Address to listen on")
                .default_value("0.0.0.0"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .help("Port to listen on")
                .default_value("9400"),
        )
        .arg(
            Arg::new("peers")
                .long("peers")
                .help("Comma-separated peers as node_id:role@host:port")
                .required(false),
        )
        .arg(
            Arg::new("primary")
                .long("primary")
                .help("Node id of the peer acting as primary")
                .required(false),
        )
        .arg(
            Arg::new("key")
                .long("key")
                .help("Base64-encoded 32-byte fleet key; generated if omitted")
                .required(false),
        )
        .arg(
            Arg::new("cert")
                .long("cert")
                .help("Path to this node's PEM certificate")
                .required(false),
        )
        .arg(
            Arg::new("cert-key")
                .long("cert-key")
                .help("Path to this node's PEM private key")
                .required(false),
        )
        .arg(
            Arg::new("ca")
                .long("ca")
                .help("Path to the CA bundle used to verify peers")
                .required(false),
        )
        .arg(
            Arg::new("insecure")
                .long("insecure")
                .help("Run without transport encryption (development only)")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let node_id = matches
        .get_one::<String>("node-id")
        .cloned()
        .unwrap_or_default();
    let role = match matches.get_one::<String>("role").map(String::as_str) {
        Some("collector") => NodeRole::Collector,
        Some("processor") => NodeRole::Processor,
        Some("storage") => NodeRole::Storage,
        Some("notifier") => NodeRole::Notifier,
        other => {
            return Err(VitalMeshError::InvalidConfig(format!(
                "unknown role {:?}",
                other
            )))
        }
    };
    let host = matches
        .get_one::<String>("host")
        .cloned()
        .unwrap_or_default();
    let port = matches
        .get_one::<String>("port")
        .map(|p| p.parse::<u16>())
        .transpose()
        .map_err(|e| VitalMeshError::InvalidConfig(format!("invalid port: {}", e)))?
        .unwrap_or(9400);

    let secret_key = match matches.get_one::<String>("key") {
        Some(key) => key.clone(),
        None => {
            warn!("no fleet key given; generating an ephemeral one for this process");
            SecurityContext::generate_base64_key()
        }
    };

    let transport = if matches.get_flag("insecure") {
        TransportSecurity::Plain
    } else {
        match (
            matches.get_one::<String>("cert"),
            matches.get_one::<String>("cert-key"),
        ) {
            (Some(cert), Some(key)) => TransportSecurity::Tls(TlsSettings {
                cert_path: cert.into(),
                key_path: key.into(),
                ca_path: matches.get_one::<String>("ca").map(Into::into),
                verify_peer: matches.get_one::<String>("ca").is_some(),
            }),
            _ => {
                return Err(VitalMeshError::InvalidConfig(
                    "either pass --cert and --cert-key or opt out with --insecure".to_string(),
                ))
            }
        }
    };

    let mut config = Config::new(node_id, role, host, port, secret_key);
    config.transport = transport;
    if let Some(peers) = matches.get_one::<String>("peers") {
        config.peers = peers
            .split(',')
            .map(|spec| PeerEndpoint::parse(spec.trim()))
            .collect::<Result<Vec<_>>>()?;
    }
    config.primary_peer = matches.get_one::<String>("primary").cloned();

    info!(
        node = %config.node_id,
        role = %config.role,
        address = %format!("{}:{}", config.host, config.port),
        peers = config.peers.len(),
        "starting service node"
    );

    let node = ServiceNode::new(config).await?;
    node.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    node.stop().await?;
    Ok(())
}
