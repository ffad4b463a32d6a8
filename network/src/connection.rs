use std::sync::{Arc, RwLock};

use rustls::pki_types::ServerName;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use security::{client_connector, SecureEnvelope, SecurityContext, TransportSecurity};

use crate::framing::{FrameReader, FrameWriter};
use crate::protocol::{decode_response, Request, Response};
use crate::stream::NodeStream;
use crate::{Config, NetworkError, NodeIdentity, Result};

struct ConnectionIo {
    reader: FrameReader<ReadHalf<NodeStream>>,
    writer: FrameWriter<WriteHalf<NodeStream>>,
}

/// An outbound, client-role connection to a peer node.
///
/// All I/O goes through one mutex-guarded reader/writer pair, so requests on
/// a connection are strictly serialized: a frame is never interleaved with
/// another writer's and every response is matched to the request that
/// preceded it.
pub struct Connection {
    local: NodeIdentity,
    peer_id: RwLock<Option<String>>,
    io: Mutex<ConnectionIo>,
    context: Arc<SecurityContext>,
    config: Config,
}

impl Connection {
    /// Opens a transport-layer connection; the connection is not usable for
    /// application traffic until [`Connection::handshake`] succeeds.
    pub async fn connect(
        config: &Config,
        context: Arc<SecurityContext>,
        host: &str,
        port: u16,
    ) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let tcp = timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| NetworkError::Connect(format!("timed out connecting to {}", addr)))?
            .map_err(|e| NetworkError::Connect(format!("{}: {}", addr, e)))?;
        tcp.set_nodelay(true)?;

        let stream = match &config.security {
            TransportSecurity::Plain => {
                debug!(peer = %addr, "outbound connection without transport encryption");
                NodeStream::Plain(tcp)
            }
            TransportSecurity::Tls(settings) => {
                let connector = client_connector(settings)?;
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|e| NetworkError::Connect(format!("invalid server name: {}", e)))?;
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| NetworkError::Connect(format!("TLS to {}: {}", addr, e)))?;
                NodeStream::ClientTls(Box::new(tls))
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Self {
            local: config.identity.clone(),
            peer_id: RwLock::new(None),
            io: Mutex::new(ConnectionIo {
                reader: FrameReader::new(read_half, config.max_frame_len),
                writer: FrameWriter::new(write_half),
            }),
            context,
            config: config.clone(),
        })
    }

    /// Exchanges identities with the peer. Until the acknowledgment carrying
    /// the peer's node id arrives the connection is not considered usable;
    /// expiry of the handshake timeout is a hard failure.
    pub async fn handshake(&self) -> Result<String> {
        let request = Request::Handshake {
            node_id: self.local.node_id.clone(),
            node_type: self.local.role,
        };

        let response = timeout(self.config.handshake_timeout, self.exchange(&request))
            .await
            .map_err(|_| NetworkError::HandshakeTimeout(self.config.handshake_timeout))??;

        match response {
            Response::Ok {
                node_id: Some(peer_id),
                ..
            } => {
                *self.peer_id.write().expect("peer_id lock poisoned") = Some(peer_id.clone());
                info!(peer = %peer_id, "handshake complete");
                Ok(peer_id)
            }
            Response::Ok { .. } => Err(NetworkError::Protocol(
                "handshake acknowledgment missing node_id".to_string(),
            )),
            Response::Error { message } => Err(NetworkError::Protocol(format!(
                "handshake rejected: {}",
                message
            ))),
        }
    }

    /// Sends a request and awaits its response under the request timeout.
    ///
    /// A timed-out exchange is connection-fatal: the request frame may
    /// already be on the wire and its late response still in flight, so any
    /// further use of this stream would pair that response with the next
    /// request. The caller discards the connection and retries over a fresh
    /// one.
    pub async fn request(&self, request: &Request) -> Result<Response> {
        match timeout(self.config.request_timeout, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Transport(format!(
                "request timed out after {:?}",
                self.config.request_timeout
            ))),
        }
    }

    async fn exchange(&self, request: &Request) -> Result<Response> {
        let plaintext = serde_json::to_value(request)
            .map_err(|e| NetworkError::Protocol(e.to_string()))?;
        let envelope = self.context.encrypt_message(&plaintext)?;
        let frame = serde_json::to_vec(&envelope)
            .map_err(|e| NetworkError::Protocol(e.to_string()))?;

        let reply = {
            let mut io = self.io.lock().await;
            io.writer.send(&frame).await?;
            io.reader.receive().await?
        };

        let envelope: SecureEnvelope = serde_json::from_slice(&reply)
            .map_err(|e| NetworkError::Protocol(format!("malformed envelope: {}", e)))?;
        let plaintext = self.context.decrypt_message(&envelope)?;
        decode_response(&plaintext)
    }

    /// Peer node id, present once the handshake has completed.
    pub fn peer_id(&self) -> Option<String> {
        self.peer_id.read().expect("peer_id lock poisoned").clone()
    }

    pub async fn close(&self) -> Result<()> {
        self.io.lock().await.writer.shutdown().await
    }
}
