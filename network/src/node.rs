use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use security::{server_acceptor, SecureEnvelope, SecurityContext, TransportSecurity};

use crate::connection::Connection;
use crate::framing::{FrameReader, FrameWriter};
use crate::protocol::{decode_request, Request, Response};
use crate::stream::NodeStream;
use crate::{Config, NetworkError, NodeIdentity, Result};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Capability interface a service role plugs into a [`Node`].
///
/// Handshake and heartbeat bookkeeping stay in the node; everything else is
/// dispatched here. A returned error becomes a structured error response to
/// the peer, never a dropped message or a closed connection.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        peer: Option<&NodeIdentity>,
        request: Request,
    ) -> std::result::Result<Response, HandlerError>;

    /// Called after an inbound peer has identified itself.
    async fn on_handshake(&self, _peer: &NodeIdentity) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct ConnectionEntry {
    remote_addr: SocketAddr,
    peer: Option<NodeIdentity>,
    /// Filled in right after the serve task is spawned. Absent when the
    /// connection died before the handle was recorded.
    task: Option<JoinHandle<()>>,
}

/// A listening service node: accepts connections, runs one receive loop per
/// connection, and dispatches decoded messages to its [`MessageHandler`].
pub struct Node {
    config: Config,
    context: Arc<SecurityContext>,
    handler: Arc<dyn MessageHandler>,
    state: Arc<RwLock<NodeState>>,
    connections: Arc<RwLock<HashMap<u64, ConnectionEntry>>>,
    next_conn_id: Arc<AtomicU64>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl Node {
    pub fn new(config: Config, context: Arc<SecurityContext>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            config,
            context,
            handler,
            state: Arc::new(RwLock::new(NodeState::Stopped)),
            connections: Arc::new(RwLock::new(HashMap::new())),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            shutdown: Mutex::new(None),
            accept_task: Mutex::new(None),
            local_addr: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    /// Actual listening address, available while the node is running. Useful
    /// when the configured port is 0.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// Number of currently tracked inbound connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Binds the listening endpoint and begins accepting connections.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != NodeState::Stopped {
                return Err(NetworkError::Bind(format!(
                    "node {} is not stopped",
                    self.config.identity.node_id
                )));
            }
            *state = NodeState::Starting;
        }

        let bind_address = self.config.identity.bind_address();
        let listener = match TcpListener::bind(&bind_address).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write().await = NodeState::Stopped;
                return Err(NetworkError::Bind(format!("{}: {}", bind_address, e)));
            }
        };

        let acceptor = match &self.config.security {
            TransportSecurity::Plain => {
                warn!(
                    node = %self.config.identity.node_id,
                    "listening without transport encryption (non-production configuration)"
                );
                None
            }
            TransportSecurity::Tls(settings) => match server_acceptor(settings) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    *self.state.write().await = NodeState::Stopped;
                    return Err(e.into());
                }
            },
        };

        *self.local_addr.write().await = Some(listener.local_addr()?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(shutdown_tx);

        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            acceptor,
            shutdown_rx,
            self.config.clone(),
            self.context.clone(),
            self.handler.clone(),
            self.connections.clone(),
            self.next_conn_id.clone(),
        ));
        *self.accept_task.lock().await = Some(accept_task);

        *self.state.write().await = NodeState::Running;
        info!(
            node = %self.config.identity.node_id,
            role = %self.config.identity.role,
            address = %bind_address,
            "node started"
        );
        Ok(())
    }

    /// Stops accepting, closes every tracked connection with a bounded wait,
    /// and lands in `Stopped` even when individual closes fail. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == NodeState::Stopped {
                return Ok(());
            }
            *state = NodeState::Stopping;
        }

        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(true);
        }

        if let Some(accept_task) = self.accept_task.lock().await.take() {
            accept_task.abort();
            let _ = accept_task.await;
        }

        let entries: Vec<(u64, ConnectionEntry)> =
            self.connections.write().await.drain().collect();
        for (conn_id, entry) in entries {
            let Some(mut task) = entry.task else {
                continue;
            };
            if timeout(self.config.shutdown_grace, &mut task).await.is_err() {
                warn!(
                    conn_id,
                    remote = %entry.remote_addr,
                    "connection did not close within grace period; aborting"
                );
                task.abort();
            }
        }

        *self.local_addr.write().await = None;
        *self.state.write().await = NodeState::Stopped;
        info!(node = %self.config.identity.node_id, "node stopped");
        Ok(())
    }

    /// Opens an outbound connection to a peer. The caller performs the
    /// handshake before using it.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Connection> {
        Connection::connect(&self.config, self.context.clone(), host, port).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn accept_loop(
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        mut shutdown: watch::Receiver<bool>,
        config: Config,
        context: Arc<SecurityContext>,
        handler: Arc<dyn MessageHandler>,
        connections: Arc<RwLock<HashMap<u64, ConnectionEntry>>>,
        next_conn_id: Arc<AtomicU64>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (tcp, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "error accepting connection");
                            continue;
                        }
                    };
                    let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                    debug!(conn_id, %remote_addr, "accepted connection");

                    // Register before spawning: a connection that dies
                    // instantly removes its own entry, and that removal
                    // must not race ahead of the insert.
                    connections.write().await.insert(
                        conn_id,
                        ConnectionEntry {
                            remote_addr,
                            peer: None,
                            task: None,
                        },
                    );
                    let task = tokio::spawn(Self::serve_connection(
                        conn_id,
                        tcp,
                        remote_addr,
                        acceptor.clone(),
                        shutdown.clone(),
                        config.clone(),
                        context.clone(),
                        handler.clone(),
                        connections.clone(),
                    ));
                    if let Some(entry) = connections.write().await.get_mut(&conn_id) {
                        entry.task = Some(task);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn serve_connection(
        conn_id: u64,
        tcp: TcpStream,
        remote_addr: SocketAddr,
        acceptor: Option<TlsAcceptor>,
        mut shutdown: watch::Receiver<bool>,
        config: Config,
        context: Arc<SecurityContext>,
        handler: Arc<dyn MessageHandler>,
        connections: Arc<RwLock<HashMap<u64, ConnectionEntry>>>,
    ) {
        let stream = match acceptor {
            Some(acceptor) => match acceptor.accept(tcp).await {
                Ok(tls) => NodeStream::ServerTls(Box::new(tls)),
                Err(e) => {
                    warn!(%remote_addr, error = %e, "TLS accept failed");
                    connections.write().await.remove(&conn_id);
                    return;
                }
            },
            None => NodeStream::Plain(tcp),
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, config.max_frame_len);
        let mut writer = FrameWriter::new(write_half);

        // Messages on one connection are processed and answered strictly in
        // receipt order: this loop is the only reader and the only writer.
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = reader.receive() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(NetworkError::EndOfStream) => {
                    debug!(conn_id, %remote_addr, "peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(conn_id, %remote_addr, error = %e, "connection-fatal receive error");
                    break;
                }
            };

            let response = Self::process_frame(
                &frame,
                conn_id,
                remote_addr,
                &config,
                &context,
                &handler,
                &connections,
            )
            .await;

            let plaintext = match serde_json::to_value(&response) {
                Ok(value) => value,
                Err(e) => {
                    error!(conn_id, error = %e, "failed to serialize response");
                    break;
                }
            };
            let outbound = match context
                .encrypt_message(&plaintext)
                .and_then(|envelope| {
                    serde_json::to_vec(&envelope)
                        .map_err(|e| security::SecurityError::Malformed(e.to_string()))
                }) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(conn_id, error = %e, "failed to encrypt response");
                    break;
                }
            };
            if let Err(e) = writer.send(&outbound).await {
                warn!(conn_id, %remote_addr, error = %e, "failed to write response");
                break;
            }
        }

        connections.write().await.remove(&conn_id);
        debug!(conn_id, %remote_addr, "connection closed");
    }

    /// Decodes and dispatches one inbound frame. Envelope, integrity, and
    /// protocol failures are fatal to the message only; the structured error
    /// response keeps the connection alive.
    async fn process_frame(
        frame: &[u8],
        conn_id: u64,
        remote_addr: SocketAddr,
        config: &Config,
        context: &Arc<SecurityContext>,
        handler: &Arc<dyn MessageHandler>,
        connections: &Arc<RwLock<HashMap<u64, ConnectionEntry>>>,
    ) -> Response {
        let envelope: SecureEnvelope = match serde_json::from_slice(frame) {
            Ok(envelope) => envelope,
            Err(e) => return Response::error(format!("malformed envelope: {}", e)),
        };
        let plaintext = match context.decrypt_message(&envelope) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(conn_id, %remote_addr, error = %e, "rejected envelope");
                return Response::error(e.to_string());
            }
        };
        let request = match decode_request(&plaintext) {
            Ok(request) => request,
            Err(e) => return Response::error(e.to_string()),
        };

        match request {
            Request::Handshake { node_id, node_type } => {
                let peer = NodeIdentity::new(
                    node_id.clone(),
                    node_type,
                    remote_addr.ip().to_string(),
                    remote_addr.port(),
                );
                if let Some(entry) = connections.write().await.get_mut(&conn_id) {
                    entry.peer = Some(peer.clone());
                }
                handler.on_handshake(&peer).await;
                info!(conn_id, peer = %node_id, role = %node_type, "peer identified");
                Response::ok_with_node(config.identity.node_id.clone())
            }
            request => {
                let peer = connections
                    .read()
                    .await
                    .get(&conn_id)
                    .and_then(|entry| entry.peer.clone());
                match handler.handle(peer.as_ref(), request).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(conn_id, error = %e, "message handler error");
                        Response::error(e.to_string())
                    }
                }
            }
        }
    }
}
