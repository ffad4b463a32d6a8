use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use fleet::LoadBalancer;
use network::{Connection, NetworkError, Request, Response};
use replication::{ReplicaLink, ReplicationError, ReplicationPackage, VersionStamp};
use security::SecurityContext;

use crate::config::PeerEndpoint;
use crate::error::{Result, VitalMeshError};

/// Client-side pool over the peers serving one downstream role.
///
/// Connections are opened lazily and cached per peer; a transport failure
/// invalidates the cached connection and the request moves to the next
/// peer. Only when every peer has failed does the caller see
/// `NoAvailablePeer`. Peer error responses are not failures at this layer;
/// they are returned to the caller as-is.
pub struct PeerClient {
    pool_name: String,
    config: network::Config,
    context: Arc<SecurityContext>,
    balancer: LoadBalancer,
    endpoints: RwLock<HashMap<String, PeerEndpoint>>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl PeerClient {
    pub fn new(
        pool_name: impl Into<String>,
        config: network::Config,
        context: Arc<SecurityContext>,
    ) -> Self {
        Self {
            pool_name: pool_name.into(),
            config,
            context,
            balancer: LoadBalancer::new(),
            endpoints: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_peer(&self, endpoint: PeerEndpoint) {
        self.balancer.add_node(&endpoint.node_id).await;
        self.endpoints
            .write()
            .await
            .insert(endpoint.node_id.clone(), endpoint);
    }

    pub async fn remove_peer(&self, node_id: &str) {
        self.balancer.remove_node(node_id).await;
        self.endpoints.write().await.remove(node_id);
        if let Some(connection) = self.connections.write().await.remove(node_id) {
            let _ = connection.close().await;
        }
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.endpoints.read().await.keys().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.endpoints.read().await.is_empty()
    }

    async fn connection_to(&self, node_id: &str) -> Result<Arc<Connection>> {
        if let Some(connection) = self.connections.read().await.get(node_id) {
            return Ok(connection.clone());
        }

        let endpoint = self
            .endpoints
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| VitalMeshError::NoAvailablePeer(self.pool_name.clone()))?;

        let connection = Connection::connect(
            &self.config,
            self.context.clone(),
            &endpoint.host,
            endpoint.port,
        )
        .await?;
        let peer_id = connection.handshake().await?;
        if peer_id != endpoint.node_id {
            warn!(
                expected = %endpoint.node_id,
                actual = %peer_id,
                "peer identified with an unexpected node id"
            );
        }

        let connection = Arc::new(connection);
        self.connections
            .write()
            .await
            .insert(node_id.to_string(), connection.clone());
        debug!(pool = %self.pool_name, peer = node_id, "peer connection established");
        Ok(connection)
    }

    async fn invalidate(&self, node_id: &str) {
        if let Some(connection) = self.connections.write().await.remove(node_id) {
            let _ = connection.close().await;
        }
    }

    /// Sends a request to the least-loaded peer, failing over to the
    /// remaining peers when the chosen one is unreachable or exhausts its
    /// retry budget.
    pub async fn request(&self, request: &Request) -> Result<Response> {
        let known: Vec<String> = self.peer_ids().await;
        if known.is_empty() {
            return Err(VitalMeshError::NoAvailablePeer(self.pool_name.clone()));
        }

        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error = String::new();
        for _ in 0..known.len() {
            let picked = match self.balancer.get_next_node().await {
                Some(picked) if !tried.contains(&picked) => picked,
                _ => match known.iter().find(|id| !tried.contains(*id)) {
                    Some(id) => id.clone(),
                    None => break,
                },
            };

            self.balancer.register_request(&picked).await;
            let outcome = self.send_once(&picked, request).await;
            self.balancer.complete_request(&picked).await;

            match outcome {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(pool = %self.pool_name, peer = %picked, error = %e, "peer failed; trying next");
                    last_error = e.to_string();
                    tried.insert(picked);
                }
            }
        }
        Err(VitalMeshError::NoAvailablePeer(format!(
            "{} ({})",
            self.pool_name, last_error
        )))
    }

    /// Sends a request to one specific peer, no failover.
    pub async fn send_to(&self, node_id: &str, request: &Request) -> Result<Response> {
        self.send_once(node_id, request).await
    }

    /// One logical request to one peer, retried under the attempt budget.
    ///
    /// Every failed or timed-out exchange invalidates the cached connection
    /// before the next attempt: the dead stream may still carry a late
    /// response, and reusing it would pair that response with the wrong
    /// request. Each retry therefore runs on a fresh connection. A connect
    /// failure is returned immediately since reconnecting cannot help.
    async fn send_once(&self, node_id: &str, request: &Request) -> Result<Response> {
        let budget = self.config.max_request_retries;
        let mut last_error = String::new();
        for attempt in 1..=budget {
            let connection = self.connection_to(node_id).await?;
            match connection.request(request).await {
                Ok(response) => return Ok(response),
                Err(e @ NetworkError::Protocol(_)) | Err(e @ NetworkError::Security(_)) => {
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(
                        pool = %self.pool_name,
                        peer = %node_id,
                        attempt,
                        error = %e,
                        "request attempt failed; discarding connection"
                    );
                    self.invalidate(node_id).await;
                    last_error = e.to_string();
                }
            }
        }
        Err(NetworkError::RetriesExhausted(budget, last_error).into())
    }

    /// Sends a request to every peer concurrently, reporting per-peer
    /// success. Used for heartbeats; one slow or dead peer must not delay
    /// delivery to the others, and failures are reported, never fatal.
    pub async fn broadcast(&self, request: &Request) -> Vec<(String, bool)> {
        let sends = self.peer_ids().await.into_iter().map(|node_id| async move {
            let delivered = matches!(self.send_once(&node_id, request).await, Ok(r) if r.is_ok());
            (node_id, delivered)
        });
        futures::future::join_all(sends).await
    }

    pub async fn close_all(&self) {
        let connections: Vec<Arc<Connection>> =
            self.connections.write().await.drain().map(|(_, c)| c).collect();
        for connection in connections {
            let _ = connection.close().await;
        }
    }
}

/// [`ReplicaLink`] over the node protocol: versions are pushed as
/// `replicate` messages and stamps fetched with `version_info`.
pub struct ConnectionReplica {
    node_id: String,
    client: Arc<PeerClient>,
}

impl ConnectionReplica {
    pub fn new(node_id: impl Into<String>, client: Arc<PeerClient>) -> Self {
        Self {
            node_id: node_id.into(),
            client,
        }
    }
}

#[async_trait]
impl ReplicaLink for ConnectionReplica {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn push(&self, package: &ReplicationPackage) -> replication::Result<()> {
        let package = serde_json::to_value(package)
            .map_err(|e| ReplicationError::Link(e.to_string()))?;
        let response = self
            .client
            .send_to(&self.node_id, &Request::Replicate { package })
            .await
            .map_err(|e| ReplicationError::Link(e.to_string()))?;
        match response {
            Response::Ok { .. } => Ok(()),
            Response::Error { message } => Err(ReplicationError::Link(message)),
        }
    }

    async fn fetch_versions(&self) -> replication::Result<HashMap<String, VersionStamp>> {
        let response = self
            .client
            .send_to(&self.node_id, &Request::VersionInfo)
            .await
            .map_err(|e| ReplicationError::Link(e.to_string()))?;
        match response {
            Response::Ok {
                data: Some(data), ..
            } => serde_json::from_value(data)
                .map_err(|e| ReplicationError::Link(format!("malformed version summary: {}", e))),
            Response::Ok { .. } => Err(ReplicationError::Link(
                "version summary missing from response".to_string(),
            )),
            Response::Error { message } => Err(ReplicationError::Link(message)),
        }
    }
}
