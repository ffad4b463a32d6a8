use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{RecordVersion, ReplicationPackage, VersionStamp, VersionStore};
use crate::Result;

/// Transport seam to one replica peer. The production impl speaks the node
/// protocol over a connection; tests use in-memory stores.
#[async_trait]
pub trait ReplicaLink: Send + Sync {
    fn node_id(&self) -> &str;

    /// Delivers one version for unconditional append on the replica.
    async fn push(&self, package: &ReplicationPackage) -> Result<()>;

    /// The replica's newest stamp per record, for anti-entropy comparison.
    async fn fetch_versions(&self) -> Result<HashMap<String, VersionStamp>>;
}

#[derive(Debug, Clone, Copy)]
pub struct ReplicationConfig {
    /// Total copies wanted, the local one included.
    pub replication_factor: usize,
    pub replication_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            replication_timeout: Duration::from_secs(10),
        }
    }
}

/// Best-effort replication over an append-only version store.
///
/// Writes land locally first and unconditionally; copies are then pushed to
/// replicas, and a shortfall is logged rather than surfaced as an error.
#[derive(Clone)]
pub struct ReplicationManager {
    node_id: Arc<str>,
    config: ReplicationConfig,
    store: Arc<RwLock<VersionStore>>,
    replicas: Arc<RwLock<Vec<Arc<dyn ReplicaLink>>>>,
}

impl ReplicationManager {
    pub fn new(node_id: impl Into<String>, config: ReplicationConfig) -> Self {
        Self {
            node_id: node_id.into().into(),
            config,
            store: Arc::new(RwLock::new(VersionStore::new())),
            replicas: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn add_replica(&self, replica: Arc<dyn ReplicaLink>) {
        let mut replicas = self.replicas.write().await;
        if replicas.iter().any(|r| r.node_id() == replica.node_id()) {
            return;
        }
        info!(replica = replica.node_id(), "replica registered");
        replicas.push(replica);
    }

    pub async fn remove_replica(&self, node_id: &str) {
        self.replicas
            .write()
            .await
            .retain(|replica| replica.node_id() != node_id);
    }

    pub async fn replica_count(&self) -> usize {
        self.replicas.read().await.len()
    }

    /// Stores a new version locally and pushes copies to up to
    /// `replication_factor - 1` replicas. Returns the record id, assigning a
    /// fresh one when the caller did not provide one.
    pub async fn replicate(&self, data: Value, data_id: Option<String>) -> String {
        let data_id = data_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let package = ReplicationPackage {
            data_id: data_id.clone(),
            version: RecordVersion::new(self.node_id.as_ref(), data),
        };
        self.store
            .write()
            .await
            .append(&package.data_id, package.version.clone());

        let targets: Vec<Arc<dyn ReplicaLink>> = {
            let replicas = self.replicas.read().await;
            replicas
                .iter()
                .take(self.config.replication_factor.saturating_sub(1))
                .cloned()
                .collect()
        };
        if targets.is_empty() {
            return data_id;
        }

        let deadline = self.config.replication_timeout;
        let pushes = targets.iter().map(|replica| {
            let replica = replica.clone();
            let package = package.clone();
            async move {
                match timeout(deadline, replica.push(&package)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        warn!(replica = replica.node_id(), error = %e, "replica push failed");
                        false
                    }
                    Err(_) => {
                        warn!(replica = replica.node_id(), "replica push timed out");
                        false
                    }
                }
            }
        });
        let acked = futures::future::join_all(pushes)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        if acked < targets.len() {
            warn!(
                data_id = %data_id,
                acked,
                wanted = targets.len(),
                "replication shortfall"
            );
        } else {
            debug!(data_id = %data_id, copies = acked + 1, "record replicated");
        }
        data_id
    }

    /// Appends a version received from a peer. Always accepted; conflict
    /// resolution happens at read time.
    pub async fn handle_replication_request(&self, package: ReplicationPackage) {
        debug!(
            data_id = %package.data_id,
            origin = %package.version.origin_node,
            "accepted replicated version"
        );
        self.store
            .write()
            .await
            .append(&package.data_id, package.version);
    }

    /// One anti-entropy round: push our current version of every record a
    /// replica is missing or holds a stale stamp for. Failures are logged
    /// per replica and the round continues.
    pub async fn sync_with_replicas(&self) {
        let summary = self.store.read().await.summary();
        let replicas: Vec<Arc<dyn ReplicaLink>> = self.replicas.read().await.clone();
        let deadline = self.config.replication_timeout;

        for replica in replicas {
            let remote = match timeout(deadline, replica.fetch_versions()).await {
                Ok(Ok(remote)) => remote,
                Ok(Err(e)) => {
                    warn!(replica = replica.node_id(), error = %e, "version exchange failed");
                    continue;
                }
                Err(_) => {
                    warn!(replica = replica.node_id(), "version exchange timed out");
                    continue;
                }
            };

            for (data_id, local_stamp) in &summary {
                let behind = remote
                    .get(data_id)
                    .map(|remote_stamp| remote_stamp < local_stamp)
                    .unwrap_or(true);
                if !behind {
                    continue;
                }
                let Some(version) = self.store.read().await.current(data_id).cloned() else {
                    continue;
                };
                let package = ReplicationPackage {
                    data_id: data_id.clone(),
                    version,
                };
                match timeout(deadline, replica.push(&package)).await {
                    Ok(Ok(())) => {
                        debug!(replica = replica.node_id(), data_id = %data_id, "synced record")
                    }
                    Ok(Err(e)) => {
                        warn!(replica = replica.node_id(), data_id = %data_id, error = %e,
                            "sync push failed")
                    }
                    Err(_) => {
                        warn!(replica = replica.node_id(), data_id = %data_id,
                            "sync push timed out")
                    }
                }
            }
        }
    }

    /// Checks whether a replica answers a version exchange within the
    /// replication timeout. Used as the liveness probe during recovery.
    pub async fn probe_replica(&self, node_id: &str) -> bool {
        let replica = {
            let replicas = self.replicas.read().await;
            replicas.iter().find(|r| r.node_id() == node_id).cloned()
        };
        let Some(replica) = replica else {
            return false;
        };
        matches!(
            timeout(self.config.replication_timeout, replica.fetch_versions()).await,
            Ok(Ok(_))
        )
    }

    pub async fn current_version(&self, data_id: &str) -> Option<RecordVersion> {
        self.store.read().await.current(data_id).cloned()
    }

    pub async fn version_history(&self, data_id: &str) -> Option<Vec<RecordVersion>> {
        self.store.read().await.history(data_id).map(<[_]>::to_vec)
    }

    pub async fn version_summary(&self) -> HashMap<String, VersionStamp> {
        self.store.read().await.summary()
    }

    pub async fn find(&self, query: &Value) -> Vec<(String, RecordVersion)> {
        self.store.read().await.find(query)
    }

    pub async fn record_count(&self) -> usize {
        self.store.read().await.record_count()
    }
}
