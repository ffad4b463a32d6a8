use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use fleet::FaultToleranceManager;
use network::{HandlerError, MessageHandler, NodeIdentity, Request, Response};
use replication::{ReplicationManager, ReplicationPackage};

/// Persistence tier: writes go through the replication manager, reads query
/// the current version of each record. `replicate` and `version_info` serve
/// the storage fleet itself.
pub struct StorageHandler {
    node_id: String,
    replication: ReplicationManager,
    fleet: FaultToleranceManager,
}

impl StorageHandler {
    pub fn new(
        node_id: impl Into<String>,
        replication: ReplicationManager,
        fleet: FaultToleranceManager,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            replication,
            fleet,
        }
    }

    pub fn replication(&self) -> &ReplicationManager {
        &self.replication
    }
}

#[async_trait]
impl MessageHandler for StorageHandler {
    async fn handle(
        &self,
        _peer: Option<&NodeIdentity>,
        request: Request,
    ) -> std::result::Result<Response, HandlerError> {
        match request {
            Request::StoreData { processor_id, data } => {
                let data_id = self.replication.replicate(data, None).await;
                debug!(storage = %self.node_id, %processor_id, %data_id, "record written");
                Ok(Response::ok_with_data_id(data_id))
            }
            Request::RetrieveData { query } => {
                let matches: Vec<_> = self
                    .replication
                    .find(&query)
                    .await
                    .into_iter()
                    .map(|(data_id, version)| {
                        json!({
                            "data_id": data_id,
                            "version_id": version.version_id,
                            "origin_node": version.origin_node,
                            "timestamp": version.timestamp,
                            "data": version.data,
                        })
                    })
                    .collect();
                Ok(Response::ok_with_data(json!(matches)))
            }
            Request::Replicate { package } => {
                let package: ReplicationPackage = serde_json::from_value(package)
                    .map_err(|e| format!("malformed replication package: {}", e))?;
                self.replication.handle_replication_request(package).await;
                Ok(Response::ok())
            }
            Request::VersionInfo => {
                let summary = serde_json::to_value(self.replication.version_summary().await)
                    .map_err(|e| e.to_string())?;
                Ok(Response::ok_with_data(summary))
            }
            Request::Heartbeat { node_id } => {
                self.fleet.update_heartbeat(&node_id).await;
                Ok(Response::ok())
            }
            other => Err(format!(
                "storage does not accept '{}' messages",
                super::message_name(&other)
            )
            .into()),
        }
    }

    async fn on_handshake(&self, peer: &NodeIdentity) {
        self.fleet.register_node(&peer.node_id, false).await;
    }
}
