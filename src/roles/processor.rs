use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use fleet::FaultToleranceManager;
use network::{HandlerError, MessageHandler, NodeIdentity, NodeRole, Request, Response};

use crate::client::PeerClient;

/// Middle tier: stamps incoming readings, persists them through the storage
/// fleet, and announces processed records to the notifier.
pub struct ProcessorHandler {
    node_id: String,
    storage: Arc<PeerClient>,
    notifier: Option<Arc<PeerClient>>,
    fleet: FaultToleranceManager,
    collectors_seen: RwLock<HashSet<String>>,
}

impl ProcessorHandler {
    pub fn new(
        node_id: impl Into<String>,
        storage: Arc<PeerClient>,
        notifier: Option<Arc<PeerClient>>,
        fleet: FaultToleranceManager,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            storage,
            notifier,
            fleet,
            collectors_seen: RwLock::new(HashSet::new()),
        }
    }

    pub async fn collectors_seen(&self) -> Vec<String> {
        self.collectors_seen.read().await.iter().cloned().collect()
    }

    fn stamp(&self, data: Value) -> Value {
        let mut record = match data {
            Value::Object(map) => Value::Object(map),
            other => json!({ "reading": other }),
        };
        if let Some(map) = record.as_object_mut() {
            map.insert("processed_by".to_string(), json!(self.node_id));
            map.insert("processed_at".to_string(), json!(Utc::now().to_rfc3339()));
        }
        record
    }

    /// Tells the notifier a record was processed. Best effort; a missing or
    /// unreachable notifier never fails the write path.
    async fn announce(&self, data_id: &str) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let event = json!({
            "event": "data_processed",
            "data_id": data_id,
            "processor_id": self.node_id,
        });
        if let Err(e) = notifier.request(&Request::Notify { data: event }).await {
            warn!(processor = %self.node_id, error = %e, "notifier unreachable");
        }
    }
}

#[async_trait]
impl MessageHandler for ProcessorHandler {
    async fn handle(
        &self,
        _peer: Option<&NodeIdentity>,
        request: Request,
    ) -> std::result::Result<Response, HandlerError> {
        match request {
            Request::Data { data } => {
                let record = self.stamp(data);
                let response = self
                    .storage
                    .request(&Request::StoreData {
                        processor_id: self.node_id.clone(),
                        data: record,
                    })
                    .await?;
                if let Response::Ok {
                    data_id: Some(data_id),
                    ..
                } = &response
                {
                    debug!(processor = %self.node_id, data_id = %data_id, "record stored");
                    self.announce(data_id).await;
                }
                Ok(response)
            }
            Request::Heartbeat { node_id } => {
                self.fleet.update_heartbeat(&node_id).await;
                Ok(Response::ok())
            }
            other => Err(format!(
                "processor does not accept '{}' messages",
                super::message_name(&other)
            )
            .into()),
        }
    }

    async fn on_handshake(&self, peer: &NodeIdentity) {
        if peer.role == NodeRole::Collector {
            self.collectors_seen
                .write()
                .await
                .insert(peer.node_id.clone());
        }
        self.fleet.register_node(&peer.node_id, false).await;
    }
}
