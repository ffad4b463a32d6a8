use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use fleet::FaultToleranceManager;
use network::{HandlerError, MessageHandler, NodeIdentity, Request, Response};

use crate::client::PeerClient;

/// Ingestion edge of the fleet: accepts device readings, remembers the
/// latest reading per device, and hands each reading to a processor chosen
/// by the load balancer.
pub struct CollectorHandler {
    node_id: String,
    processors: Arc<PeerClient>,
    fleet: FaultToleranceManager,
    latest_readings: RwLock<HashMap<String, Value>>,
}

impl CollectorHandler {
    pub fn new(
        node_id: impl Into<String>,
        processors: Arc<PeerClient>,
        fleet: FaultToleranceManager,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            processors,
            fleet,
            latest_readings: RwLock::new(HashMap::new()),
        }
    }

    pub async fn latest_reading(&self, device_id: &str) -> Option<Value> {
        self.latest_readings.read().await.get(device_id).cloned()
    }

    pub async fn device_count(&self) -> usize {
        self.latest_readings.read().await.len()
    }
}

#[async_trait]
impl MessageHandler for CollectorHandler {
    async fn handle(
        &self,
        _peer: Option<&NodeIdentity>,
        request: Request,
    ) -> std::result::Result<Response, HandlerError> {
        match request {
            Request::Data { data } => {
                if let Some(device_id) = data.get("device_id").and_then(Value::as_str) {
                    self.latest_readings
                        .write()
                        .await
                        .insert(device_id.to_string(), data.clone());
                }
                debug!(collector = %self.node_id, "forwarding reading to processor");
                let response = self.processors.request(&Request::Data { data }).await?;
                Ok(response)
            }
            Request::Heartbeat { node_id } => {
                self.fleet.update_heartbeat(&node_id).await;
                Ok(Response::ok())
            }
            other => Err(format!(
                "collector does not accept '{}' messages",
                super::message_name(&other)
            )
            .into()),
        }
    }

    async fn on_handshake(&self, peer: &NodeIdentity) {
        self.fleet.register_node(&peer.node_id, false).await;
    }
}
