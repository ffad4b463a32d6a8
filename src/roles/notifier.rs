use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use fleet::FaultToleranceManager;
use network::{HandlerError, MessageHandler, NodeIdentity, Request, Response};

const RECENT_EVENT_LIMIT: usize = 1000;

/// Terminal tier: records alerts and notifications and fans them out as
/// fire-and-forget events for whoever is watching the fleet.
pub struct NotifierHandler {
    node_id: String,
    fleet: FaultToleranceManager,
    subscribers: RwLock<HashMap<String, DateTime<Utc>>>,
    recent: RwLock<VecDeque<Value>>,
    events: broadcast::Sender<Value>,
}

impl NotifierHandler {
    pub fn new(node_id: impl Into<String>, fleet: FaultToleranceManager) -> Self {
        let (events, _) = broadcast::channel(RECENT_EVENT_LIMIT);
        Self {
            node_id: node_id.into(),
            fleet,
            subscribers: RwLock::new(HashMap::new()),
            recent: RwLock::new(VecDeque::new()),
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Value> {
        self.events.subscribe()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn recent_events(&self) -> Vec<Value> {
        self.recent.read().await.iter().cloned().collect()
    }

    async fn record(&self, event_type: &str, data: Value) {
        let event = json!({
            "event_type": event_type,
            "data": data,
            "received_at": Utc::now().to_rfc3339(),
        });
        {
            let mut recent = self.recent.write().await;
            if recent.len() == RECENT_EVENT_LIMIT {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        // No receivers is fine; delivery is best effort.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MessageHandler for NotifierHandler {
    async fn handle(
        &self,
        _peer: Option<&NodeIdentity>,
        request: Request,
    ) -> std::result::Result<Response, HandlerError> {
        match request {
            Request::Subscribe { subscriber_id } => {
                info!(notifier = %self.node_id, subscriber = %subscriber_id, "subscriber registered");
                self.subscribers
                    .write()
                    .await
                    .insert(subscriber_id, Utc::now());
                Ok(Response::ok())
            }
            Request::Alert { data } => {
                self.record("alert", data).await;
                Ok(Response::ok())
            }
            Request::Notify { data } => {
                self.record("notification", data).await;
                Ok(Response::ok())
            }
            Request::Heartbeat { node_id } => {
                self.fleet.update_heartbeat(&node_id).await;
                Ok(Response::ok())
            }
            other => Err(format!(
                "notifier does not accept '{}' messages",
                super::message_name(&other)
            )
            .into()),
        }
    }

    async fn on_handshake(&self, peer: &NodeIdentity) {
        self.fleet.register_node(&peer.node_id, false).await;
    }
}
