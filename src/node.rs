use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use fleet::FaultToleranceManager;
use network::{MessageHandler, NodeRole, NodeState, Request};
use replication::ReplicationManager;
use security::SecurityContext;

use crate::client::{ConnectionReplica, PeerClient};
use crate::config::Config;
use crate::error::{Result, VitalMeshError};
use crate::roles::{CollectorHandler, NotifierHandler, ProcessorHandler, StorageHandler};

/// The role-specific handler a [`ServiceNode`] dispatches to.
pub enum RoleHandler {
    Collector(Arc<CollectorHandler>),
    Processor(Arc<ProcessorHandler>),
    Storage(Arc<StorageHandler>),
    Notifier(Arc<NotifierHandler>),
}

impl RoleHandler {
    fn as_message_handler(&self) -> Arc<dyn MessageHandler> {
        match self {
            RoleHandler::Collector(handler) => handler.clone(),
            RoleHandler::Processor(handler) => handler.clone(),
            RoleHandler::Storage(handler) => handler.clone(),
            RoleHandler::Notifier(handler) => handler.clone(),
        }
    }
}

/// One service node of the fleet: the network listener, the role handler,
/// health tracking for its peers, and the background heartbeat and
/// anti-entropy loops.
pub struct ServiceNode {
    config: Config,
    node: Arc<network::Node>,
    handler: RoleHandler,
    fleet: FaultToleranceManager,
    replication: Option<ReplicationManager>,
    clients: Vec<Arc<PeerClient>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceNode {
    pub async fn new(config: Config) -> Result<Self> {
        let context = Arc::new(SecurityContext::from_base64_key(&config.secret_key)?);
        let net_config: network::Config = config.clone().into();
        let fleet = FaultToleranceManager::new(&config.node_id, config.clone().into());

        // Peers named in configuration are tracked from the start; peers
        // that connect inbound are registered at handshake time.
        for peer in &config.peers {
            let is_primary = config.primary_peer.as_deref() == Some(peer.node_id.as_str());
            fleet.register_node(&peer.node_id, is_primary).await;
        }

        let mut clients: Vec<Arc<PeerClient>> = Vec::new();
        let mut pool = |pool_name: &str| -> Arc<PeerClient> {
            let client = Arc::new(PeerClient::new(
                pool_name,
                net_config.clone(),
                context.clone(),
            ));
            clients.push(client.clone());
            client
        };

        let mut replication = None;
        let handler = match config.role {
            NodeRole::Collector => {
                let processors = pool("processor pool");
                for peer in config.peers_with_role(NodeRole::Processor) {
                    processors.add_peer(peer).await;
                }
                if processors.is_empty().await {
                    return Err(VitalMeshError::InvalidConfig(
                        "collector requires at least one processor peer".to_string(),
                    ));
                }
                RoleHandler::Collector(Arc::new(CollectorHandler::new(
                    &config.node_id,
                    processors,
                    fleet.clone(),
                )))
            }
            NodeRole::Processor => {
                let storage = pool("storage pool");
                for peer in config.peers_with_role(NodeRole::Storage) {
                    storage.add_peer(peer).await;
                }
                if storage.is_empty().await {
                    return Err(VitalMeshError::InvalidConfig(
                        "processor requires at least one storage peer".to_string(),
                    ));
                }
                let notifier_peers = config.peers_with_role(NodeRole::Notifier);
                let notifier = if notifier_peers.is_empty() {
                    None
                } else {
                    let notifier = pool("notifier pool");
                    for peer in notifier_peers {
                        notifier.add_peer(peer).await;
                    }
                    Some(notifier)
                };
                RoleHandler::Processor(Arc::new(ProcessorHandler::new(
                    &config.node_id,
                    storage,
                    notifier,
                    fleet.clone(),
                )))
            }
            NodeRole::Storage => {
                let manager =
                    ReplicationManager::new(&config.node_id, config.clone().into());
                let replicas = pool("replica pool");
                for peer in config.peers_with_role(NodeRole::Storage) {
                    let node_id = peer.node_id.clone();
                    replicas.add_peer(peer).await;
                    manager
                        .add_replica(Arc::new(ConnectionReplica::new(node_id, replicas.clone())))
                        .await;
                }
                Self::wire_storage_recovery(&fleet, &manager);
                replication = Some(manager.clone());
                RoleHandler::Storage(Arc::new(StorageHandler::new(
                    &config.node_id,
                    manager,
                    fleet.clone(),
                )))
            }
            NodeRole::Notifier => RoleHandler::Notifier(Arc::new(NotifierHandler::new(
                &config.node_id,
                fleet.clone(),
            ))),
        };

        fleet.set_failover_callback(Arc::new(|old_primary, new_primary| {
            Box::pin(async move {
                info!(%old_primary, %new_primary, "primary role moved");
            })
        }));

        let node = Arc::new(network::Node::new(
            net_config,
            context,
            handler.as_message_handler(),
        ));

        Ok(Self {
            config,
            node,
            handler,
            fleet,
            replication,
            clients,
            shutdown: Mutex::new(None),
            background_tasks: Mutex::new(Vec::new()),
        })
    }

    /// A failed storage peer recovers when it answers a version exchange
    /// again; a full anti-entropy round then brings it back up to date.
    fn wire_storage_recovery(fleet: &FaultToleranceManager, manager: &ReplicationManager) {
        let manager = manager.clone();
        fleet.set_recovery_callback(Arc::new(move |node_id| {
            let manager = manager.clone();
            Box::pin(async move {
                if manager.probe_replica(&node_id).await {
                    manager.sync_with_replicas().await;
                    true
                } else {
                    false
                }
            })
        }));
    }

    pub async fn start(&self) -> Result<()> {
        self.node.start().await?;
        self.fleet.start().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(shutdown_tx);

        let mut tasks = self.background_tasks.lock().await;
        if !self.clients.is_empty() {
            tasks.push(tokio::spawn(Self::heartbeat_loop(
                self.config.node_id.clone(),
                self.config.heartbeat_interval,
                self.clients.clone(),
                self.fleet.clone(),
                shutdown_rx.clone(),
            )));
        }
        if let Some(replication) = &self.replication {
            tasks.push(tokio::spawn(Self::sync_loop(
                self.config.sync_interval,
                replication.clone(),
                shutdown_rx,
            )));
        }

        info!(node = %self.config.node_id, role = %self.config.role, "service node running");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(true);
        }
        for task in self.background_tasks.lock().await.drain(..) {
            task.abort();
            let _ = task.await;
        }
        self.fleet.stop().await;
        for client in &self.clients {
            client.close_all().await;
        }
        self.node.stop().await?;
        info!(node = %self.config.node_id, "service node stopped");
        Ok(())
    }

    async fn heartbeat_loop(
        node_id: String,
        period: std::time::Duration,
        clients: Vec<Arc<PeerClient>>,
        fleet: FaultToleranceManager,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {}
            }
            let heartbeat = Request::Heartbeat {
                node_id: node_id.clone(),
            };
            for client in &clients {
                for (peer, delivered) in client.broadcast(&heartbeat).await {
                    if delivered {
                        fleet.update_heartbeat(&peer).await;
                    } else {
                        warn!(peer = %peer, "heartbeat not delivered");
                    }
                }
            }
        }
    }

    async fn sync_loop(
        period: std::time::Duration,
        replication: ReplicationManager,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a freshly started
        // node does not sync before its peers are up.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    replication.sync_with_replicas().await;
                }
            }
        }
    }

    pub async fn state(&self) -> NodeState {
        self.node.state().await
    }

    /// Actual listening address once running; useful with port 0.
    pub async fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.node.local_addr().await
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.config.role
    }

    pub fn fleet(&self) -> &FaultToleranceManager {
        &self.fleet
    }

    /// Health-update stream for external watchers, e.g. a dashboard. Events
    /// are fire-and-forget; dropping the receiver just stops delivery.
    pub fn health_events(&self) -> mpsc::UnboundedReceiver<fleet::HealthEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.fleet.set_event_sender(sender);
        receiver
    }

    pub fn replication(&self) -> Option<&ReplicationManager> {
        self.replication.as_ref()
    }

    pub fn role_handler(&self) -> &RoleHandler {
        &self.handler
    }
}
