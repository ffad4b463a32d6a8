use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Invoked when a failed peer is given a recovery attempt (and, with the
/// result ignored, when a backup drops out and a resynchronization may be
/// wanted). Returns whether the peer is healthy again.
pub type RecoveryCallback = Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>;

/// Invoked with `(old_primary, new_primary)` after a successful promotion.
pub type FailoverCallback = Arc<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Active,
    Degraded,
    Failed,
    Recovering,
}

#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub state: HealthState,
    pub last_heartbeat: Instant,
    pub failure_count: u32,
    pub recovery_attempts: u32,
    pub last_recovery: Option<Instant>,
}

impl NodeHealth {
    fn new() -> Self {
        Self {
            state: HealthState::Active,
            last_heartbeat: Instant::now(),
            failure_count: 0,
            recovery_attempts: 0,
            last_recovery: None,
        }
    }
}

/// Fire-and-forget health push consumed by the dashboard collaborator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealthEvent {
    StateChanged {
        node_id: String,
        state: HealthState,
        at: DateTime<Utc>,
    },
    FailoverCompleted {
        old_primary: String,
        new_primary: String,
        at: DateTime<Utc>,
    },
    PrimaryVacant {
        failed_primary: String,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct FaultToleranceConfig {
    pub heartbeat_timeout: Duration,
    pub monitor_period: Duration,
    pub max_recovery_attempts: u32,
    pub recovery_cooldown: Duration,
}

impl Default for FaultToleranceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            monitor_period: Duration::from_secs(1),
            max_recovery_attempts: 3,
            recovery_cooldown: Duration::from_secs(300),
        }
    }
}

/// Health map plus role assignment, all behind one mutex: the monitor loop
/// and externally triggered failure handling never race on a NodeHealth
/// entry.
struct FleetState {
    nodes: HashMap<String, NodeHealth>,
    primary_node: Option<String>,
    backup_nodes: BTreeSet<String>,
}

/// What a failure-handling pass decided while the lock was held; callbacks
/// fire after release so they can call back into the manager.
enum FailureOutcome {
    Promoted { old_primary: String, new_primary: String },
    PrimaryVacant,
    BackupDropped,
    NotTracked,
}

/// Tracks peer health, detects heartbeat timeouts, promotes backups, and
/// schedules bounded recovery attempts.
#[derive(Clone)]
pub struct FaultToleranceManager {
    node_id: Arc<str>,
    config: FaultToleranceConfig,
    state: Arc<Mutex<FleetState>>,
    failover_callback: Arc<RwLock<Option<FailoverCallback>>>,
    recovery_callback: Arc<RwLock<Option<RecoveryCallback>>>,
    events: Arc<RwLock<Option<mpsc::UnboundedSender<HealthEvent>>>>,
    monitor_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown: Arc<Mutex<Option<watch::Sender<bool>>>>,
}

impl FaultToleranceManager {
    pub fn new(node_id: impl Into<String>, config: FaultToleranceConfig) -> Self {
        Self {
            node_id: node_id.into().into(),
            config,
            state: Arc::new(Mutex::new(FleetState {
                nodes: HashMap::new(),
                primary_node: None,
                backup_nodes: BTreeSet::new(),
            })),
            failover_callback: Arc::new(RwLock::new(None)),
            recovery_callback: Arc::new(RwLock::new(None)),
            events: Arc::new(RwLock::new(None)),
            monitor_task: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_failover_callback(&self, callback: FailoverCallback) {
        *self.failover_callback.write().expect("callback lock poisoned") = Some(callback);
    }

    pub fn set_recovery_callback(&self, callback: RecoveryCallback) {
        *self.recovery_callback.write().expect("callback lock poisoned") = Some(callback);
    }

    /// Registers the health-update sink (the dashboard push).
    pub fn set_event_sender(&self, sender: mpsc::UnboundedSender<HealthEvent>) {
        *self.events.write().expect("events lock poisoned") = Some(sender);
    }

    /// Starts the periodic health monitor.
    pub async fn start(&self) {
        let mut monitor = self.monitor_task.lock().await;
        if monitor.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(shutdown_tx);

        let manager = self.clone();
        *monitor = Some(tokio::spawn(async move {
            manager.monitor_loop(shutdown_rx).await;
        }));
        info!(node = %self.node_id, "fault tolerance monitor started");
    }

    /// Stops the monitor; no monitor tick runs past this returning.
    pub async fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.monitor_task.lock().await.take() {
            let _ = task.await;
        }
        info!(node = %self.node_id, "fault tolerance monitor stopped");
    }

    pub async fn register_node(&self, node_id: &str, is_primary: bool) {
        let mut state = self.state.lock().await;
        state.nodes.insert(node_id.to_string(), NodeHealth::new());
        if is_primary {
            if let Some(previous) = state.primary_node.replace(node_id.to_string()) {
                if previous != node_id {
                    state.backup_nodes.insert(previous);
                }
            }
            state.backup_nodes.remove(node_id);
        } else if state.primary_node.as_deref() != Some(node_id) {
            state.backup_nodes.insert(node_id.to_string());
        }
        info!(
            node = node_id,
            role = if is_primary { "primary" } else { "backup" },
            "registered peer"
        );
    }

    pub async fn unregister_node(&self, node_id: &str) {
        let mut state = self.state.lock().await;
        state.nodes.remove(node_id);
        state.backup_nodes.remove(node_id);
        if state.primary_node.as_deref() == Some(node_id) {
            state.primary_node = None;
        }
        info!(node = node_id, "unregistered peer");
    }

    pub async fn update_heartbeat(&self, node_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(health) = state.nodes.get_mut(node_id) {
            health.last_heartbeat = Instant::now();
        }
    }

    pub async fn primary_node(&self) -> Option<String> {
        self.state.lock().await.primary_node.clone()
    }

    pub async fn backup_nodes(&self) -> Vec<String> {
        self.state.lock().await.backup_nodes.iter().cloned().collect()
    }

    pub async fn node_health(&self, node_id: &str) -> Option<NodeHealth> {
        self.state.lock().await.nodes.get(node_id).cloned()
    }

    /// Marks a peer failed and runs failure handling: primary promotion or
    /// backup removal, then a recovery attempt when the policy allows one.
    /// Safe to call from outside the monitor; both paths share the same
    /// critical section.
    pub async fn handle_node_failure(&self, failed_node_id: &str) {
        let outcome = {
            let mut state = self.state.lock().await;
            if !state.nodes.contains_key(failed_node_id) {
                FailureOutcome::NotTracked
            } else {
                let health = state
                    .nodes
                    .get_mut(failed_node_id)
                    .expect("entry checked above");
                health.failure_count += 1;
                health.state = HealthState::Failed;
                warn!(node = failed_node_id, "peer failure detected");

                if state.primary_node.as_deref() == Some(failed_node_id) {
                    self.promote_backup(&mut state, failed_node_id)
                } else if state.backup_nodes.remove(failed_node_id) {
                    info!(node = failed_node_id, "removed failed backup");
                    FailureOutcome::BackupDropped
                } else {
                    FailureOutcome::BackupDropped
                }
            }
        };

        match outcome {
            FailureOutcome::NotTracked => return,
            FailureOutcome::Promoted {
                old_primary,
                new_primary,
            } => {
                self.emit(HealthEvent::StateChanged {
                    node_id: old_primary.clone(),
                    state: HealthState::Failed,
                    at: Utc::now(),
                });
                self.emit(HealthEvent::FailoverCompleted {
                    old_primary: old_primary.clone(),
                    new_primary: new_primary.clone(),
                    at: Utc::now(),
                });
                let callback = self
                    .failover_callback
                    .read()
                    .expect("callback lock poisoned")
                    .clone();
                if let Some(callback) = callback {
                    callback(old_primary, new_primary).await;
                }
            }
            FailureOutcome::PrimaryVacant => {
                self.emit(HealthEvent::StateChanged {
                    node_id: failed_node_id.to_string(),
                    state: HealthState::Failed,
                    at: Utc::now(),
                });
                self.emit(HealthEvent::PrimaryVacant {
                    failed_primary: failed_node_id.to_string(),
                    at: Utc::now(),
                });
            }
            FailureOutcome::BackupDropped => {
                self.emit(HealthEvent::StateChanged {
                    node_id: failed_node_id.to_string(),
                    state: HealthState::Failed,
                    at: Utc::now(),
                });
                // Resynchronization trigger; the result does not matter here.
                let callback = self
                    .recovery_callback
                    .read()
                    .expect("callback lock poisoned")
                    .clone();
                if let Some(callback) = callback {
                    let _ = callback(failed_node_id.to_string()).await;
                }
            }
        }

        self.attempt_recovery(failed_node_id).await;
    }

    /// Promotes the lexicographically smallest ACTIVE backup. Leaving the
    /// primary slot empty when no backup qualifies is a degraded mode, not a
    /// crash.
    fn promote_backup(&self, state: &mut FleetState, failed_primary: &str) -> FailureOutcome {
        let candidate = state
            .backup_nodes
            .iter()
            .find(|id| {
                state
                    .nodes
                    .get(*id)
                    .map(|h| h.state == HealthState::Active)
                    .unwrap_or(false)
            })
            .cloned();

        match candidate {
            Some(new_primary) => {
                state.primary_node = Some(new_primary.clone());
                state.backup_nodes.remove(&new_primary);
                info!(
                    old_primary = failed_primary,
                    new_primary = %new_primary,
                    "promoted backup to primary"
                );
                FailureOutcome::Promoted {
                    old_primary: failed_primary.to_string(),
                    new_primary,
                }
            }
            None => {
                state.primary_node = None;
                error!(
                    old_primary = failed_primary,
                    "no active backup available for promotion; primary left vacant"
                );
                FailureOutcome::PrimaryVacant
            }
        }
    }

    /// Runs one recovery attempt when the peer is FAILED and the attempt
    /// budget and cooldown permit. The attempt is charged regardless of its
    /// outcome.
    async fn attempt_recovery(&self, node_id: &str) {
        let eligible = {
            let mut state = self.state.lock().await;
            match state.nodes.get_mut(node_id) {
                Some(health)
                    if health.state == HealthState::Failed
                        && health.recovery_attempts < self.config.max_recovery_attempts
                        && health
                            .last_recovery
                            .map(|t| t.elapsed() > self.config.recovery_cooldown)
                            .unwrap_or(true) =>
                {
                    health.state = HealthState::Recovering;
                    health.recovery_attempts += 1;
                    health.last_recovery = Some(Instant::now());
                    true
                }
                _ => false,
            }
        };
        if !eligible {
            return;
        }

        self.emit(HealthEvent::StateChanged {
            node_id: node_id.to_string(),
            state: HealthState::Recovering,
            at: Utc::now(),
        });

        let callback = self
            .recovery_callback
            .read()
            .expect("callback lock poisoned")
            .clone();
        let recovered = match callback {
            Some(callback) => callback(node_id.to_string()).await,
            None => false,
        };

        let state_now = {
            let mut state = self.state.lock().await;
            match state.nodes.get_mut(node_id) {
                Some(health) => {
                    if recovered {
                        health.state = HealthState::Active;
                        health.failure_count = 0;
                        health.last_heartbeat = Instant::now();
                        info!(node = node_id, "peer recovered");
                    } else {
                        health.state = HealthState::Failed;
                        warn!(
                            node = node_id,
                            attempt = health.recovery_attempts,
                            budget = self.config.max_recovery_attempts,
                            "recovery attempt failed"
                        );
                    }
                    Some(health.state)
                }
                None => None,
            }
        };
        if let Some(state_now) = state_now {
            self.emit(HealthEvent::StateChanged {
                node_id: node_id.to_string(),
                state: state_now,
                at: Utc::now(),
            });
        }
    }

    async fn monitor_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.monitor_period);
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

            let timed_out: Vec<String> = {
                let state = self.state.lock().await;
                state
                    .nodes
                    .iter()
                    .filter(|(_, health)| {
                        health.state == HealthState::Active
                            && health.last_heartbeat.elapsed() > self.config.heartbeat_timeout
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for node_id in timed_out {
                self.handle_node_failure(&node_id).await;
            }

            // Failed peers with budget left get retried once the cooldown
            // elapses.
            let retryable: Vec<String> = {
                let state = self.state.lock().await;
                state
                    .nodes
                    .iter()
                    .filter(|(_, health)| {
                        health.state == HealthState::Failed
                            && health.recovery_attempts < self.config.max_recovery_attempts
                            && health
                                .last_recovery
                                .map(|t| t.elapsed() > self.config.recovery_cooldown)
                                .unwrap_or(true)
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for node_id in retryable {
                self.attempt_recovery(&node_id).await;
            }
        }
    }

    fn emit(&self, event: HealthEvent) {
        if let Some(sender) = self.events.read().expect("events lock poisoned").as_ref() {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::time::sleep;

    fn fast_config() -> FaultToleranceConfig {
        FaultToleranceConfig {
            heartbeat_timeout: Duration::from_millis(50),
            monitor_period: Duration::from_millis(10),
            max_recovery_attempts: 3,
            recovery_cooldown: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn primary_timeout_promotes_smallest_active_backup() {
        let manager = FaultToleranceManager::new("self", fast_config());
        manager.register_node("node-a", true).await;
        manager.register_node("node-c", false).await;
        manager.register_node("node-b", false).await;

        let observed: Arc<StdMutex<Vec<(String, String)>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = observed.clone();
        manager.set_failover_callback(Arc::new(move |old, new| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push((old, new));
            })
        }));

        manager.start().await;
        // Keep the backups alive while node-a's heartbeat goes stale.
        for _ in 0..6 {
            sleep(Duration::from_millis(20)).await;
            manager.update_heartbeat("node-b").await;
            manager.update_heartbeat("node-c").await;
        }
        manager.stop().await;

        assert_eq!(manager.primary_node().await.as_deref(), Some("node-b"));
        assert_eq!(manager.backup_nodes().await, vec!["node-c".to_string()]);
        assert_eq!(
            observed.lock().unwrap().first(),
            Some(&("node-a".to_string(), "node-b".to_string()))
        );
    }

    #[tokio::test]
    async fn primary_never_member_of_backups() {
        let manager = FaultToleranceManager::new("self", fast_config());
        manager.register_node("n1", false).await;
        manager.register_node("n1", true).await;
        manager.register_node("n2", false).await;

        assert_eq!(manager.primary_node().await.as_deref(), Some("n1"));
        assert!(!manager.backup_nodes().await.contains(&"n1".to_string()));

        manager.handle_node_failure("n1").await;
        assert_eq!(manager.primary_node().await.as_deref(), Some("n2"));
        assert!(!manager.backup_nodes().await.contains(&"n2".to_string()));
    }

    #[tokio::test]
    async fn no_active_backup_leaves_primary_vacant() {
        let manager = FaultToleranceManager::new("self", fast_config());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        manager.set_event_sender(events_tx);
        manager.register_node("solo", true).await;

        manager.handle_node_failure("solo").await;

        assert_eq!(manager.primary_node().await, None);
        let mut saw_vacant = false;
        while let Ok(event) = events_rx.try_recv() {
            if matches!(event, HealthEvent::PrimaryVacant { .. }) {
                saw_vacant = true;
            }
        }
        assert!(saw_vacant);
    }

    #[tokio::test]
    async fn backup_failure_drops_it_and_triggers_resync() {
        let manager = FaultToleranceManager::new("self", fast_config());
        manager.register_node("primary", true).await;
        manager.register_node("backup", false).await;

        let triggered = Arc::new(AtomicU32::new(0));
        let counter = triggered.clone();
        manager.set_recovery_callback(Arc::new(move |_| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            })
        }));

        manager.handle_node_failure("backup").await;

        assert_eq!(manager.primary_node().await.as_deref(), Some("primary"));
        assert!(manager.backup_nodes().await.is_empty());
        // Once as resync trigger, once as the first recovery attempt.
        assert_eq!(triggered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn recovery_attempts_are_bounded_exactly() {
        let config = FaultToleranceConfig {
            heartbeat_timeout: Duration::from_millis(40),
            monitor_period: Duration::from_millis(10),
            max_recovery_attempts: 3,
            recovery_cooldown: Duration::from_millis(0),
        };
        let manager = FaultToleranceManager::new("self", config);
        manager.register_node("flaky", true).await;

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        manager.set_recovery_callback(Arc::new(move |_| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            })
        }));

        manager.start().await;
        sleep(Duration::from_millis(250)).await;
        manager.stop().await;

        let health = manager.node_health("flaky").await.unwrap();
        assert_eq!(health.state, HealthState::Failed);
        assert_eq!(health.recovery_attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn successful_recovery_restores_active_state() {
        let config = FaultToleranceConfig {
            recovery_cooldown: Duration::from_millis(0),
            ..fast_config()
        };
        let manager = FaultToleranceManager::new("self", config);
        manager.register_node("peer", false).await;
        manager.register_node("primary", true).await;

        manager.set_recovery_callback(Arc::new(|_| Box::pin(async { true })));
        manager.handle_node_failure("peer").await;

        let health = manager.node_health("peer").await.unwrap();
        assert_eq!(health.state, HealthState::Active);
        assert_eq!(health.failure_count, 0);
        assert_eq!(health.recovery_attempts, 1);
    }

    #[tokio::test]
    async fn unregistered_peer_failure_is_ignored() {
        let manager = FaultToleranceManager::new("self", fast_config());
        manager.handle_node_failure("ghost").await;
        assert_eq!(manager.primary_node().await, None);
    }
}
