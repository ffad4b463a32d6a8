use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::debug;

/// Least-loaded dispatch over a set of worker peers.
///
/// Load is the number of requests currently in flight per peer. Selection
/// picks among the minimum-load peers uniformly at random so a cold start
/// does not pin all traffic on whichever peer sorts first.
#[derive(Clone, Default)]
pub struct LoadBalancer {
    loads: Arc<Mutex<HashMap<String, u64>>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_node(&self, node_id: &str) {
        self.loads
            .lock()
            .await
            .entry(node_id.to_string())
            .or_insert(0);
    }

    pub async fn remove_node(&self, node_id: &str) {
        self.loads.lock().await.remove(node_id);
    }

    /// Picks a least-loaded peer, or `None` when no peers are registered.
    /// Does not charge the pick; call [`LoadBalancer::register_request`]
    /// once the request is actually dispatched.
    pub async fn get_next_node(&self) -> Option<String> {
        let loads = self.loads.lock().await;
        let min = *loads.values().min()?;
        let candidates: Vec<&String> = loads
            .iter()
            .filter(|(_, load)| **load == min)
            .map(|(id, _)| id)
            .collect();
        let chosen = candidates.choose(&mut rand::thread_rng())?.to_string();
        debug!(node = %chosen, load = min, "selected worker");
        Some(chosen)
    }

    pub async fn register_request(&self, node_id: &str) {
        let mut loads = self.loads.lock().await;
        *loads.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// Marks a dispatched request finished. A peer that was removed and
    /// re-added in between simply stays at zero.
    pub async fn complete_request(&self, node_id: &str) {
        let mut loads = self.loads.lock().await;
        if let Some(load) = loads.get_mut(node_id) {
            *load = load.saturating_sub(1);
        }
    }

    pub async fn node_count(&self) -> usize {
        self.loads.lock().await.len()
    }

    pub async fn clear(&self) {
        self.loads.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_pool_yields_none() {
        let balancer = LoadBalancer::new();
        assert_eq!(balancer.get_next_node().await, None);
    }

    #[tokio::test]
    async fn least_loaded_node_is_preferred() {
        let balancer = LoadBalancer::new();
        balancer.add_node("busy").await;
        balancer.add_node("idle").await;
        balancer.register_request("busy").await;
        balancer.register_request("busy").await;

        for _ in 0..20 {
            assert_eq!(balancer.get_next_node().await.as_deref(), Some("idle"));
        }
    }

    #[tokio::test]
    async fn completion_releases_load() {
        let balancer = LoadBalancer::new();
        balancer.add_node("a").await;
        balancer.add_node("b").await;
        balancer.register_request("a").await;
        assert_eq!(balancer.get_next_node().await.as_deref(), Some("b"));

        balancer.register_request("b").await;
        balancer.register_request("b").await;
        balancer.complete_request("a").await;
        assert_eq!(balancer.get_next_node().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn charged_picks_spread_across_equal_peers() {
        let balancer = LoadBalancer::new();
        for id in ["w1", "w2", "w3"] {
            balancer.add_node(id).await;
        }

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..9 {
            let node = balancer.get_next_node().await.unwrap();
            balancer.register_request(&node).await;
            *counts.entry(node).or_insert(0) += 1;
        }
        // With picks charged, a round of nine lands exactly three per peer.
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 3));
    }

    #[tokio::test]
    async fn completion_for_removed_node_is_harmless() {
        let balancer = LoadBalancer::new();
        balancer.add_node("gone").await;
        balancer.remove_node("gone").await;
        balancer.complete_request("gone").await;
        assert_eq!(balancer.node_count().await, 0);
    }
}
