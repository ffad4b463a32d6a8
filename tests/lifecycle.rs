mod common;

use common::node_config;
use network::{NodeRole, NodeState};
use security::SecurityContext;
use vitalmesh::{ServiceNode, VitalMeshError};

#[tokio::test]
async fn start_stop_cycle_lands_in_stopped() {
    let key = SecurityContext::generate_base64_key();
    let node = ServiceNode::new(node_config("store-1", NodeRole::Storage, &key))
        .await
        .unwrap();

    assert_eq!(node.state().await, NodeState::Stopped);
    node.start().await.unwrap();
    assert_eq!(node.state().await, NodeState::Running);
    assert!(node.local_addr().await.is_some());

    node.stop().await.unwrap();
    assert_eq!(node.state().await, NodeState::Stopped);
    assert!(node.local_addr().await.is_none());

    // Stopping again is a no-op.
    node.stop().await.unwrap();
    assert_eq!(node.state().await, NodeState::Stopped);
}

#[tokio::test]
async fn collector_without_processors_is_rejected() {
    let key = SecurityContext::generate_base64_key();
    let result = ServiceNode::new(node_config("collect-1", NodeRole::Collector, &key)).await;
    assert!(matches!(result, Err(VitalMeshError::InvalidConfig(_))));
}

#[tokio::test]
async fn invalid_fleet_key_is_rejected() {
    let result = ServiceNode::new(node_config(
        "store-1",
        NodeRole::Storage,
        "definitely-not-base64-key-material",
    ))
    .await;
    assert!(matches!(result, Err(VitalMeshError::Security(_))));
}
