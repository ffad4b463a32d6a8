mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use common::{device_connection, node_config, peer};
use network::{
    HandlerError, MessageHandler, NodeIdentity, NodeRole, Request, Response,
};
use security::{SecurityContext, TransportSecurity};
use vitalmesh::{PeerClient, ServiceNode};

/// With one storage peer gone, the processor's writes keep succeeding
/// through the surviving peer.
#[tokio::test]
async fn processor_fails_over_to_surviving_storage() {
    let key = SecurityContext::generate_base64_key();

    let storage_a = ServiceNode::new(node_config("store-a", NodeRole::Storage, &key))
        .await
        .unwrap();
    storage_a.start().await.unwrap();
    let addr_a = storage_a.local_addr().await.unwrap();

    let storage_b = ServiceNode::new(node_config("store-b", NodeRole::Storage, &key))
        .await
        .unwrap();
    storage_b.start().await.unwrap();
    let addr_b = storage_b.local_addr().await.unwrap();

    let mut processor_config = node_config("proc-1", NodeRole::Processor, &key);
    processor_config.peers = vec![
        peer("store-a", NodeRole::Storage, addr_a),
        peer("store-b", NodeRole::Storage, addr_b),
    ];
    let processor = ServiceNode::new(processor_config).await.unwrap();
    processor.start().await.unwrap();
    let processor_addr = processor.local_addr().await.unwrap();

    let device = device_connection(&key, processor_addr.port()).await;

    // Warm the pool while both peers are up.
    let response = device
        .request(&Request::Data {
            data: json!({"device_id": "hr-1", "heart_rate": 61}),
        })
        .await
        .unwrap();
    assert!(response.is_ok());

    storage_a.stop().await.unwrap();

    // Every subsequent write must succeed and can only land on store-b.
    let mut stored_ids = Vec::new();
    for beat in 0..3 {
        let response = device
            .request(&Request::Data {
                data: json!({"device_id": "hr-1", "heart_rate": 70 + beat}),
            })
            .await
            .unwrap();
        let Response::Ok {
            data_id: Some(data_id),
            ..
        } = &response
        else {
            panic!("write failed after storage loss: {:?}", response);
        };
        stored_ids.push(data_id.clone());
    }

    let replication_b = storage_b.replication().unwrap();
    for data_id in &stored_ids {
        assert!(
            replication_b.current_version(data_id).await.is_some(),
            "record {} missing from surviving storage",
            data_id
        );
    }

    processor.stop().await.unwrap();
    storage_b.stop().await.unwrap();
}

/// When every storage peer is unreachable the processor answers with a
/// structured error naming the exhausted pool.
#[tokio::test]
async fn exhausted_storage_pool_is_a_structured_error() {
    let key = SecurityContext::generate_base64_key();

    let storage = ServiceNode::new(node_config("store-a", NodeRole::Storage, &key))
        .await
        .unwrap();
    storage.start().await.unwrap();
    let addr = storage.local_addr().await.unwrap();

    let mut processor_config = node_config("proc-1", NodeRole::Processor, &key);
    processor_config.peers = vec![peer("store-a", NodeRole::Storage, addr)];
    let processor = ServiceNode::new(processor_config).await.unwrap();
    processor.start().await.unwrap();
    let processor_addr = processor.local_addr().await.unwrap();

    storage.stop().await.unwrap();

    let device = device_connection(&key, processor_addr.port()).await;
    let response = device
        .request(&Request::Data {
            data: json!({"device_id": "hr-1", "heart_rate": 88}),
        })
        .await
        .unwrap();
    let Response::Error { message } = response else {
        panic!("expected an error once all storage peers are gone");
    };
    assert!(message.contains("no available peer"));

    processor.stop().await.unwrap();
}

/// Echoes data messages, stalling past the caller's request timeout on the
/// first one.
struct SlowFirstEcho {
    stalled: AtomicBool,
    delay: Duration,
}

#[async_trait]
impl MessageHandler for SlowFirstEcho {
    async fn handle(
        &self,
        _peer: Option<&NodeIdentity>,
        request: Request,
    ) -> Result<Response, HandlerError> {
        match request {
            Request::Data { data } => {
                if !self.stalled.swap(true, Ordering::SeqCst) {
                    tokio::time::sleep(self.delay).await;
                }
                Ok(Response::ok_with_data(data))
            }
            _ => Err("unsupported operation".into()),
        }
    }
}

/// Answers every heartbeat after a fixed delay.
struct SlowHeartbeat {
    delay: Duration,
}

#[async_trait]
impl MessageHandler for SlowHeartbeat {
    async fn handle(
        &self,
        _peer: Option<&NodeIdentity>,
        request: Request,
    ) -> Result<Response, HandlerError> {
        match request {
            Request::Heartbeat { .. } => {
                tokio::time::sleep(self.delay).await;
                Ok(Response::ok())
            }
            _ => Err("unsupported operation".into()),
        }
    }
}

fn plain_config(node_id: &str, role: NodeRole) -> network::Config {
    let identity = NodeIdentity::new(node_id, role, "127.0.0.1", 0);
    network::Config::new(identity, TransportSecurity::Plain)
}

/// A response arriving after the request timeout must never be paired with
/// a later request: the client discards the stalled connection and retries
/// on a fresh one, so every request gets its own answer.
#[tokio::test]
async fn late_response_is_not_paired_with_next_request() {
    let context = Arc::new(SecurityContext::new(&SecurityContext::generate_key()));
    let server = network::Node::new(
        plain_config("store-a", NodeRole::Storage),
        context.clone(),
        Arc::new(SlowFirstEcho {
            stalled: AtomicBool::new(false),
            delay: Duration::from_millis(400),
        }),
    );
    server.start().await.unwrap();
    let addr = server.local_addr().await.unwrap();

    let mut client_config = plain_config("proc-1", NodeRole::Processor);
    client_config.request_timeout = Duration::from_millis(150);
    let pool = PeerClient::new("storage pool", client_config, context);
    pool.add_peer(peer("store-a", NodeRole::Storage, addr)).await;

    let first = pool
        .request(&Request::Data {
            data: json!({"seq": 1}),
        })
        .await
        .unwrap();
    assert_eq!(first, Response::ok_with_data(json!({"seq": 1})));

    let second = pool
        .request(&Request::Data {
            data: json!({"seq": 2}),
        })
        .await
        .unwrap();
    assert_eq!(second, Response::ok_with_data(json!({"seq": 2})));

    pool.close_all().await;
    server.stop().await.unwrap();
}

/// Heartbeats fan out to every peer at once; one slow peer does not hold
/// up delivery to the rest.
#[tokio::test]
async fn heartbeat_broadcast_fans_out_concurrently() {
    let context = Arc::new(SecurityContext::new(&SecurityContext::generate_key()));
    let delay = Duration::from_millis(300);

    let store_a = network::Node::new(
        plain_config("store-a", NodeRole::Storage),
        context.clone(),
        Arc::new(SlowHeartbeat { delay }),
    );
    store_a.start().await.unwrap();
    let addr_a = store_a.local_addr().await.unwrap();

    let store_b = network::Node::new(
        plain_config("store-b", NodeRole::Storage),
        context.clone(),
        Arc::new(SlowHeartbeat { delay }),
    );
    store_b.start().await.unwrap();
    let addr_b = store_b.local_addr().await.unwrap();

    let pool = PeerClient::new("storage pool", plain_config("proc-1", NodeRole::Processor), context);
    pool.add_peer(peer("store-a", NodeRole::Storage, addr_a)).await;
    pool.add_peer(peer("store-b", NodeRole::Storage, addr_b)).await;

    let started = tokio::time::Instant::now();
    let results = pool
        .broadcast(&Request::Heartbeat {
            node_id: "proc-1".to_string(),
        })
        .await;
    let elapsed = started.elapsed();

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, delivered)| *delivered));
    // Sequential delivery would take at least two full delays.
    assert!(
        elapsed < delay * 2,
        "broadcast took {:?}, expected concurrent fan-out",
        elapsed
    );

    pool.close_all().await;
    store_a.stop().await.unwrap();
    store_b.stop().await.unwrap();
}
