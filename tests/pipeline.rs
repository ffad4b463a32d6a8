mod common;

use serde_json::json;

use common::{device_connection, node_config, peer};
use network::{NodeRole, Request, Response};
use security::SecurityContext;
use vitalmesh::{RoleHandler, ServiceNode};

/// Drives a reading through the whole fleet: device -> collector ->
/// processor -> storage, with the notifier told about the processed record.
#[tokio::test]
async fn reading_flows_through_the_fleet() {
    let key = SecurityContext::generate_base64_key();

    let notifier = ServiceNode::new(node_config("notify-1", NodeRole::Notifier, &key))
        .await
        .unwrap();
    notifier.start().await.unwrap();
    let notifier_addr = notifier.local_addr().await.unwrap();

    let storage = ServiceNode::new(node_config("store-1", NodeRole::Storage, &key))
        .await
        .unwrap();
    storage.start().await.unwrap();
    let storage_addr = storage.local_addr().await.unwrap();

    let mut processor_config = node_config("proc-1", NodeRole::Processor, &key);
    processor_config.peers = vec![
        peer("store-1", NodeRole::Storage, storage_addr),
        peer("notify-1", NodeRole::Notifier, notifier_addr),
    ];
    let processor = ServiceNode::new(processor_config).await.unwrap();
    processor.start().await.unwrap();
    let processor_addr = processor.local_addr().await.unwrap();

    let mut collector_config = node_config("collect-1", NodeRole::Collector, &key);
    collector_config.peers = vec![peer("proc-1", NodeRole::Processor, processor_addr)];
    let collector = ServiceNode::new(collector_config).await.unwrap();
    collector.start().await.unwrap();
    let collector_addr = collector.local_addr().await.unwrap();

    let device = device_connection(&key, collector_addr.port()).await;
    let reading = json!({"device_id": "hr-7", "heart_rate": 72, "spo2": 98});
    let response = device
        .request(&Request::Data {
            data: reading.clone(),
        })
        .await
        .unwrap();
    let Response::Ok {
        data_id: Some(data_id),
        ..
    } = &response
    else {
        panic!("expected a stored data_id, got {:?}", response);
    };
    let data_id = data_id.clone();

    // The stored record keeps the reading's fields and carries the
    // processor's stamp.
    let stored = storage
        .replication()
        .unwrap()
        .current_version(&data_id)
        .await
        .unwrap();
    assert_eq!(stored.data["device_id"], json!("hr-7"));
    assert_eq!(stored.data["heart_rate"], json!(72));
    assert_eq!(stored.data["spo2"], json!(98));
    assert_eq!(stored.data["processed_by"], json!("proc-1"));

    // Queries against the storage node find it by equality.
    let reader = device_connection(&key, storage_addr.port()).await;
    let response = reader
        .request(&Request::RetrieveData {
            query: json!({"device_id": "hr-7"}),
        })
        .await
        .unwrap();
    let Response::Ok {
        data: Some(matches),
        ..
    } = response
    else {
        panic!("expected query results");
    };
    let matches = matches.as_array().unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["data_id"], json!(data_id));
    assert_eq!(matches[0]["data"], stored.data);

    // The collector remembered the device's latest reading.
    let RoleHandler::Collector(collector_handler) = collector.role_handler() else {
        panic!("collector node without collector handler");
    };
    assert_eq!(collector_handler.latest_reading("hr-7").await, Some(reading));

    // The notifier was told before the device got its response.
    let RoleHandler::Notifier(notifier_handler) = notifier.role_handler() else {
        panic!("notifier node without notifier handler");
    };
    let events = notifier_handler.recent_events().await;
    assert!(events.iter().any(|event| {
        event["event_type"] == json!("notification")
            && event["data"]["event"] == json!("data_processed")
            && event["data"]["data_id"] == json!(data_id)
    }));

    for node in [&collector, &processor, &storage, &notifier] {
        node.stop().await.unwrap();
    }
}

/// A device message the collector does not serve comes back as a structured
/// error, not a dropped connection.
#[tokio::test]
async fn collector_rejects_foreign_messages_gracefully() {
    let key = SecurityContext::generate_base64_key();

    let storage = ServiceNode::new(node_config("store-1", NodeRole::Storage, &key))
        .await
        .unwrap();
    storage.start().await.unwrap();
    let storage_addr = storage.local_addr().await.unwrap();

    let mut processor_config = node_config("proc-1", NodeRole::Processor, &key);
    processor_config.peers = vec![peer("store-1", NodeRole::Storage, storage_addr)];
    let processor = ServiceNode::new(processor_config).await.unwrap();
    processor.start().await.unwrap();
    let processor_addr = processor.local_addr().await.unwrap();

    let mut collector_config = node_config("collect-1", NodeRole::Collector, &key);
    collector_config.peers = vec![peer("proc-1", NodeRole::Processor, processor_addr)];
    let collector = ServiceNode::new(collector_config).await.unwrap();
    collector.start().await.unwrap();
    let collector_addr = collector.local_addr().await.unwrap();

    let device = device_connection(&key, collector_addr.port()).await;
    let response = device
        .request(&Request::RetrieveData { query: json!({}) })
        .await
        .unwrap();
    assert!(matches!(response, Response::Error { .. }));

    // The connection is still usable afterwards.
    let response = device
        .request(&Request::Data {
            data: json!({"device_id": "hr-1", "heart_rate": 64}),
        })
        .await
        .unwrap();
    assert!(response.is_ok());

    for node in [&collector, &processor, &storage] {
        node.stop().await.unwrap();
    }
}
