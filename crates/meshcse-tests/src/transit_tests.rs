//! Transit routing through the middle node

use crate::harness::*;
use meshcse_federation::sim::SimOp;
use meshcse_federation::{
    FederationError, FederationEvent, NodeType, Operation, ReconcileOutcome, Resource,
    ResourceStore, ResourceType, ResponseStatus,
};
use serde_json::json;

const HOST_B: &str = "http://hostB:8080";

fn with_node_b(topology: &SimTopology) -> TestNode {
    topology.add_peer("/nodeB", "cse-b", NodeType::Asn, HOST_B);
    let node = topology.mn_node();
    node.ctx
        .bus
        .publish(FederationEvent::ChildRegistered(record_for("/nodeB", "cse-b", HOST_B)));
    node
}

#[tokio::test]
async fn test_provider_relative_target_is_retrieved_from_owner() {
    let topology = SimTopology::with_registrar();
    let node = with_node_b(&topology);

    node.router
        .forward(Operation::Retrieve, "provider/nodeB/sensor1", "originatorX", None)
        .await
        .unwrap();

    let calls = topology.net().calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].op, SimOp::Retrieve);
    assert_eq!(calls[0].url, "http://hostB:8080/~/sensor1");
    assert_eq!(calls[0].originator, "originatorX");
}

#[tokio::test]
async fn test_remote_answer_is_relayed_unchanged() {
    let topology = SimTopology::with_registrar();
    let node = with_node_b(&topology);
    let sensor = topology
        .peer(HOST_B)
        .store()
        .create(
            Resource::new(ResourceType::Container, "", "sensor1", "").with_attr("mni", 5),
            "nodeB",
        )
        .await
        .unwrap();

    let found = node
        .router
        .forward(Operation::Retrieve, &format!("/nodeB/{}", sensor.ri), "/x", None)
        .await
        .unwrap();
    assert_eq!(found.status, ResponseStatus::Ok);
    assert_eq!(found.body_str("rn"), Some("sensor1"));

    let missing = node
        .router
        .forward(Operation::Retrieve, "/nodeB/nothing", "/x", None)
        .await
        .unwrap();
    assert_eq!(missing.status, ResponseStatus::NotFound);
}

#[tokio::test]
async fn test_create_update_delete_round() {
    let topology = SimTopology::with_registrar();
    let node = with_node_b(&topology);

    let created = node
        .router
        .forward(
            Operation::Create {
                ty: ResourceType::Container,
            },
            "/nodeB/cse-b",
            "/x",
            Some(json!({"rn": "box"})),
        )
        .await
        .unwrap();
    assert_eq!(created.status, ResponseStatus::Created);
    let ri = created.body_str("ri").unwrap().to_string();
    let target = format!("/nodeB/{}", ri);

    let updated = node
        .router
        .forward(Operation::Update, &target, "/x", Some(json!({"lbl": ["a"]})))
        .await
        .unwrap();
    assert_eq!(updated.status, ResponseStatus::Updated);

    let deleted = node
        .router
        .forward(Operation::Delete, &target, "/x", None)
        .await
        .unwrap();
    assert_eq!(deleted.status, ResponseStatus::Deleted);
    assert!(topology.peer(HOST_B).resource(&ri).await.is_none());
    assert_eq!(node.ctx.metrics.snapshot().transit_forwards, 3);
}

#[tokio::test]
async fn test_requests_for_the_registrar_go_upstream() {
    let topology = SimTopology::with_registrar();
    let node = topology.mn_node();
    assert_eq!(node.reconciler.tick().await, ReconcileOutcome::Registered);
    topology.net().clear_calls();

    assert!(node.router.is_transit_target("/id-in/cnt1"));
    node.router
        .forward(Operation::Retrieve, "/id-in/cnt1", "/x", None)
        .await
        .unwrap();

    assert_eq!(topology.net().calls()[0].url, "http://in.test:8080/~/cnt1");
}

#[tokio::test]
async fn test_grandchild_is_reached_through_its_parent() {
    let topology = SimTopology::with_registrar();
    let node = topology.mn_node();
    let mut child = topology
        .add_child(&node.ctx.config, ASN_ID, ASN_NAME, ASN_POA)
        .await
        .unwrap();
    child.descendant_ids = vec!["/id-deep".to_string()];
    node.accept_child(child).await.unwrap();

    node.router
        .forward(Operation::Retrieve, "/id-deep/cnt9", "/x", None)
        .await
        .unwrap();

    assert_eq!(
        topology.net().calls()[0].url,
        "http://asn.test:8082/~/id-deep/cnt9"
    );
}

#[tokio::test]
async fn test_local_and_unknown_targets() {
    let topology = SimTopology::with_registrar();
    let node = with_node_b(&topology);

    assert!(!node.router.is_transit_target("/id-mn/cnt1"));
    assert!(!node.router.is_transit_target("cnt1"));
    let result = node
        .router
        .forward(Operation::Retrieve, "/id-nowhere/cnt1", "/x", None)
        .await;
    assert!(matches!(result, Err(FederationError::NotFound { .. })));
    assert!(topology.net().calls().is_empty());
}
