//! Registration and liveliness scenarios
//!
//! The node under test is the middle node; its registrar and children are
//! simulated peers.

use crate::harness::*;
use meshcse_federation::events::drain;
use meshcse_federation::sim::SimOp;
use meshcse_federation::{
    FederationEvent, ReconcileOutcome, RemoteResponse, ResourceStore, ResponseStatus,
};

const RECORD_URL: &str = "http://in.test:8080/~/id-in/id-mn";
const BASE_URL: &str = "http://in.test:8080/~/id-in/cse-in";

#[tokio::test]
async fn test_stray_remote_record_is_deleted_and_recreated() {
    let topology = SimTopology::with_registrar();
    let stale = record_for(MN_ID, MN_NAME, "http://mn.old:9999");
    topology
        .registrar()
        .store()
        .create(stale.to_resource("id-in"), "id-in")
        .await
        .unwrap();
    let node = topology.mn_node();
    let mut rx = node.ctx.bus.subscribe();

    assert_eq!(node.reconciler.tick().await, ReconcileOutcome::Registered);

    let calls = topology.net().calls();
    assert_eq!(calls[0].op, SimOp::Delete);
    assert_eq!(calls[0].url, RECORD_URL);
    assert_eq!(calls[1].op, SimOp::Create);
    assert_eq!(calls[1].url, BASE_URL);
    let remote = topology.registrar().resource("id-mn").await.unwrap();
    assert_eq!(remote.attr_str_list("poa"), vec![MN_POA]);
    assert!(node.ctx.state.own_record_at_registrar().is_some());
    assert_eq!(event_kinds(&drain(&mut rx)), vec!["registered-to-parent"]);
}

#[tokio::test]
async fn test_remote_record_not_found_deregisters_once() {
    let topology = SimTopology::with_registrar();
    let node = topology.mn_node();
    assert_eq!(node.reconciler.tick().await, ReconcileOutcome::Registered);
    topology.net().force_response(
        SimOp::Retrieve,
        RECORD_URL,
        RemoteResponse::status(ResponseStatus::NotFound),
    );
    topology.net().force_response(
        SimOp::Create,
        BASE_URL,
        RemoteResponse::status(ResponseStatus::OriginatorHasNoPrivilege),
    );
    let mut rx = node.ctx.bus.subscribe();

    assert_eq!(node.reconciler.tick().await, ReconcileOutcome::Deregistered);

    assert!(node.ctx.store.get("id-in").await.is_err());
    assert!(!node.ctx.state.is_registered());
    assert!(node.ctx.state.registrar_record().is_none());
    assert_eq!(event_kinds(&drain(&mut rx)), vec!["deregistered-from-parent"]);
}

#[tokio::test]
async fn test_registration_recovers_after_registrar_outage() {
    let topology = SimTopology::with_registrar();
    let node = topology.mn_node();
    topology.net().set_unreachable(IN_POA, true);
    assert_eq!(node.reconciler.tick().await, ReconcileOutcome::Unreachable);
    assert!(!node.ctx.state.is_registered());

    topology.net().set_unreachable(IN_POA, false);
    assert_eq!(node.reconciler.tick().await, ReconcileOutcome::Registered);
    assert_eq!(node.reconciler.tick().await, ReconcileOutcome::InSync);
    assert!(node.ctx.state.is_registered());
}

#[tokio::test]
async fn test_registrar_is_never_a_descendant() {
    let topology = SimTopology::with_registrar();
    let node = topology.mn_node();
    let registrar = record_for(IN_ID, IN_NAME, IN_POA);

    node.ctx
        .bus
        .publish(FederationEvent::ChildRegistered(registrar.clone()));
    assert!(node.ctx.state.descendant_records().is_empty());

    assert_eq!(node.reconciler.tick().await, ReconcileOutcome::Registered);
    node.ctx
        .bus
        .publish(FederationEvent::ChildRegistered(registrar.clone()));
    node.ctx.bus.publish(FederationEvent::ChildRegistered(registrar));
    assert!(node.ctx.state.descendant("/id-in").is_none());
    assert_eq!(node.ctx.state.descendant_count(), 0);
}

#[tokio::test]
async fn test_children_are_reported_upstream() {
    let topology = SimTopology::with_registrar();
    let node = topology.mn_node();
    assert_eq!(node.reconciler.tick().await, ReconcileOutcome::Registered);
    let child = topology
        .add_child(&node.ctx.config, ASN_ID, ASN_NAME, ASN_POA)
        .await
        .unwrap();
    node.accept_child(child).await.unwrap();
    topology.net().clear_calls();

    assert_eq!(node.reconciler.tick().await, ReconcileOutcome::InSync);

    let updates = topology.net().calls_of(SimOp::Update);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].url, RECORD_URL);
    let remote = topology.registrar().resource("id-mn").await.unwrap();
    assert_eq!(remote.attr_str_list("dcse"), vec![ASN_ID]);
}

#[tokio::test]
async fn test_unresponsive_child_is_pruned_after_one_tick() {
    let topology = SimTopology::with_registrar();
    let node = topology.mn_node();
    let child = topology
        .add_child(&node.ctx.config, ASN_ID, ASN_NAME, ASN_POA)
        .await
        .unwrap();
    node.accept_child(child.clone()).await.unwrap();
    assert_eq!(node.ctx.state.descendant_count(), 1);
    topology.net().set_unreachable(ASN_POA, true);
    let mut rx = node.ctx.bus.subscribe();

    let pruned = node.prober.tick().await;

    assert_eq!(pruned, vec![child.clone()]);
    assert!(node.ctx.state.descendant(ASN_ID).is_none());
    assert!(node.ctx.state.descendant_records().is_empty());
    assert!(node.ctx.store.get(&child.resource_id).await.is_err());
    assert_eq!(event_kinds(&drain(&mut rx)), vec!["child-deregistered"]);
}

#[tokio::test]
async fn test_healthy_child_survives_probing() {
    let topology = SimTopology::with_registrar();
    let node = topology.mn_node();
    let child = topology
        .add_child(&node.ctx.config, ASN_ID, ASN_NAME, ASN_POA)
        .await
        .unwrap();
    node.accept_child(child).await.unwrap();

    for _ in 0..3 {
        assert!(node.prober.tick().await.is_empty());
    }
    assert_eq!(node.ctx.state.descendant_count(), 1);
    assert_eq!(node.ctx.metrics.snapshot().probe_ticks, 3);
}
