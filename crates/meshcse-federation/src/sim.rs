//! In-process simulated federation for tests and local experiments.
//!
//! A [`SimNetwork`] hosts any number of simulated peer nodes, each backed by a
//! [`MemoryStore`] and addressed by its point of access. It implements
//! [`RemoteTransport`], records every call, and supports fault injection:
//! unreachable hosts, per-host latency and forced responses.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FederationError, Result};
use crate::store::{MemoryStore, ResourceStore};
use crate::transport::{RemoteResponse, RemoteTransport, ResponseStatus};
use crate::types::{bare_id, NodeId, NodeType, Resource, ResourceType};

/// Kind of a recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    /// `send_create`.
    Create,
    /// `send_retrieve`.
    Retrieve,
    /// `send_update`.
    Update,
    /// `send_delete`.
    Delete,
}

/// One call made through the simulated transport.
#[derive(Debug, Clone, PartialEq)]
pub struct SimCall {
    /// Operation.
    pub op: SimOp,
    /// Full request URL.
    pub url: String,
    /// Originator of the request.
    pub originator: String,
    /// Resource type for creates.
    pub ty: Option<ResourceType>,
    /// Request body for creates and updates.
    pub body: Option<Value>,
}

/// A simulated peer node.
pub struct SimNode {
    node_id: NodeId,
    base_ri: String,
    store: MemoryStore,
}

impl SimNode {
    /// Node id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Resource id of the base resource.
    pub fn base_ri(&self) -> &str {
        &self.base_ri
    }

    /// The node's resource store.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Child of the base resource with the given resource id.
    pub async fn resource(&self, ri: &str) -> Option<Resource> {
        self.store.get(ri).await.ok()
    }

    /// Bump the base resource's modification time.
    pub async fn touch_base(&self) -> Result<()> {
        let base = self.store.get(&self.base_ri).await?;
        self.store.update(base).await?;
        Ok(())
    }

    fn locate(&self, path: &str) -> Option<Resource> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let rest: &[&str] = match segments.first() {
            Some(first) if *first == bare_id(&self.node_id) => &segments[1..],
            _ => &segments[..],
        };
        let all = self.store.all();
        let by_ri = |ri: &str| all.iter().find(|r| r.ri == ri).cloned();

        let base = by_ri(&self.base_ri)?;
        let (mut current, names) = match rest.split_first() {
            None => return Some(base),
            Some((first, names)) if *first == base.rn => (base, names),
            Some((first, names)) => (by_ri(first)?, names),
        };
        for name in names {
            current = self.store.child_by_name(&current.ri, name)?;
        }
        Some(current)
    }
}

#[derive(Default)]
struct Faults {
    unreachable: HashSet<String>,
    latency: HashMap<String, Duration>,
    forced: HashMap<(SimOp, String), RemoteResponse>,
}

/// A set of simulated peers reachable through [`RemoteTransport`].
#[derive(Default)]
pub struct SimNetwork {
    nodes: RwLock<HashMap<String, Arc<SimNode>>>,
    faults: RwLock<Faults>,
    calls: Mutex<Vec<SimCall>>,
}

fn split_url(url: &str) -> Option<(&str, &str)> {
    let idx = url.find("/~")?;
    Some((&url[..idx], &url[idx + 2..]))
}

impl SimNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a peer reachable at `poa`.
    pub fn add_node(
        &self,
        node_id: &str,
        cse_name: &str,
        node_type: NodeType,
        poa: &str,
    ) -> Arc<SimNode> {
        let base_ri = bare_id(node_id).to_string();
        let base = Resource::new(ResourceType::CseBase, base_ri.clone(), cse_name, "")
            .with_attr("csi", node_id)
            .with_attr("cst", node_type.code())
            .with_attr("poa", vec![poa.to_string()])
            .with_attr("srv", vec!["3".to_string(), "4".to_string()]);
        let node = Arc::new(SimNode {
            node_id: node_id.to_string(),
            base_ri,
            store: MemoryStore::with_base(base),
        });
        self.nodes
            .write()
            .insert(poa.trim_end_matches('/').to_string(), node.clone());
        node
    }

    /// Peer reachable at `poa`.
    pub fn node(&self, poa: &str) -> Option<Arc<SimNode>> {
        self.nodes.read().get(poa.trim_end_matches('/')).cloned()
    }

    /// Make a host unreachable (or reachable again).
    pub fn set_unreachable(&self, poa: &str, unreachable: bool) {
        let key = poa.trim_end_matches('/').to_string();
        let mut faults = self.faults.write();
        if unreachable {
            faults.unreachable.insert(key);
        } else {
            faults.unreachable.remove(&key);
        }
    }

    /// Delay every response from a host.
    pub fn set_latency(&self, poa: &str, latency: Duration) {
        self.faults
            .write()
            .latency
            .insert(poa.trim_end_matches('/').to_string(), latency);
    }

    /// Answer `op` on exactly `url` with `response` until cleared.
    pub fn force_response(&self, op: SimOp, url: &str, response: RemoteResponse) {
        self.faults
            .write()
            .forced
            .insert((op, url.to_string()), response);
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        *self.faults.write() = Faults::default();
    }

    /// Every call recorded so far.
    pub fn calls(&self) -> Vec<SimCall> {
        self.calls.lock().clone()
    }

    /// Calls of one kind.
    pub fn calls_of(&self, op: SimOp) -> Vec<SimCall> {
        self.calls.lock().iter().filter(|c| c.op == op).cloned().collect()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    async fn dispatch(&self, call: SimCall) -> RemoteResponse {
        self.calls.lock().push(call.clone());

        let Some((poa, path)) = split_url(&call.url) else {
            return RemoteResponse::error(ResponseStatus::BadRequest, "missing /~ in url");
        };

        let (latency, unreachable, forced) = {
            let faults = self.faults.read();
            (
                faults.latency.get(poa).copied(),
                faults.unreachable.contains(poa),
                faults.forced.get(&(call.op, call.url.clone())).cloned(),
            )
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if unreachable {
            return RemoteResponse::unreachable(format!("{} timed out", poa));
        }
        if let Some(response) = forced {
            return response;
        }
        let Some(node) = self.node(poa) else {
            return RemoteResponse::unreachable(format!("no route to {}", poa));
        };

        match call.op {
            SimOp::Retrieve => match node.locate(path) {
                Some(resource) => RemoteResponse::with_body(ResponseStatus::Ok, resource.public_view()),
                None => RemoteResponse::error(ResponseStatus::NotFound, format!("{} not found", path)),
            },
            SimOp::Create => self.create(&node, path, call.ty, call.body).await,
            SimOp::Update => self.update(&node, path, call.body).await,
            SimOp::Delete => match node.locate(path) {
                Some(resource) => match node.store.delete(&resource.ri).await {
                    Ok(()) => RemoteResponse::status(ResponseStatus::Deleted),
                    Err(e) => e.to_response(),
                },
                None => RemoteResponse::error(ResponseStatus::NotFound, format!("{} not found", path)),
            },
        }
    }

    async fn create(
        &self,
        node: &SimNode,
        path: &str,
        ty: Option<ResourceType>,
        body: Option<Value>,
    ) -> RemoteResponse {
        let Some(parent) = node.locate(path) else {
            return RemoteResponse::error(ResponseStatus::NotFound, format!("{} not found", path));
        };
        let Some(ty) = ty else {
            return RemoteResponse::error(ResponseStatus::BadRequest, "missing resource type");
        };
        let mut fields = match body {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let ri = match (ty, fields.get("csi").and_then(Value::as_str)) {
            (ResourceType::RemoteCse, Some(csi)) => bare_id(csi).to_string(),
            _ => String::new(),
        };
        fields.insert("ty".to_string(), Value::from(ty.code()));
        fields.insert("ri".to_string(), Value::from(ri));
        fields.entry("rn").or_insert_with(|| Value::from(""));
        let resource: Resource = match serde_json::from_value(Value::Object(fields)) {
            Ok(r) => r,
            Err(e) => return RemoteResponse::error(ResponseStatus::BadRequest, e.to_string()),
        };
        match node.store.create(resource, &parent.ri).await {
            Ok(created) => RemoteResponse::with_body(ResponseStatus::Created, created.public_view()),
            Err(FederationError::AlreadyExists { id }) => {
                RemoteResponse::error(ResponseStatus::AlreadyExists, format!("{} already exists", id))
            }
            Err(e) => e.to_response(),
        }
    }

    async fn update(&self, node: &SimNode, path: &str, body: Option<Value>) -> RemoteResponse {
        let Some(existing) = node.locate(path) else {
            return RemoteResponse::error(ResponseStatus::NotFound, format!("{} not found", path));
        };
        let mut merged = match serde_json::to_value(&existing) {
            Ok(Value::Object(map)) => map,
            _ => return RemoteResponse::error(ResponseStatus::InternalServerError, "encode failed"),
        };
        if let Some(Value::Object(changes)) = body {
            for (key, value) in changes {
                if !matches!(key.as_str(), "ty" | "ri" | "pi" | "ct" | "lt" | "rn") {
                    merged.insert(key, value);
                }
            }
        }
        let resource: Resource = match serde_json::from_value(Value::Object(merged)) {
            Ok(r) => r,
            Err(e) => return RemoteResponse::error(ResponseStatus::BadRequest, e.to_string()),
        };
        match node.store.update(resource).await {
            Ok(updated) => RemoteResponse::with_body(ResponseStatus::Updated, updated.public_view()),
            Err(e) => e.to_response(),
        }
    }
}

#[async_trait]
impl RemoteTransport for SimNetwork {
    async fn send_retrieve(&self, url: &str, originator: &str) -> RemoteResponse {
        self.dispatch(SimCall {
            op: SimOp::Retrieve,
            url: url.to_string(),
            originator: originator.to_string(),
            ty: None,
            body: None,
        })
        .await
    }

    async fn send_create(
        &self,
        url: &str,
        originator: &str,
        ty: ResourceType,
        body: Value,
    ) -> RemoteResponse {
        self.dispatch(SimCall {
            op: SimOp::Create,
            url: url.to_string(),
            originator: originator.to_string(),
            ty: Some(ty),
            body: Some(body),
        })
        .await
    }

    async fn send_update(&self, url: &str, originator: &str, body: Value) -> RemoteResponse {
        self.dispatch(SimCall {
            op: SimOp::Update,
            url: url.to_string(),
            originator: originator.to_string(),
            ty: None,
            body: Some(body),
        })
        .await
    }

    async fn send_delete(&self, url: &str, originator: &str) -> RemoteResponse {
        self.dispatch(SimCall {
            op: SimOp::Delete,
            url: url.to_string(),
            originator: originator.to_string(),
            ty: None,
            body: None,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const IN: &str = "http://in:8080";

    fn network() -> Arc<SimNetwork> {
        let net = SimNetwork::new();
        net.add_node("/id-in", "cse-in", NodeType::In, IN);
        net
    }

    #[test]
    fn test_split_url() {
        assert_eq!(
            split_url("http://in:8080/~/id-in/cse-in"),
            Some(("http://in:8080", "/id-in/cse-in"))
        );
        assert_eq!(split_url("http://in:8080/cse-in"), None);
    }

    #[tokio::test]
    async fn test_retrieve_base_by_structured_and_unstructured_path() {
        let net = network();
        for url in [
            "http://in:8080/~/id-in/cse-in",
            "http://in:8080/~/id-in",
            "http://in:8080/~/id-in/id-in",
        ] {
            let resp = net.send_retrieve(url, "/id-mn").await;
            assert_eq!(resp.status, ResponseStatus::Ok, "{}", url);
            assert_eq!(resp.body_str("csi"), Some("/id-in"));
        }
    }

    #[tokio::test]
    async fn test_create_registration_uses_bare_csi_as_ri() {
        let net = network();
        let resp = net
            .send_create(
                "http://in:8080/~/id-in/cse-in",
                "/id-mn",
                ResourceType::RemoteCse,
                json!({"rn": "id-mn", "csi": "/id-mn", "poa": ["http://mn"]}),
            )
            .await;
        assert_eq!(resp.status, ResponseStatus::Created);
        assert_eq!(resp.body_str("ri"), Some("id-mn"));

        let again = net
            .send_create(
                "http://in:8080/~/id-in/cse-in",
                "/id-mn",
                ResourceType::RemoteCse,
                json!({"rn": "id-mn", "csi": "/id-mn"}),
            )
            .await;
        assert_eq!(again.status, ResponseStatus::AlreadyExists);
    }

    #[tokio::test]
    async fn test_create_nested_and_lookup_by_name() {
        let net = network();
        let parent = net
            .send_create(
                "http://in:8080/~/id-in/cse-in",
                "/id-mn",
                ResourceType::AeAnnc,
                json!({"rn": "appAnnc"}),
            )
            .await;
        let parent_ri = parent.body_str("ri").unwrap().to_string();
        let child = net
            .send_create(
                &format!("http://in:8080/~/id-in/{}", parent_ri),
                "/id-mn",
                ResourceType::ContainerAnnc,
                json!({"rn": "dataAnnc"}),
            )
            .await;
        assert_eq!(child.status, ResponseStatus::Created);
        let by_name = net
            .send_retrieve(
                &format!("http://in:8080/~/id-in/{}/dataAnnc", parent_ri),
                "/id-mn",
            )
            .await;
        assert_eq!(by_name.body_str("ri"), child.body_str("ri"));
    }

    #[tokio::test]
    async fn test_update_merges_and_delete() {
        let net = network();
        let created = net
            .send_create(
                "http://in:8080/~/id-in/cse-in",
                "/id-mn",
                ResourceType::ContainerAnnc,
                json!({"rn": "c", "lbl": ["a"]}),
            )
            .await;
        let url = format!("http://in:8080/~/id-in/{}", created.body_str("ri").unwrap());
        let updated = net.send_update(&url, "/id-mn", json!({"lbl": ["b"], "ty": 3})).await;
        assert_eq!(updated.status, ResponseStatus::Updated);
        assert_eq!(updated.body.unwrap()["lbl"], json!(["b"]));

        assert_eq!(net.send_delete(&url, "/id-mn").await.status, ResponseStatus::Deleted);
        assert_eq!(net.send_delete(&url, "/id-mn").await.status, ResponseStatus::NotFound);
    }

    #[tokio::test]
    async fn test_unknown_host_is_unreachable() {
        let net = network();
        let resp = net.send_retrieve("http://nowhere/~/id-x", "/id-mn").await;
        assert_eq!(resp.status, ResponseStatus::TargetNotReachable);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let net = network();
        net.set_unreachable(IN, true);
        let resp = net.send_retrieve("http://in:8080/~/id-in", "/id-mn").await;
        assert_eq!(resp.status, ResponseStatus::TargetNotReachable);
        net.set_unreachable(IN, false);

        net.force_response(
            SimOp::Retrieve,
            "http://in:8080/~/id-in",
            RemoteResponse::status(ResponseStatus::OriginatorHasNoPrivilege),
        );
        let resp = net.send_retrieve("http://in:8080/~/id-in", "/id-mn").await;
        assert_eq!(resp.status, ResponseStatus::OriginatorHasNoPrivilege);
        net.clear_faults();
        let resp = net.send_retrieve("http://in:8080/~/id-in", "/id-mn").await;
        assert_eq!(resp.status, ResponseStatus::Ok);
    }

    #[tokio::test]
    async fn test_calls_are_recorded() {
        let net = network();
        net.send_retrieve("http://in:8080/~/id-in", "/id-mn").await;
        net.send_delete("http://in:8080/~/id-in/x", "/id-mn").await;
        assert_eq!(net.calls().len(), 2);
        assert_eq!(net.calls_of(SimOp::Delete).len(), 1);
        assert_eq!(net.calls()[0].originator, "/id-mn");
        net.clear_calls();
        assert!(net.calls().is_empty());
    }

    #[tokio::test]
    async fn test_touch_base_bumps_lt() {
        let net = network();
        let node = net.node(IN).unwrap();
        let before = node.resource("id-in").await.unwrap().lt;
        node.touch_base().await.unwrap();
        assert!(node.resource("id-in").await.unwrap().lt > before);
    }

    #[tokio::test]
    async fn test_touch_base_reports_missing_base() {
        let net = network();
        let node = net.node(IN).unwrap();
        node.store().delete("id-in").await.unwrap();
        assert!(matches!(
            node.touch_base().await,
            Err(FederationError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_locate_walks_names_below_base() {
        let net = network();
        let node = net.node(IN).unwrap();
        let cnt = node
            .store()
            .create(Resource::new(ResourceType::Container, "", "box", ""), "id-in")
            .await
            .unwrap();
        assert_eq!(node.locate("/id-in/cse-in/box").map(|r| r.ri), Some(cnt.ri.clone()));
        assert_eq!(node.locate(&format!("/id-in/{}", cnt.ri)).map(|r| r.ri), Some(cnt.ri));
        assert!(node.locate("/id-in/cse-in/nothing").is_none());
    }
}
