//! Test Harness - simulated multi-node topologies

use std::sync::Arc;
use std::time::Duration;

use meshcse_federation::sim::{SimNetwork, SimNode};
use meshcse_federation::{
    AnnouncementEngine, Federation, FederationConfig, FederationContext, FederationEvent,
    LivelinessProber, MemoryStore, NodeType, RegistrarConfig, RegistrationReconciler,
    RegistrationRecord, Resource, ResourceStore, ResourceType, TransitRouter,
};

pub const IN_ID: &str = "/id-in";
pub const IN_NAME: &str = "cse-in";
pub const IN_POA: &str = "http://in.test:8080";
pub const MN_ID: &str = "/id-mn";
pub const MN_NAME: &str = "cse-mn";
pub const MN_POA: &str = "http://mn.test:8081";
pub const ASN_ID: &str = "/id-asn";
pub const ASN_NAME: &str = "cse-asn";
pub const ASN_POA: &str = "http://asn.test:8082";

/// Configuration of the root node.
pub fn in_config() -> FederationConfig {
    FederationConfig {
        cse_id: IN_ID.to_string(),
        cse_name: IN_NAME.to_string(),
        node_type: NodeType::In,
        points_of_access: vec![IN_POA.to_string()],
        announcement_delay_ms: 0,
        ..FederationConfig::default()
    }
}

/// Configuration of the middle node, registered with the root node.
pub fn mn_config() -> FederationConfig {
    FederationConfig {
        cse_id: MN_ID.to_string(),
        cse_name: MN_NAME.to_string(),
        node_type: NodeType::Mn,
        points_of_access: vec![MN_POA.to_string()],
        registrar: Some(RegistrarConfig {
            cse_id: IN_ID.to_string(),
            cse_name: IN_NAME.to_string(),
            address: IN_POA.to_string(),
        }),
        announcement_delay_ms: 0,
        shutdown_timeout_ms: 200,
        ..FederationConfig::default()
    }
}

/// Registration record of a peer reachable at `poa`.
pub fn record_for(node_id: &str, cse_name: &str, poa: &str) -> RegistrationRecord {
    RegistrationRecord::new(
        node_id,
        &format!("{}/{}", node_id, cse_name),
        vec![poa.to_string()],
    )
}

/// A network of simulated peers. The node under test talks to them through
/// [`SimNetwork`] and keeps its own resources in a [`MemoryStore`].
pub struct SimTopology {
    net: Arc<SimNetwork>,
}

impl SimTopology {
    pub fn empty() -> Self {
        Self {
            net: SimNetwork::new(),
        }
    }

    /// A network holding the root node as registrar.
    pub fn with_registrar() -> Self {
        let topology = Self::empty();
        topology.add_peer(IN_ID, IN_NAME, NodeType::In, IN_POA);
        topology
    }

    pub fn net(&self) -> &Arc<SimNetwork> {
        &self.net
    }

    pub fn add_peer(&self, node_id: &str, cse_name: &str, node_type: NodeType, poa: &str) -> Arc<SimNode> {
        tracing::debug!(node = node_id, poa, "adding simulated peer");
        self.net.add_node(node_id, cse_name, node_type, poa)
    }

    pub fn peer(&self, poa: &str) -> Arc<SimNode> {
        self.net.node(poa).expect("peer not in topology")
    }

    pub fn registrar(&self) -> Arc<SimNode> {
        self.peer(IN_POA)
    }

    /// The middle node, wired component by component.
    pub fn mn_node(&self) -> TestNode {
        TestNode::new(mn_config(), &self.net)
    }

    /// The middle node as a full subsystem with its own workers.
    pub fn mn_federation(&self) -> (Federation, Arc<MemoryStore>) {
        let config = mn_config();
        let store = Arc::new(MemoryStore::with_base(config.base_resource()));
        let federation =
            Federation::new(config, store.clone(), self.net.clone()).expect("valid config");
        (federation, store)
    }

    /// Add a child peer that already holds its record of `parent` and
    /// return the record the parent keeps for it.
    pub async fn add_child(
        &self,
        parent: &FederationConfig,
        node_id: &str,
        cse_name: &str,
        poa: &str,
    ) -> anyhow::Result<RegistrationRecord> {
        let child = self.add_peer(node_id, cse_name, NodeType::Asn, poa);
        let parent_poa = parent
            .points_of_access
            .first()
            .cloned()
            .unwrap_or_default();
        let parent_record = record_for(&parent.cse_id, &parent.cse_name, &parent_poa);
        child
            .store()
            .create(parent_record.to_resource(child.base_ri()), child.base_ri())
            .await?;
        Ok(record_for(node_id, cse_name, poa))
    }
}

/// One node under test with its components built over a shared context.
pub struct TestNode {
    pub ctx: Arc<FederationContext>,
    pub reconciler: RegistrationReconciler,
    pub prober: LivelinessProber,
    pub announcer: AnnouncementEngine,
    pub router: TransitRouter,
}

impl TestNode {
    pub fn new(config: FederationConfig, net: &Arc<SimNetwork>) -> Self {
        let store = Arc::new(MemoryStore::with_base(config.base_resource()));
        let ctx = Arc::new(FederationContext::new(config, store, net.clone()));
        Self {
            reconciler: RegistrationReconciler::new(ctx.clone()),
            prober: LivelinessProber::new(ctx.clone()),
            announcer: AnnouncementEngine::new(ctx.clone()),
            router: TransitRouter::new(ctx.clone()),
            ctx,
        }
    }

    pub fn base_ri(&self) -> String {
        self.ctx.base_ri()
    }

    /// Store a child record locally and report it, as the registration
    /// handler would.
    pub async fn accept_child(&self, record: RegistrationRecord) -> anyhow::Result<()> {
        let base_ri = self.base_ri();
        self.ctx
            .store
            .create(record.to_resource(&base_ri), &base_ri)
            .await?;
        self.ctx.bus.publish(FederationEvent::ChildRegistered(record));
        Ok(())
    }

    /// Create a local resource flagged for announcement to `at`.
    pub async fn create(
        &self,
        ty: ResourceType,
        rn: &str,
        parent_ri: &str,
        at: &[&str],
    ) -> anyhow::Result<Resource> {
        let mut resource = Resource::new(ty, "", rn, "");
        resource.at = at.iter().map(|s| s.to_string()).collect();
        Ok(self.ctx.store.create(resource, parent_ri).await?)
    }

    pub async fn stored(&self, ri: &str) -> anyhow::Result<Resource> {
        Ok(self.ctx.store.get(ri).await?)
    }

    /// Every local resource that has announcement bookkeeping.
    pub async fn announced_resources(&self) -> anyhow::Result<Vec<Resource>> {
        let mut all = Vec::new();
        let mut pending = vec![self.base_ri()];
        while let Some(parent) = pending.pop() {
            for child in self.ctx.store.query_direct_children(&parent, None).await? {
                pending.push(child.ri.clone());
                if !child.at.is_empty() || !child.announced_to.is_empty() {
                    all.push(child);
                }
            }
        }
        Ok(all)
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn event_kinds(events: &[FederationEvent]) -> Vec<&'static str> {
    events.iter().map(FederationEvent::kind).collect()
}
