//! Registration reconciler: keeps this node registered with its registrar.
//!
//! Each tick compares the local mirror of the registrar with this node's own
//! record at the registrar and repairs whatever drifted. Every side owns its
//! own base: the local mirror follows the registrar's base, and the record at
//! the registrar follows this node's base. A tick never returns an error; a
//! failing step is logged and the next tick retries.

use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::RegistrarConfig;
use crate::context::FederationContext;
use crate::error::{FederationError, Result};
use crate::events::FederationEvent;
use crate::record::RegistrationRecord;
use crate::transport::ResponseStatus;
use crate::types::{NodeType, Resource, ResourceType};

/// What a reconciler tick ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The node type has no registrar.
    Skipped,
    /// A registration was (re-)established during this tick.
    Registered,
    /// Already registered; records refreshed where needed.
    InSync,
    /// The registration was lost and could not be re-established.
    Deregistered,
    /// The registrar did not answer; state left as it was.
    Unreachable,
    /// Some other step failed; retried next tick.
    Failed,
}

/// Periodic worker maintaining the upstream registration.
pub struct RegistrationReconciler {
    ctx: Arc<FederationContext>,
    unreachable_ticks: AtomicU32,
}

impl RegistrationReconciler {
    /// Create a reconciler over the shared context.
    pub fn new(ctx: Arc<FederationContext>) -> Self {
        Self {
            ctx,
            unreachable_ticks: AtomicU32::new(0),
        }
    }

    /// Run one reconciliation pass.
    pub async fn tick(&self) -> ReconcileOutcome {
        let Some(registrar) = self.ctx.config.registrar.clone() else {
            return ReconcileOutcome::Skipped;
        };
        self.ctx.metrics.inc_reconcile_ticks();
        match self.reconcile(&registrar).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(registrar = %registrar.cse_id, error = %e, "registration check failed");
                ReconcileOutcome::Failed
            }
        }
    }

    /// Tick until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.ctx.config.check_interval();
        info!(interval_secs = interval.as_secs(), "registration reconciler started");
        while !*shutdown.borrow() {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("registration reconciler stopped");
    }

    async fn reconcile(&self, registrar: &RegistrarConfig) -> Result<ReconcileOutcome> {
        let Some(local) = self.local_mirror(registrar).await? else {
            return Ok(self.register(registrar).await);
        };

        let record_url = registrar.record_url(&self.ctx.config.cse_id);
        let response = self
            .ctx
            .transport
            .send_retrieve(&record_url, self.ctx.originator())
            .await;

        if response.status.is_unreachable() {
            return Ok(self.note_unreachable(registrar, &local).await);
        }
        self.unreachable_ticks.store(0, Ordering::Relaxed);

        if response.status == ResponseStatus::NotFound {
            info!(registrar = %registrar.cse_id, "own record missing at registrar, re-registering");
            self.drop_local_mirror(&local).await?;
            self.publish_deregistered();
            return Ok(self.register(registrar).await);
        }
        if !response.is_success() {
            return Err(FederationError::from_response(&record_url, &response));
        }

        let own_remote = RegistrationRecord::from_body(&response.body.unwrap_or(Value::Null))?;
        let local = self.refresh_local_mirror(registrar, local).await?;
        let own_remote = self.push_own_record(&record_url, own_remote).await?;
        let registrar_record = RegistrationRecord::from_resource(&local)?;

        if self.ctx.state.is_registered() {
            self.ctx.state.set_registration(registrar_record, own_remote);
            Ok(ReconcileOutcome::InSync)
        } else {
            self.ctx.metrics.inc_registrations();
            self.ctx.bus.publish(FederationEvent::RegisteredToParent {
                registrar: registrar_record,
                own: own_remote,
            });
            Ok(ReconcileOutcome::Registered)
        }
    }

    /// Local registration record whose `csi` is the registrar's id.
    async fn local_mirror(&self, registrar: &RegistrarConfig) -> Result<Option<Resource>> {
        let records = self
            .ctx
            .store
            .query_direct_children(&self.ctx.base_ri(), Some(ResourceType::RemoteCse))
            .await?;
        Ok(records
            .into_iter()
            .find(|r| r.attr_str("csi") == Some(registrar.cse_id.as_str())))
    }

    async fn note_unreachable(&self, registrar: &RegistrarConfig, local: &Resource) -> ReconcileOutcome {
        let ticks = self.unreachable_ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let limit = self.ctx.config.max_unreachable_ticks;
        if limit == 0 || ticks < limit {
            warn!(registrar = %registrar.cse_id, ticks, "registrar unreachable");
            return ReconcileOutcome::Unreachable;
        }
        warn!(registrar = %registrar.cse_id, ticks, "registrar unreachable, dropping registration");
        self.unreachable_ticks.store(0, Ordering::Relaxed);
        if let Err(e) = self.drop_local_mirror(local).await {
            warn!(error = %e, "failed to remove local registrar record");
        }
        self.publish_deregistered();
        ReconcileOutcome::Deregistered
    }

    /// Update the local mirror when the registrar's base changed after it.
    async fn refresh_local_mirror(
        &self,
        registrar: &RegistrarConfig,
        mut local: Resource,
    ) -> Result<Resource> {
        let url = registrar.base_url();
        let response = self
            .ctx
            .transport
            .send_retrieve(&url, self.ctx.originator())
            .await;
        if !response.is_success() {
            return Err(FederationError::from_response(&url, &response));
        }
        let base: Resource = serde_json::from_value(response.body.unwrap_or(Value::Null))?;
        if base.lt <= local.lt {
            return Ok(local);
        }
        debug!(registrar = %registrar.cse_id, "registrar base changed, updating local mirror");
        for name in ["poa", "srv", "cst"] {
            if let Some(value) = base.attr(name) {
                local.set_attr(name, value.clone());
            }
        }
        self.ctx.store.update(local).await
    }

    /// Push this node's record when the local view is newer or differs.
    async fn push_own_record(
        &self,
        record_url: &str,
        own_remote: RegistrationRecord,
    ) -> Result<RegistrationRecord> {
        let base = self.ctx.store.get(&self.ctx.base_ri()).await?;
        let mut desired = self.ctx.config.own_record();
        desired.points_of_access = base.attr_str_list("poa");
        if desired.points_of_access.is_empty() {
            desired.points_of_access = self.ctx.config.points_of_access.clone();
        }
        desired.descendant_ids = self.ctx.state.all_descendant_ids();

        let mut remote_dcse = own_remote.descendant_ids.clone();
        remote_dcse.sort();
        let stale = base.lt > own_remote.modified_us
            || remote_dcse != desired.descendant_ids
            || own_remote.points_of_access != desired.points_of_access;
        if !stale {
            return Ok(own_remote);
        }

        debug!(url = %record_url, "pushing own record to registrar");
        let response = self
            .ctx
            .transport
            .send_update(record_url, self.ctx.originator(), desired.update_body())
            .await;
        if !response.is_success() {
            return Err(FederationError::from_response(record_url, &response));
        }
        match &response.body {
            Some(body) => RegistrationRecord::from_body(body),
            None => Ok(own_remote),
        }
    }

    /// Full registration handshake. Never fails; failures end unregistered.
    async fn register(&self, registrar: &RegistrarConfig) -> ReconcileOutcome {
        match self.try_register(registrar).await {
            Ok((registrar_record, own)) => {
                info!(registrar = %registrar.cse_id, "registration established");
                self.ctx.metrics.inc_registrations();
                self.ctx.bus.publish(FederationEvent::RegisteredToParent {
                    registrar: registrar_record,
                    own,
                });
                ReconcileOutcome::Registered
            }
            Err(e) => {
                warn!(registrar = %registrar.cse_id, error = %e, "registration failed");
                if self.ctx.state.is_registered() {
                    self.publish_deregistered();
                }
                if e.is_unreachable() {
                    ReconcileOutcome::Unreachable
                } else {
                    ReconcileOutcome::Deregistered
                }
            }
        }
    }

    async fn try_register(
        &self,
        registrar: &RegistrarConfig,
    ) -> Result<(RegistrationRecord, RegistrationRecord)> {
        let originator = self.ctx.originator();
        let record_url = registrar.record_url(&self.ctx.config.cse_id);

        // A leftover record from an earlier run would make the create fail.
        let response = self.ctx.transport.send_delete(&record_url, originator).await;
        match response.status {
            status if status.is_success() => debug!(url = %record_url, "removed stray record"),
            ResponseStatus::NotFound => {}
            status if status.is_unreachable() => {
                return Err(FederationError::from_response(&record_url, &response));
            }
            status => debug!(url = %record_url, %status, "stray record delete refused"),
        }

        let mut own = self.ctx.config.own_record();
        own.descendant_ids = self.ctx.state.all_descendant_ids();
        let base_url = registrar.base_url();
        let response = self
            .ctx
            .transport
            .send_create(&base_url, originator, ResourceType::RemoteCse, own.creation_body())
            .await;
        if !response.is_success() {
            return Err(FederationError::from_response(&base_url, &response));
        }
        let own_remote = match &response.body {
            Some(body) => RegistrationRecord::from_body(body)?,
            None => own,
        };

        let response = self.ctx.transport.send_retrieve(&base_url, originator).await;
        if !response.is_success() {
            return Err(FederationError::from_response(&base_url, &response));
        }
        let base: Resource = serde_json::from_value(response.body.unwrap_or(Value::Null))?;

        let mut points_of_access = base.attr_str_list("poa");
        if points_of_access.is_empty() {
            points_of_access.push(registrar.address.trim_end_matches('/').to_string());
        }
        let mut mirror = RegistrationRecord::new(
            &registrar.cse_id,
            &format!("{}/{}", registrar.cse_id, registrar.cse_name),
            points_of_access,
        );
        mirror.node_type = base
            .attr("cst")
            .and_then(Value::as_u64)
            .and_then(NodeType::from_code);
        mirror.supported_releases = base.attr_str_list("srv");

        let base_ri = self.ctx.base_ri();
        let stored = self
            .ctx
            .store
            .create(mirror.to_resource(&base_ri), &base_ri)
            .await?;
        Ok((RegistrationRecord::from_resource(&stored)?, own_remote))
    }

    async fn drop_local_mirror(&self, local: &Resource) -> Result<()> {
        match self.ctx.store.delete(&local.ri).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    fn publish_deregistered(&self) {
        self.ctx.metrics.inc_deregistrations();
        let own = self.ctx.state.own_record_at_registrar();
        self.ctx
            .bus
            .publish(FederationEvent::DeregisteredFromParent { own });
    }

    /// Best-effort teardown on shutdown: remove this node's record at the
    /// registrar and the local mirror, each bounded by `timeout`.
    pub async fn deregister(&self, timeout: Duration) {
        let Some(registrar) = self.ctx.config.registrar.clone() else {
            return;
        };
        let record_url = registrar.record_url(&self.ctx.config.cse_id);
        match tokio::time::timeout(
            timeout,
            self.ctx.transport.send_delete(&record_url, self.ctx.originator()),
        )
        .await
        {
            Ok(response) if response.is_success() => {
                info!(registrar = %registrar.cse_id, "deregistered at registrar")
            }
            Ok(response) => {
                debug!(registrar = %registrar.cse_id, status = %response.status, "remote deregistration refused")
            }
            Err(_) => warn!(registrar = %registrar.cse_id, "remote deregistration timed out"),
        }

        let local = match tokio::time::timeout(timeout, self.local_mirror(&registrar)).await {
            Ok(Ok(local)) => local,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to look up local registrar record");
                None
            }
            Err(_) => None,
        };
        if let Some(local) = local {
            match tokio::time::timeout(timeout, self.drop_local_mirror(&local)).await {
                Ok(Err(e)) => warn!(error = %e, "failed to remove local registrar record"),
                Err(_) => warn!("local registrar record removal timed out"),
                Ok(Ok(())) => {}
            }
        }
        if self.ctx.state.is_registered() {
            self.publish_deregistered();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use crate::events::drain;
    use crate::sim::{SimNetwork, SimOp};
    use crate::store::ResourceStore;
    use crate::transport::RemoteResponse;

    const RECORD_URL: &str = "http://in:8080/~/id-in/id-mn";
    const BASE_URL: &str = "http://in:8080/~/id-in/cse-in";

    fn kinds(events: &[FederationEvent]) -> Vec<&'static str> {
        events.iter().map(FederationEvent::kind).collect()
    }

    async fn registered() -> (Arc<SimNetwork>, Arc<FederationContext>, RegistrationReconciler) {
        let net = network();
        let ctx = mn_context(&net);
        let reconciler = RegistrationReconciler::new(ctx.clone());
        assert_eq!(reconciler.tick().await, ReconcileOutcome::Registered);
        net.clear_calls();
        (net, ctx, reconciler)
    }

    #[tokio::test]
    async fn test_root_node_skips() {
        let net = network();
        let config = crate::config::FederationConfig::default();
        let ctx = context(config, &net);
        let reconciler = RegistrationReconciler::new(ctx.clone());
        assert_eq!(reconciler.tick().await, ReconcileOutcome::Skipped);
        assert!(net.calls().is_empty());
    }

    #[tokio::test]
    async fn test_first_tick_registers() {
        let net = network();
        let ctx = mn_context(&net);
        let mut rx = ctx.bus.subscribe();
        let reconciler = RegistrationReconciler::new(ctx.clone());

        assert_eq!(reconciler.tick().await, ReconcileOutcome::Registered);

        assert!(ctx.state.is_registered());
        assert_eq!(ctx.state.registrar_record().unwrap().node_id, "/id-in");
        assert_eq!(
            ctx.state.own_record_at_registrar().unwrap().node_id,
            "/id-mn"
        );
        let registrar_node = net.node(IN_POA).unwrap();
        let remote = registrar_node.resource("id-mn").await.unwrap();
        assert_eq!(remote.attr_str("csi"), Some("/id-mn"));
        assert_eq!(remote.attr_str_list("poa"), vec![MN_POA]);

        let mirror = ctx.store.get("id-in").await.unwrap();
        assert_eq!(mirror.ty, ResourceType::RemoteCse);
        assert_eq!(mirror.attr_str("cb"), Some("/id-in/cse-in"));
        assert_eq!(mirror.attr_str_list("poa"), vec![IN_POA]);

        assert_eq!(kinds(&drain(&mut rx)), vec!["registered-to-parent"]);
        assert_eq!(ctx.metrics.snapshot().registrations, 1);
    }

    #[tokio::test]
    async fn test_second_tick_is_quiet() {
        let (net, ctx, reconciler) = registered().await;
        let mut rx = ctx.bus.subscribe();

        assert_eq!(reconciler.tick().await, ReconcileOutcome::InSync);

        assert!(drain(&mut rx).is_empty());
        assert!(net.calls_of(SimOp::Create).is_empty());
        assert!(net.calls_of(SimOp::Delete).is_empty());
        assert!(net.calls_of(SimOp::Update).is_empty());
    }

    #[tokio::test]
    async fn test_stray_remote_record_is_replaced() {
        let net = network();
        let ctx = mn_context(&net);
        let registrar_node = net.node(IN_POA).unwrap();
        let stale = RegistrationRecord::new("/id-mn", "/id-mn/cse-mn", vec!["http://old".into()]);
        registrar_node
            .store()
            .create(stale.to_resource("id-in"), "id-in")
            .await
            .unwrap();
        let mut rx = ctx.bus.subscribe();
        let reconciler = RegistrationReconciler::new(ctx.clone());

        assert_eq!(reconciler.tick().await, ReconcileOutcome::Registered);

        let ops: Vec<(SimOp, String)> = net.calls().into_iter().map(|c| (c.op, c.url)).collect();
        assert_eq!(ops[0], (SimOp::Delete, RECORD_URL.to_string()));
        assert_eq!(ops[1], (SimOp::Create, BASE_URL.to_string()));
        let remote = registrar_node.resource("id-mn").await.unwrap();
        assert_eq!(remote.attr_str_list("poa"), vec![MN_POA]);
        assert!(ctx.state.own_record_at_registrar().is_some());
        assert_eq!(kinds(&drain(&mut rx)), vec!["registered-to-parent"]);
    }

    #[tokio::test]
    async fn test_missing_remote_record_deregisters() {
        let (net, ctx, reconciler) = registered().await;
        net.force_response(
            SimOp::Retrieve,
            RECORD_URL,
            RemoteResponse::status(ResponseStatus::NotFound),
        );
        net.force_response(
            SimOp::Create,
            BASE_URL,
            RemoteResponse::status(ResponseStatus::OriginatorHasNoPrivilege),
        );
        let mut rx = ctx.bus.subscribe();

        assert_eq!(reconciler.tick().await, ReconcileOutcome::Deregistered);

        assert!(ctx.store.get("id-in").await.is_err());
        assert!(!ctx.state.is_registered());
        assert_eq!(kinds(&drain(&mut rx)), vec!["deregistered-from-parent"]);
        assert_eq!(ctx.metrics.snapshot().deregistrations, 1);
    }

    #[tokio::test]
    async fn test_missing_remote_record_reregisters_in_same_tick() {
        let (net, ctx, reconciler) = registered().await;
        net.node(IN_POA)
            .unwrap()
            .store()
            .delete("id-mn")
            .await
            .unwrap();
        let mut rx = ctx.bus.subscribe();

        assert_eq!(reconciler.tick().await, ReconcileOutcome::Registered);

        assert!(ctx.state.is_registered());
        assert!(net.node(IN_POA).unwrap().resource("id-mn").await.is_some());
        assert_eq!(
            kinds(&drain(&mut rx)),
            vec!["deregistered-from-parent", "registered-to-parent"]
        );
    }

    #[tokio::test]
    async fn test_unreachable_registrar_keeps_state_until_limit() {
        let (net, ctx, reconciler) = registered().await;
        net.set_unreachable(IN_POA, true);

        assert_eq!(reconciler.tick().await, ReconcileOutcome::Unreachable);
        assert_eq!(reconciler.tick().await, ReconcileOutcome::Unreachable);
        assert!(ctx.state.is_registered());

        assert_eq!(reconciler.tick().await, ReconcileOutcome::Deregistered);
        assert!(!ctx.state.is_registered());
        assert!(ctx.store.get("id-in").await.is_err());
    }

    #[tokio::test]
    async fn test_recovered_registrar_resets_unreachable_count() {
        let (net, ctx, reconciler) = registered().await;
        net.set_unreachable(IN_POA, true);
        reconciler.tick().await;
        reconciler.tick().await;
        net.set_unreachable(IN_POA, false);
        assert_eq!(reconciler.tick().await, ReconcileOutcome::InSync);
        net.set_unreachable(IN_POA, true);
        assert_eq!(reconciler.tick().await, ReconcileOutcome::Unreachable);
        assert!(ctx.state.is_registered());
    }

    #[tokio::test]
    async fn test_newer_registrar_base_updates_local_mirror() {
        let (net, ctx, reconciler) = registered().await;
        std::thread::sleep(Duration::from_millis(2));
        let registrar_node = net.node(IN_POA).unwrap();
        let mut base = registrar_node.resource("id-in").await.unwrap();
        base.set_attr("srv", vec!["5".to_string()]);
        registrar_node.store().update(base).await.unwrap();

        assert_eq!(reconciler.tick().await, ReconcileOutcome::InSync);

        let mirror = ctx.store.get("id-in").await.unwrap();
        assert_eq!(mirror.attr_str_list("srv"), vec!["5"]);
        assert_eq!(
            ctx.state.registrar_record().unwrap().supported_releases,
            vec!["5"]
        );
    }

    #[tokio::test]
    async fn test_newer_own_base_is_pushed() {
        let (net, ctx, reconciler) = registered().await;
        std::thread::sleep(Duration::from_millis(2));
        let mut base = ctx.store.get("id-mn").await.unwrap();
        base.set_attr("poa", vec!["http://mn-new:8081".to_string()]);
        ctx.store.update(base).await.unwrap();

        assert_eq!(reconciler.tick().await, ReconcileOutcome::InSync);

        let updates = net.calls_of(SimOp::Update);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].url, RECORD_URL);
        let remote = net.node(IN_POA).unwrap().resource("id-mn").await.unwrap();
        assert_eq!(remote.attr_str_list("poa"), vec!["http://mn-new:8081"]);
    }

    #[tokio::test]
    async fn test_new_descendant_is_reported_upstream() {
        let (net, ctx, reconciler) = registered().await;
        ctx.state
            .add_descendant(child_record("/id-asn", "cse-asn", "http://asn:8082"));

        reconciler.tick().await;

        assert_eq!(net.calls_of(SimOp::Update).len(), 1);
        let remote = net.node(IN_POA).unwrap().resource("id-mn").await.unwrap();
        assert_eq!(remote.attr_str_list("dcse"), vec!["/id-asn"]);
    }

    #[tokio::test]
    async fn test_rejected_registration_leaves_unregistered() {
        let net = network();
        let ctx = mn_context(&net);
        net.force_response(
            SimOp::Create,
            BASE_URL,
            RemoteResponse::status(ResponseStatus::OriginatorHasNoPrivilege),
        );
        let mut rx = ctx.bus.subscribe();
        let reconciler = RegistrationReconciler::new(ctx.clone());

        assert_eq!(reconciler.tick().await, ReconcileOutcome::Deregistered);
        assert!(!ctx.state.is_registered());
        assert!(drain(&mut rx).is_empty());

        net.clear_faults();
        assert_eq!(reconciler.tick().await, ReconcileOutcome::Registered);
    }

    #[tokio::test]
    async fn test_deregister_removes_both_records() {
        let (net, ctx, reconciler) = registered().await;
        let mut rx = ctx.bus.subscribe();

        reconciler.deregister(Duration::from_millis(100)).await;

        assert!(net.node(IN_POA).unwrap().resource("id-mn").await.is_none());
        assert!(ctx.store.get("id-in").await.is_err());
        assert!(!ctx.state.is_registered());
        assert_eq!(kinds(&drain(&mut rx)), vec!["deregistered-from-parent"]);
    }

    #[tokio::test]
    async fn test_deregister_is_bounded_by_timeout() {
        let (net, ctx, reconciler) = registered().await;
        net.set_latency(IN_POA, Duration::from_secs(30));

        let started = std::time::Instant::now();
        reconciler.deregister(Duration::from_millis(50)).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(ctx.store.get("id-in").await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let net = network();
        let ctx = mn_context(&net);
        let reconciler = Arc::new(RegistrationReconciler::new(ctx.clone()));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reconciler.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.state.is_registered());
    }
}
