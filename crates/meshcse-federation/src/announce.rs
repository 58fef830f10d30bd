//! Announcement engine: mirrors local resources onto other nodes.
//!
//! The announce-to attribute (`at`) carries the client's intent. A target is
//! fulfilled once a mirror was created on it; the resource then holds an
//! [`AnnouncementLink`](crate::types::AnnouncementLink) and the `at` entry is
//! rewritten to `target/remoteId`. Links are only added after a confirmed
//! remote create.
//!
//! Local links are the source of truth for "do we still think this mirror
//! exists". Removing a mirror always drops the link, whatever the remote
//! delete returned; the remote call is a notification, not a commit step.
//! Do not make link removal conditional on remote success: an unreachable
//! peer would then keep stale links forever and block re-announcement.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::context::FederationContext;
use crate::error::{FederationError, Result};
use crate::events::FederationEvent;
use crate::record::RegistrationRecord;
use crate::registry::TargetResolution;
use crate::transport::ResponseStatus;
use crate::types::{bare_id, NodeId, Resource, ResourceId, ResourceType};

/// Bookkeeping produced by one remote step for one target. Changes are
/// applied to the stored resource as it is when the step finishes, so edits
/// that landed while the remote call was in flight are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkChange {
    /// A mirror exists on the target.
    Linked { target: NodeId, remote_ri: ResourceId },
    /// Link and `at` entries of the target are gone.
    Forgotten { target: NodeId },
}

impl LinkChange {
    fn apply(&self, resource: &mut Resource) {
        match self {
            LinkChange::Linked { target, remote_ri } => {
                resource.record_announcement(target, remote_ri)
            }
            LinkChange::Forgotten { target } => {
                resource.forget_target(target);
            }
        }
    }
}

/// Creates, updates and removes mirrors of local resources.
pub struct AnnouncementEngine {
    ctx: Arc<FederationContext>,
    // Serializes engine operations so two sweeps never announce the same
    // resource concurrently.
    op_lock: Mutex<()>,
}

impl AnnouncementEngine {
    /// Create an engine over the shared context.
    pub fn new(ctx: Arc<FederationContext>) -> Self {
        Self {
            ctx,
            op_lock: Mutex::new(()),
        }
    }

    /// Announce a resource to every unfulfilled target in its `at` list.
    /// Unresolvable or failing targets are dropped from `at`. Returns the
    /// resource as persisted.
    pub async fn announce(&self, resource: Resource) -> Result<Resource> {
        let _guard = self.op_lock.lock().await;
        self.announce_targets(resource, None).await
    }

    /// Remove every mirror of a resource and persist the cleaned resource.
    pub async fn deannounce(&self, resource: Resource) -> Result<Resource> {
        let _guard = self.op_lock.lock().await;
        let mut resource = resource;
        let targets: Vec<NodeId> = resource
            .announced_to
            .iter()
            .map(|l| l.target.clone())
            .collect();
        if targets.is_empty() {
            return Ok(resource);
        }
        let mut changes = Vec::with_capacity(targets.len());
        for target in &targets {
            changes.push(self.remove_mirror(&mut resource, target).await);
        }
        self.persist_links(&resource.ri, &changes).await
    }

    /// Bring the mirrors of a locally updated resource in line with its `at`
    /// list: removed targets lose their mirror, new targets get one, and
    /// unchanged targets receive the updated content.
    pub async fn reconcile_announcements(&self, resource: Resource) -> Result<Resource> {
        let _guard = self.op_lock.lock().await;
        let mut resource = resource;
        let wanted = resource.announce_targets();
        let linked: Vec<NodeId> = resource
            .announced_to
            .iter()
            .map(|l| l.target.clone())
            .collect();
        let mut changes = Vec::new();

        for target in linked.iter().filter(|t| !wanted.contains(t)) {
            changes.push(self.remove_mirror(&mut resource, target).await);
        }

        for target in linked.iter().filter(|t| wanted.contains(t)) {
            changes.extend(self.update_mirror(&mut resource, target).await);
        }

        let added: Vec<NodeId> = wanted
            .into_iter()
            .filter(|t| !linked.contains(t))
            .collect();
        for target in &added {
            changes.extend(self.announce_one(&mut resource, target).await);
        }

        if changes.is_empty() {
            Ok(resource)
        } else {
            self.persist_links(&resource.ri, &changes).await
        }
    }

    /// Announce every local resource that names `target` and has no mirror
    /// there yet. Returns the number of mirrors created.
    pub async fn sweep(&self, target: &str) -> Result<usize> {
        let _guard = self.op_lock.lock().await;
        if target == self.ctx.state.local_id() {
            return Ok(0);
        }
        let pending = self.ctx.store.query_announceable(target, false).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!(target_node = %target, count = pending.len(), "announcement sweep");
        let mut created = 0;
        for resource in pending {
            let ri = resource.ri.clone();
            match self.announce_targets(resource, Some(target)).await {
                Ok(stored) if stored.is_announced_to(target) => created += 1,
                Ok(_) => {}
                Err(e) => warn!(resource = %ri, target_node = %target, error = %e, "announce failed"),
            }
        }
        Ok(created)
    }

    /// Forget every mirror on `target` without contacting it. Used when the
    /// target went away. Returns the number of resources cleaned.
    pub async fn sweep_for_removal(&self, target: &str) -> Result<usize> {
        let _guard = self.op_lock.lock().await;
        let announced = self.ctx.store.query_announceable(target, true).await?;
        let mut cleaned = 0;
        let forgotten = [LinkChange::Forgotten {
            target: target.to_string(),
        }];
        for resource in announced {
            self.ctx.metrics.inc_announcements_removed();
            let ri = resource.ri;
            match self.persist_links(&ri, &forgotten).await {
                Ok(_) => cleaned += 1,
                Err(e) => warn!(resource = %ri, error = %e, "failed to persist link removal"),
            }
        }
        if cleaned > 0 {
            info!(target_node = %target, cleaned, "dropped announcements to departed node");
        }
        Ok(cleaned)
    }

    /// Remove the mirrors of a resource that no longer exists locally.
    pub async fn resource_deleted(&self, resource: &Resource) {
        let _guard = self.op_lock.lock().await;
        let mut resource = resource.clone();
        let targets: Vec<NodeId> = resource
            .announced_to
            .iter()
            .map(|l| l.target.clone())
            .collect();
        for target in &targets {
            self.remove_mirror(&mut resource, target).await;
        }
    }

    /// Sweep every directly reachable node.
    pub async fn sweep_all(&self) {
        for node in self.ctx.state.known_nodes() {
            if let Err(e) = self.sweep(&node).await {
                warn!(target_node = %node, error = %e, "announcement sweep failed");
            }
        }
    }

    /// React to federation events and sweep periodically until `shutdown`
    /// flips. `events` must be subscribed before the other workers start.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<FederationEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let interval = self.ctx.config.announcement_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        info!(interval_secs = interval.as_secs(), "announcement engine started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.sweep_all().await,
                event = events.recv() => match event {
                    Ok(event) => {
                        if !self.handle_event(event, &mut shutdown).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "announcement engine lagged, running full sweep");
                        self.sweep_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("announcement engine stopped");
    }

    /// Returns false when shutdown was requested while waiting.
    async fn handle_event(&self, event: FederationEvent, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.ctx.config.announcement_delay();
        match event {
            FederationEvent::RegisteredToParent { registrar, .. } => {
                if !settle(delay, shutdown).await {
                    return false;
                }
                self.sweep_logged(&registrar.node_id).await;
            }
            FederationEvent::ChildRegistered(record) => {
                if !settle(delay, shutdown).await {
                    return false;
                }
                self.sweep_logged(&record.node_id).await;
            }
            FederationEvent::DeregisteredFromParent { .. } => {
                if let Some(registrar) = self.ctx.config.registrar_id() {
                    self.sweep_for_removal_logged(&registrar).await;
                }
            }
            FederationEvent::ChildDeregistered(record) => {
                self.sweep_for_removal_logged(&record.node_id).await;
            }
            FederationEvent::ResourceDeleted(resource) => {
                self.resource_deleted(&resource).await;
            }
        }
        true
    }

    async fn sweep_logged(&self, target: &str) {
        if let Err(e) = self.sweep(target).await {
            warn!(target_node = %target, error = %e, "announcement sweep failed");
        }
    }

    async fn sweep_for_removal_logged(&self, target: &str) {
        if let Err(e) = self.sweep_for_removal(target).await {
            warn!(target_node = %target, error = %e, "announcement removal sweep failed");
        }
    }

    async fn announce_targets(&self, mut resource: Resource, only: Option<&str>) -> Result<Resource> {
        let mut changes = Vec::new();
        for target in resource.announce_targets() {
            if only.is_some_and(|o| o != target) || resource.is_announced_to(&target) {
                continue;
            }
            changes.extend(self.announce_one(&mut resource, &target).await);
        }
        if changes.is_empty() {
            Ok(resource)
        } else {
            self.persist_links(&resource.ri, &changes).await
        }
    }

    /// Announce to one target. The change is applied to `resource` in memory
    /// and returned for persisting; `None` means nothing changed.
    async fn announce_one(&self, resource: &mut Resource, target: &str) -> Option<LinkChange> {
        if target == self.ctx.state.local_id() {
            return None;
        }
        let change = match self.create_mirror(resource, target).await {
            Ok(remote_ri) => {
                info!(resource = %resource.ri, target_node = %target, remote = %remote_ri, "announced");
                self.ctx.metrics.inc_announcements_created();
                LinkChange::Linked {
                    target: target.to_string(),
                    remote_ri,
                }
            }
            Err(e) => {
                warn!(resource = %resource.ri, target_node = %target, error = %e, "dropping announcement target");
                self.ctx.metrics.inc_announce_targets_dropped();
                LinkChange::Forgotten {
                    target: target.to_string(),
                }
            }
        };
        change.apply(resource);
        Some(change)
    }

    async fn create_mirror(&self, resource: &Resource, target: &str) -> Result<String> {
        let annc_ty = resource
            .ty
            .announced()
            .ok_or_else(|| FederationError::InvalidResource {
                msg: format!("{} cannot be announced", resource.ty),
            })?;
        let record = self.direct_record(target)?;
        let parent_url = self
            .mirror_parent_url(resource, &record)
            .await
            .ok_or_else(|| FederationError::NotFound {
                id: format!("point of access of {}", target),
            })?;
        let body = self.announced_body(resource, annc_ty);

        let response = self
            .ctx
            .transport
            .send_create(&parent_url, self.ctx.originator(), annc_ty, body)
            .await;
        if response.is_success() {
            return response
                .body_str("ri")
                .map(str::to_string)
                .ok_or_else(|| FederationError::InvalidResource {
                    msg: format!("{} returned no resource id", parent_url),
                });
        }
        if response.status != ResponseStatus::AlreadyExists {
            return Err(FederationError::from_response(&parent_url, &response));
        }

        // A mirror from an earlier attempt is still there; adopt it.
        if let Some(ri) = response.body_str("ri") {
            return Ok(ri.to_string());
        }
        let existing_url = format!("{}/{}", parent_url, resource.rn);
        let existing = self
            .ctx
            .transport
            .send_retrieve(&existing_url, self.ctx.originator())
            .await;
        match existing.body_str("ri") {
            Some(ri) if existing.is_success() => Ok(ri.to_string()),
            _ => Err(FederationError::from_response(&parent_url, &response)),
        }
    }

    /// Send the current content to an existing mirror. A mirror that vanished
    /// remotely is recreated. Returns the change when the resource changed.
    async fn update_mirror(&self, resource: &mut Resource, target: &str) -> Option<LinkChange> {
        let link = resource.link_for(target).cloned()?;
        let Some(url) = self.mirror_url(target, &link.remote_ri) else {
            debug!(resource = %resource.ri, target_node = %target, "mirror target not reachable, skipping update");
            return None;
        };
        let annc_ty = resource.ty.announced()?;
        let mut body = self.announced_body(resource, annc_ty);
        if let Some(map) = body.as_object_mut() {
            map.remove("rn");
        }

        let response = self
            .ctx
            .transport
            .send_update(&url, self.ctx.originator(), body)
            .await;
        if response.is_success() {
            self.ctx.metrics.inc_announcements_updated();
            let before = resource.at.clone();
            let change = LinkChange::Linked {
                target: target.to_string(),
                remote_ri: link.remote_ri,
            };
            change.apply(resource);
            return (resource.at != before).then_some(change);
        }
        if response.status == ResponseStatus::NotFound {
            info!(resource = %resource.ri, target_node = %target, "mirror vanished, announcing again");
            resource.remove_link(target);
            return self.announce_one(resource, target).await;
        }
        warn!(
            resource = %resource.ri,
            target_node = %target,
            status = %response.status,
            "mirror update failed"
        );
        None
    }

    /// Best-effort remote delete, then unconditional local link removal.
    async fn remove_mirror(&self, resource: &mut Resource, target: &str) -> LinkChange {
        if let Some(link) = resource.link_for(target).cloned() {
            self.delete_remote(&resource.ri, target, &link.remote_ri).await;
        }
        let change = LinkChange::Forgotten {
            target: target.to_string(),
        };
        change.apply(resource);
        self.ctx.metrics.inc_announcements_removed();
        change
    }

    async fn delete_remote(&self, ri: &str, target: &str, remote_ri: &str) {
        let Some(url) = self.mirror_url(target, remote_ri) else {
            debug!(resource = %ri, target_node = %target, "mirror target unknown, forgetting link");
            return;
        };
        let response = self
            .ctx
            .transport
            .send_delete(&url, self.ctx.originator())
            .await;
        if response.is_success() || response.status == ResponseStatus::NotFound {
            debug!(resource = %ri, target_node = %target, "mirror removed");
        } else {
            warn!(
                resource = %ri,
                target_node = %target,
                status = %response.status,
                "mirror delete failed, forgetting link anyway"
            );
        }
    }

    fn direct_record(&self, target: &str) -> Result<RegistrationRecord> {
        match self.ctx.state.resolve(target) {
            TargetResolution::Direct(record) => Ok(record),
            TargetResolution::Indirect { via } => Err(FederationError::NotFound {
                id: format!("{} (only reachable through {})", target, via.node_id),
            }),
            TargetResolution::Unknown => Err(FederationError::NotFound {
                id: target.to_string(),
            }),
        }
    }

    fn mirror_url(&self, target: &str, remote_ri: &str) -> Option<String> {
        self.direct_record(target).ok()?.resource_url(remote_ri)
    }

    /// Where the mirror is created: under the parent's mirror when the parent
    /// is announced to the same target, otherwise under this node's
    /// registration record there.
    async fn mirror_parent_url(&self, resource: &Resource, target: &RegistrationRecord) -> Option<String> {
        if !resource.pi.is_empty() && resource.pi != self.ctx.base_ri() {
            if let Ok(parent) = self.ctx.store.get(&resource.pi).await {
                if let Some(link) = parent.link_for(&target.node_id) {
                    return target.resource_url(&link.remote_ri);
                }
            }
        }
        target.resource_url(bare_id(self.ctx.state.local_id()))
    }

    /// Content of the announced variant. Access control policies are never
    /// carried over.
    fn announced_body(&self, resource: &Resource, annc_ty: ResourceType) -> Value {
        let mut body = Map::new();
        body.insert("ty".to_string(), Value::from(annc_ty.code()));
        body.insert("rn".to_string(), Value::from(resource.rn.clone()));
        body.insert(
            "lnk".to_string(),
            Value::from(format!("{}/{}", self.ctx.state.local_id(), resource.ri)),
        );
        if !resource.lbl.is_empty() {
            body.insert("lbl".to_string(), Value::from(resource.lbl.clone()));
        }
        let optional = resource.aa.iter().map(String::as_str);
        for name in resource.ty.announced_attributes().iter().copied().chain(optional) {
            if let Some(value) = resource.attr(name) {
                body.insert(name.to_string(), value.clone());
            }
        }
        Value::Object(body)
    }

    /// Apply link changes on top of the current stored resource. A mirror
    /// whose target was withdrawn from `at` in the meantime is removed again.
    async fn persist_links(&self, ri: &str, changes: &[LinkChange]) -> Result<Resource> {
        let mut current = self.ctx.store.get(ri).await?;
        let mut withdrawn = Vec::new();
        for change in changes {
            match change {
                LinkChange::Linked { target, remote_ri }
                    if !current.names_target(target) && !current.is_announced_to(target) =>
                {
                    withdrawn.push((target, remote_ri));
                }
                change => change.apply(&mut current),
            }
        }
        let stored = self.ctx.store.update(current).await?;
        for (target, remote_ri) in withdrawn {
            info!(resource = %ri, target_node = %target, "target withdrawn during announcement");
            self.delete_remote(ri, target, remote_ri).await;
            self.ctx.metrics.inc_announcements_removed();
        }
        Ok(stored)
    }
}

/// Wait for a registration to settle on both sides. Returns false on shutdown.
async fn settle(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if delay.is_zero() {
        return !*shutdown.borrow();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}
