//! The federation subsystem as one unit with an explicit lifecycle.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::announce::AnnouncementEngine;
use crate::config::FederationConfig;
use crate::context::FederationContext;
use crate::error::{FederationError, Result};
use crate::events::FederationEvent;
use crate::liveliness::LivelinessProber;
use crate::metrics::MetricsSnapshot;
use crate::reconciler::RegistrationReconciler;
use crate::record::RegistrationRecord;
use crate::registry::FederationState;
use crate::store::ResourceStore;
use crate::transit::TransitRouter;
use crate::transport::{Operation, RemoteResponse, RemoteTransport};
use crate::types::Resource;

/// Lifecycle of the subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, workers not started.
    Idle,
    /// Workers running.
    Running,
    /// Stop requested, workers winding down.
    Stopping,
    /// Stopped; cannot be restarted.
    Stopped,
}

/// Registration, liveliness, announcement and transit routing for one node.
pub struct Federation {
    ctx: Arc<FederationContext>,
    reconciler: Arc<RegistrationReconciler>,
    prober: Arc<LivelinessProber>,
    announcer: Arc<AnnouncementEngine>,
    router: TransitRouter,
    lifecycle: Mutex<LifecycleState>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Federation {
    /// Validate the configuration and wire up all components.
    pub fn new(
        config: FederationConfig,
        store: Arc<dyn ResourceStore>,
        transport: Arc<dyn RemoteTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(FederationContext::new(config, store, transport));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            reconciler: Arc::new(RegistrationReconciler::new(ctx.clone())),
            prober: Arc::new(LivelinessProber::new(ctx.clone())),
            announcer: Arc::new(AnnouncementEngine::new(ctx.clone())),
            router: TransitRouter::new(ctx.clone()),
            ctx,
            lifecycle: Mutex::new(LifecycleState::Idle),
            shutdown,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the workers the node type needs. Starting a running subsystem
    /// is a no-op; a stopped one cannot be restarted.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Stopping | LifecycleState::Stopped => {
                return Err(FederationError::Shutdown)
            }
            LifecycleState::Idle => {}
        }

        let node_type = self.ctx.config.node_type;
        let mut workers = self.workers.lock().await;
        // Subscribe before any worker can publish.
        let events = self.ctx.bus.subscribe();
        workers.push(tokio::spawn(
            self.announcer
                .clone()
                .run(events, self.shutdown.subscribe()),
        ));
        if node_type.has_registrar() {
            workers.push(tokio::spawn(
                self.reconciler.clone().run(self.shutdown.subscribe()),
            ));
        }
        if node_type.accepts_children() {
            workers.push(tokio::spawn(
                self.prober.clone().run(self.shutdown.subscribe()),
            ));
        }
        info!(
            node = %self.ctx.config.cse_id,
            node_type = %node_type,
            workers = workers.len(),
            "federation started"
        );
        *lifecycle = LifecycleState::Running;
        Ok(())
    }

    /// Stop the workers, then deregister from the registrar and drop the
    /// local registrar record. Each cleanup step is bounded by the
    /// configured shutdown timeout.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if *lifecycle != LifecycleState::Running {
                *lifecycle = LifecycleState::Stopped;
                return;
            }
            *lifecycle = LifecycleState::Stopping;
        }

        let timeout = self.ctx.config.shutdown_timeout();
        let _ = self.shutdown.send(true);
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for mut worker in workers {
            if tokio::time::timeout(timeout, &mut worker).await.is_err() {
                warn!("federation worker did not stop in time, aborting");
                worker.abort();
            }
        }
        debug!("federation workers stopped");

        self.reconciler.deregister(timeout).await;

        *self.lifecycle.lock().await = LifecycleState::Stopped;
        info!(node = %self.ctx.config.cse_id, "federation stopped");
    }

    /// Current lifecycle state.
    pub async fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.lock().await
    }

    /// Number of spawned workers.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<FederationContext> {
        &self.ctx
    }

    /// Registry of registrar and descendants.
    pub fn state(&self) -> &FederationState {
        &self.ctx.state
    }

    /// The announcement engine, for the dispatch layer's create/update hooks.
    pub fn announcer(&self) -> &AnnouncementEngine {
        &self.announcer
    }

    /// The registration reconciler.
    pub fn reconciler(&self) -> &RegistrationReconciler {
        &self.reconciler
    }

    /// The liveliness prober.
    pub fn prober(&self) -> &LivelinessProber {
        &self.prober
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Report a child that registered with this node.
    pub fn child_registered(&self, record: RegistrationRecord) {
        self.ctx.bus.publish(FederationEvent::ChildRegistered(record));
    }

    /// Report a child whose registration was removed.
    pub fn child_deregistered(&self, record: RegistrationRecord) {
        self.ctx.bus.publish(FederationEvent::ChildDeregistered(record));
    }

    /// Report a deleted local resource so its mirrors are removed.
    pub fn resource_deleted(&self, resource: Resource) {
        self.ctx.bus.publish(FederationEvent::ResourceDeleted(resource));
    }

    /// Relay a request to the node owning `target_id`.
    pub async fn forward(
        &self,
        operation: Operation,
        target_id: &str,
        originator: &str,
        payload: Option<Value>,
    ) -> Result<RemoteResponse> {
        self.router
            .forward(operation, target_id, originator, payload)
            .await
    }

    /// Whether `id` addresses a resource on another node.
    pub fn is_transit_target(&self, id: &str) -> bool {
        self.router.is_transit_target(id)
    }

    /// Records of all known children.
    pub fn descendant_records(&self) -> Vec<RegistrationRecord> {
        self.ctx.state.descendant_records()
    }

    /// Directly reachable record for a node id.
    pub fn resolve_target(&self, node_id: &str) -> Option<RegistrationRecord> {
        self.ctx.state.resolve_target(node_id)
    }
}
