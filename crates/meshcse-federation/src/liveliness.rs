//! Liveliness prober for nodes registered below this one.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::FederationContext;
use crate::events::FederationEvent;
use crate::record::RegistrationRecord;

/// Periodic worker that prunes children whose base resource can no longer
/// be retrieved.
pub struct LivelinessProber {
    ctx: Arc<FederationContext>,
}

impl LivelinessProber {
    /// Create a prober over the shared context.
    pub fn new(ctx: Arc<FederationContext>) -> Self {
        Self { ctx }
    }

    /// Probe every known child once. Returns the records that were pruned.
    pub async fn tick(&self) -> Vec<RegistrationRecord> {
        self.ctx.metrics.inc_probe_ticks();
        let mut pruned = Vec::new();
        for record in self.ctx.state.descendant_records() {
            if self.probe(&record).await {
                continue;
            }
            self.prune(&record).await;
            pruned.push(record);
        }
        pruned
    }

    /// Tick until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.ctx.config.liveliness_interval();
        info!(interval_secs = interval.as_secs(), "liveliness prober started");
        while !*shutdown.borrow() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            self.tick().await;
        }
        debug!("liveliness prober stopped");
    }

    async fn probe(&self, record: &RegistrationRecord) -> bool {
        let Some(url) = record.base_url() else {
            warn!(node = %record.node_id, "descendant has no point of access");
            return false;
        };
        let response = self
            .ctx
            .transport
            .send_retrieve(&url, self.ctx.originator())
            .await;
        if response.is_success() {
            debug!(node = %record.node_id, "descendant alive");
            return true;
        }
        warn!(
            node = %record.node_id,
            url = %url,
            status = %response.status,
            "descendant not reachable, removing registration"
        );
        false
    }

    async fn prune(&self, record: &RegistrationRecord) {
        self.ctx.metrics.inc_probes_failed();
        if let Err(e) = self.ctx.store.delete(&record.resource_id).await {
            if !e.is_not_found() {
                warn!(node = %record.node_id, error = %e, "failed to delete descendant record");
            }
        }
        self.ctx
            .bus
            .publish(FederationEvent::ChildDeregistered(record.clone()));
    }
}
