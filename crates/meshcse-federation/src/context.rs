//! Shared handles passed to every federation component.

use std::sync::Arc;

use crate::config::FederationConfig;
use crate::events::EventBus;
use crate::metrics::FederationMetrics;
use crate::registry::FederationState;
use crate::store::ResourceStore;
use crate::transport::RemoteTransport;

/// Everything a federation component needs: configuration, state, the event
/// bus and the two external collaborators.
pub struct FederationContext {
    /// Node configuration.
    pub config: FederationConfig,
    /// Registry of registrar and descendants.
    pub state: Arc<FederationState>,
    /// Event bus; the state is registered as its first handler.
    pub bus: EventBus,
    /// Local resource store.
    pub store: Arc<dyn ResourceStore>,
    /// Outbound request layer.
    pub transport: Arc<dyn RemoteTransport>,
    /// Counters.
    pub metrics: FederationMetrics,
}

impl FederationContext {
    /// Wire up state and bus for the given configuration.
    pub fn new(
        config: FederationConfig,
        store: Arc<dyn ResourceStore>,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        let state = Arc::new(FederationState::new(
            config.cse_id.clone(),
            config.registrar_id(),
        ));
        let bus = EventBus::new(config.event_capacity).with_handler(state.clone());
        Self {
            config,
            state,
            bus,
            store,
            transport,
            metrics: FederationMetrics::new(),
        }
    }

    /// Originator used on every outbound request.
    pub fn originator(&self) -> &str {
        &self.config.cse_id
    }

    /// Resource id of the local base resource.
    pub fn base_ri(&self) -> String {
        self.config.base_ri()
    }
}
