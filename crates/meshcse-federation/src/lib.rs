#![warn(missing_docs)]

//! meshcse federation subsystem: registrar registration, descendant liveliness,
//! resource announcement and transit routing for a oneM2M-style CSE node.

pub mod announce;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod liveliness;
pub mod manager;
pub mod metrics;
pub mod reconciler;
pub mod record;
pub mod registry;
pub mod sim;
pub mod store;
pub mod transit;
pub mod transport;
pub mod types;

pub use announce::AnnouncementEngine;
pub use config::{FederationConfig, RegistrarConfig};
pub use context::FederationContext;
pub use error::{FederationError, Result};
pub use events::{EventBus, EventHandler, FederationEvent};
pub use liveliness::LivelinessProber;
pub use manager::{Federation, LifecycleState};
pub use metrics::{FederationMetrics, MetricsSnapshot};
pub use reconciler::{ReconcileOutcome, RegistrationReconciler};
pub use record::RegistrationRecord;
pub use registry::{FederationState, TargetResolution};
pub use store::{MemoryStore, ResourceStore};
pub use transit::TransitRouter;
pub use transport::{HttpTransport, HttpTransportConfig, Operation, RemoteResponse, RemoteTransport, ResponseStatus};
pub use types::{AnnouncementLink, NodeId, NodeType, Resource, ResourceId, ResourceType};
