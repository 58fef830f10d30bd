//! Node configuration for the federation subsystem.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::FederationError;
use crate::record::RegistrationRecord;
use crate::types::{bare_id, NodeType, Resource, ResourceType};

/// Where and how to reach the registrar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrarConfig {
    /// Registrar node id, e.g. `/id-in`.
    pub cse_id: String,
    /// Registrar base resource name, e.g. `cse-in`.
    pub cse_name: String,
    /// Registrar base URL, e.g. `http://in.example:8080`.
    pub address: String,
}

impl RegistrarConfig {
    /// URL of the registrar's base resource.
    pub fn base_url(&self) -> String {
        format!(
            "{}/~{}/{}",
            self.address.trim_end_matches('/'),
            self.cse_id,
            self.cse_name
        )
    }

    /// URL of the record a node with id `own_id` keeps at the registrar.
    pub fn record_url(&self, own_id: &str) -> String {
        format!(
            "{}/~{}/{}",
            self.address.trim_end_matches('/'),
            self.cse_id,
            bare_id(own_id)
        )
    }
}

/// Configuration for one node's federation subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// This node's id, e.g. `/id-mn`.
    pub cse_id: String,
    /// This node's base resource name, e.g. `cse-mn`.
    pub cse_name: String,
    /// Service provider id, without leading slashes.
    pub sp_id: String,
    /// This node's type.
    pub node_type: NodeType,
    /// URLs this node is reachable at.
    pub points_of_access: Vec<String>,
    /// Supported release versions.
    pub supported_releases: Vec<String>,
    /// Registrar to register with (non-root node types only).
    pub registrar: Option<RegistrarConfig>,
    /// Registration reconciler interval.
    pub check_interval_secs: u64,
    /// Descendant liveliness probe interval.
    pub liveliness_interval_secs: u64,
    /// Periodic announcement sweep interval.
    pub announcement_interval_secs: u64,
    /// Delay between a registration event and the announcement sweep it triggers.
    pub announcement_delay_ms: u64,
    /// Timeout for outbound requests.
    pub request_timeout_secs: u64,
    /// Bound on each best-effort cleanup request during shutdown.
    pub shutdown_timeout_ms: u64,
    /// Consecutive unreachable reconciler ticks before deregistering locally.
    pub max_unreachable_ticks: u32,
    /// Event bus buffer.
    pub event_capacity: usize,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            cse_id: "/id-in".to_string(),
            cse_name: "cse-in".to_string(),
            sp_id: "meshcse.example".to_string(),
            node_type: NodeType::In,
            points_of_access: vec!["http://127.0.0.1:8080".to_string()],
            supported_releases: vec!["3".to_string(), "4".to_string()],
            registrar: None,
            check_interval_secs: 30,
            liveliness_interval_secs: 30,
            announcement_interval_secs: 60,
            announcement_delay_ms: 3000,
            request_timeout_secs: 10,
            shutdown_timeout_ms: 2000,
            max_unreachable_ticks: 3,
            event_capacity: 256,
        }
    }
}

impl FederationConfig {
    /// Load from a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: FederationConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), FederationError> {
        let fail = |msg: String| Err(FederationError::Config { msg });
        if !self.cse_id.starts_with('/') || self.cse_id.len() < 2 {
            return fail(format!("cse_id must look like /id-xyz, got {:?}", self.cse_id));
        }
        if self.cse_name.is_empty() {
            return fail("cse_name must not be empty".to_string());
        }
        match (&self.registrar, self.node_type.has_registrar()) {
            (None, true) => {
                return fail(format!("{} nodes need a registrar", self.node_type));
            }
            (Some(_), false) => {
                return fail(format!("{} nodes cannot have a registrar", self.node_type));
            }
            (Some(registrar), true) => {
                if !registrar.cse_id.starts_with('/') {
                    return fail(format!(
                        "registrar cse_id must look like /id-xyz, got {:?}",
                        registrar.cse_id
                    ));
                }
                if registrar.cse_id == self.cse_id {
                    return fail("a node cannot register with itself".to_string());
                }
                if registrar.address.is_empty() {
                    return fail("registrar address must not be empty".to_string());
                }
            }
            (None, false) => {}
        }
        if self.check_interval_secs == 0
            || self.liveliness_interval_secs == 0
            || self.announcement_interval_secs == 0
        {
            return fail("intervals must be positive".to_string());
        }
        Ok(())
    }

    /// Resource id of this node's base resource.
    pub fn base_ri(&self) -> String {
        bare_id(&self.cse_id).to_string()
    }

    /// Reference to this node's base resource, e.g. `/id-mn/cse-mn`.
    pub fn base_ref(&self) -> String {
        format!("{}/{}", self.cse_id, self.cse_name)
    }

    /// Service provider id without leading slashes.
    pub fn sp_id_bare(&self) -> &str {
        self.sp_id.trim_start_matches('/')
    }

    /// The registrar's node id, if configured.
    pub fn registrar_id(&self) -> Option<String> {
        self.registrar.as_ref().map(|r| r.cse_id.clone())
    }

    /// Base resource for a fresh store.
    pub fn base_resource(&self) -> Resource {
        Resource::new(ResourceType::CseBase, self.base_ri(), self.cse_name.clone(), "")
            .with_attr("csi", self.cse_id.clone())
            .with_attr("cst", self.node_type.code())
            .with_attr("poa", self.points_of_access.clone())
            .with_attr("srv", self.supported_releases.clone())
    }

    /// The record this node registers with at its registrar.
    pub fn own_record(&self) -> RegistrationRecord {
        let mut record =
            RegistrationRecord::new(&self.cse_id, &self.base_ref(), self.points_of_access.clone());
        record.node_type = Some(self.node_type);
        record.supported_releases = self.supported_releases.clone();
        record
    }

    /// Reconciler interval.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Liveliness prober interval.
    pub fn liveliness_interval(&self) -> Duration {
        Duration::from_secs(self.liveliness_interval_secs)
    }

    /// Announcement sweep interval.
    pub fn announcement_interval(&self) -> Duration {
        Duration::from_secs(self.announcement_interval_secs)
    }

    /// Delay before post-registration sweeps.
    pub fn announcement_delay(&self) -> Duration {
        Duration::from_millis(self.announcement_delay_ms)
    }

    /// Outbound request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Shutdown cleanup timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
