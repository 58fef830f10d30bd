//! Registration records: one node's registration with another.
//!
//! A record is stored as a `RemoteCse` resource; this module provides the
//! typed view plus the URL arithmetic used to reach the node it describes.

use serde_json::{json, Value};

use crate::error::{FederationError, Result};
use crate::types::{bare_id, NodeId, NodeType, Resource, ResourceId, ResourceType};

/// Typed view of a `RemoteCse` resource.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRecord {
    /// Node id (`csi`) of the node this record describes.
    pub node_id: NodeId,
    /// Resource id of the record.
    pub resource_id: ResourceId,
    /// Resource name of the record.
    pub resource_name: String,
    /// Node type of the described node, when reported.
    pub node_type: Option<NodeType>,
    /// Base URLs the node can be reached at, most preferred first.
    pub points_of_access: Vec<String>,
    /// Base resource reference (`cb`) of the described node, e.g. `/id-in/cse-in`.
    pub cse_base: String,
    /// Supported release versions (`srv`).
    pub supported_releases: Vec<String>,
    /// Nodes registered below the described node (`dcse`).
    pub descendant_ids: Vec<NodeId>,
    /// Creation time (microseconds).
    pub created_us: u64,
    /// Last modification time (microseconds).
    pub modified_us: u64,
}

impl RegistrationRecord {
    /// Create a record for `node_id` with the conventional resource id and name
    /// (the node id without its leading slash).
    pub fn new(node_id: &str, cse_base: &str, points_of_access: Vec<String>) -> Self {
        let bare = bare_id(node_id).to_string();
        Self {
            node_id: node_id.to_string(),
            resource_id: bare.clone(),
            resource_name: bare,
            node_type: None,
            points_of_access,
            cse_base: cse_base.to_string(),
            supported_releases: Vec::new(),
            descendant_ids: Vec::new(),
            created_us: 0,
            modified_us: 0,
        }
    }

    /// Read a record from a stored or received `RemoteCse` resource.
    pub fn from_resource(resource: &Resource) -> Result<Self> {
        if resource.ty != ResourceType::RemoteCse {
            return Err(FederationError::InvalidResource {
                msg: format!("{} is a {}, not a registration record", resource.ri, resource.ty),
            });
        }
        let node_id = resource
            .attr_str("csi")
            .ok_or_else(|| FederationError::InvalidResource {
                msg: format!("registration record {} has no csi", resource.ri),
            })?
            .to_string();
        Ok(Self {
            node_id,
            resource_id: resource.ri.clone(),
            resource_name: resource.rn.clone(),
            node_type: resource
                .attr("cst")
                .and_then(Value::as_u64)
                .and_then(NodeType::from_code),
            points_of_access: resource.attr_str_list("poa"),
            cse_base: resource.attr_str("cb").unwrap_or_default().to_string(),
            supported_releases: resource.attr_str_list("srv"),
            descendant_ids: resource.attr_str_list("dcse"),
            created_us: resource.ct,
            modified_us: resource.lt,
        })
    }

    /// Read a record from a flat JSON body returned by a remote node.
    pub fn from_body(body: &Value) -> Result<Self> {
        let resource: Resource = serde_json::from_value(body.clone())?;
        Self::from_resource(&resource)
    }

    /// Build the resource that stores this record under `parent_ri`.
    pub fn to_resource(&self, parent_ri: &str) -> Resource {
        let mut resource = Resource::new(
            ResourceType::RemoteCse,
            self.resource_id.clone(),
            self.resource_name.clone(),
            parent_ri,
        );
        resource.set_attr("csi", self.node_id.clone());
        resource.set_attr("cb", self.cse_base.clone());
        resource.set_attr("poa", self.points_of_access.clone());
        resource.set_attr("srv", self.supported_releases.clone());
        resource.set_attr("dcse", self.descendant_ids.clone());
        resource.set_attr("rr", true);
        if let Some(node_type) = self.node_type {
            resource.set_attr("cst", node_type.code());
        }
        if self.created_us > 0 {
            resource.ct = self.created_us;
        }
        if self.modified_us > 0 {
            resource.lt = self.modified_us;
        }
        resource
    }

    /// Body sent to another node to create this record there.
    pub fn creation_body(&self) -> Value {
        let mut body = json!({
            "ty": ResourceType::RemoteCse.code(),
            "rn": self.resource_name,
            "csi": self.node_id,
            "cb": self.cse_base,
            "poa": self.points_of_access,
            "srv": self.supported_releases,
            "dcse": self.descendant_ids,
            "rr": true,
        });
        if let Some(node_type) = self.node_type {
            body["cst"] = Value::from(node_type.code());
        }
        body
    }

    /// Body sent to refresh the mutable parts of this record on another node.
    pub fn update_body(&self) -> Value {
        json!({
            "ty": ResourceType::RemoteCse.code(),
            "poa": self.points_of_access,
            "srv": self.supported_releases,
            "dcse": self.descendant_ids,
        })
    }

    /// First reachable point of access.
    pub fn first_poa(&self) -> Option<&str> {
        self.points_of_access
            .iter()
            .map(|p| p.trim_end_matches('/'))
            .find(|p| !p.is_empty())
    }

    /// URL of the described node's base resource.
    pub fn base_url(&self) -> Option<String> {
        let poa = self.first_poa()?;
        if self.cse_base.starts_with('/') {
            Some(format!("{}/~{}", poa, self.cse_base))
        } else {
            Some(format!("{}/~{}", poa, self.node_id))
        }
    }

    /// URL of resource `ri` hosted by the described node.
    pub fn resource_url(&self, ri: &str) -> Option<String> {
        let poa = self.first_poa()?;
        Some(format!("{}/~{}/{}", poa, self.node_id, ri))
    }
}
