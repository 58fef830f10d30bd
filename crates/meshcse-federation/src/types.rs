//! Core resource types shared by the federation subsystem.
//!
//! Resources are kept in a flat JSON-compatible shape: the universal
//! attributes are typed fields, everything type-specific lives in
//! `attributes`. Timestamps are microseconds since the Unix epoch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identifier of a node in the federation (its CSE-ID, e.g. `/id-mn`).
pub type NodeId = String;

/// Identifier of a resource inside one node's resource tree.
pub type ResourceId = String;

/// Attribute name of the internal announcement link list.
pub const ANNOUNCED_TO_ATTR: &str = "__announcedTo__";

/// Current time in microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Strip the leading `/` of an SP-relative node id (`/id-in` -> `id-in`).
pub fn bare_id(node_id: &str) -> &str {
    node_id.strip_prefix('/').unwrap_or(node_id)
}

/// Split an announce-to entry into its target node id and, when the entry has
/// been fulfilled, the remote resource id.
///
/// `/id-in` -> (`/id-in`, None), `/id-in/cnt42` -> (`/id-in`, Some(`cnt42`)).
/// SP-absolute entries (`//sp/id-in/...`) lose their service provider segment.
pub fn split_announce_entry(entry: &str) -> (&str, Option<&str>) {
    if let Some(rest) = entry.strip_prefix("//") {
        return match rest.find('/') {
            Some(idx) => split_announce_entry(&rest[idx..]),
            None => (entry, None),
        };
    }
    let body = entry.strip_prefix('/').unwrap_or(entry);
    match body.find('/') {
        Some(idx) => {
            let split = idx + (entry.len() - body.len());
            let remote = &entry[split + 1..];
            if remote.is_empty() {
                (&entry[..split], None)
            } else {
                (&entry[..split], Some(remote))
            }
        }
        None => (entry, None),
    }
}

/// Build the fulfilled form of an announce-to entry.
pub fn qualified_entry(target: &str, remote_ri: &str) -> String {
    format!("{}/{}", target, remote_ri)
}

/// Timestamps as they arrive on the wire: this crate's microsecond integers,
/// or the oneM2M `YYYYMMDDTHHMMSS[,ffffff]` strings (UTC) other nodes send.
pub mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{de, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Micros(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Wire::deserialize(deserializer)? {
            Wire::Micros(us) => Ok(us),
            Wire::Text(text) => parse(&text)
                .ok_or_else(|| de::Error::custom(format!("invalid timestamp {:?}", text))),
        }
    }

    /// Parse a oneM2M timestamp into microseconds since the Unix epoch.
    pub fn parse(text: &str) -> Option<u64> {
        let (seconds, fraction) = match text.split_once(',') {
            Some((seconds, fraction)) => (seconds, Some(fraction)),
            None => (text, None),
        };
        let at = NaiveDateTime::parse_from_str(seconds, "%Y%m%dT%H%M%S").ok()?;
        let mut us = u64::try_from(at.and_utc().timestamp_micros()).ok()?;
        if let Some(fraction) = fraction {
            if fraction.is_empty()
                || fraction.len() > 6
                || !fraction.bytes().all(|b| b.is_ascii_digit())
            {
                return None;
            }
            let digits: u64 = fraction.parse().ok()?;
            us += digits * 10u64.pow(6 - fraction.len() as u32);
        }
        Some(us)
    }
}

/// Kind of node, which decides the directions a node can federate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Infrastructure node: root of the hierarchy, never has a registrar.
    In,
    /// Middle node: registers upstream and accepts children.
    Mn,
    /// Application service node: registers upstream, leaf of the hierarchy.
    Asn,
}

impl NodeType {
    /// Whether this node type registers with a parent.
    pub fn has_registrar(self) -> bool {
        matches!(self, NodeType::Mn | NodeType::Asn)
    }

    /// Whether other nodes can register with this node type.
    pub fn accepts_children(self) -> bool {
        matches!(self, NodeType::In | NodeType::Mn)
    }

    /// Numeric `cst` code.
    pub fn code(self) -> u64 {
        match self {
            NodeType::In => 1,
            NodeType::Mn => 2,
            NodeType::Asn => 3,
        }
    }

    /// Parse a numeric `cst` code.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(NodeType::In),
            2 => Some(NodeType::Mn),
            3 => Some(NodeType::Asn),
            _ => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::In => "IN",
            NodeType::Mn => "MN",
            NodeType::Asn => "ASN",
        };
        f.write_str(s)
    }
}

/// Resource types the subsystem knows about, with their numeric `ty` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum ResourceType {
    /// Access control policy.
    AccessControlPolicy,
    /// Application entity.
    Ae,
    /// Container.
    Container,
    /// Content instance.
    ContentInstance,
    /// Base resource of a node.
    CseBase,
    /// Group.
    Group,
    /// Management node.
    Node,
    /// Registration record of another node (remoteCSE).
    RemoteCse,
    /// Subscription.
    Subscription,
    /// Flexible container.
    FlexContainer,
    /// Announced access control policy.
    AccessControlPolicyAnnc,
    /// Announced application entity.
    AeAnnc,
    /// Announced container.
    ContainerAnnc,
    /// Announced content instance.
    ContentInstanceAnnc,
    /// Announced group.
    GroupAnnc,
    /// Announced management node.
    NodeAnnc,
    /// Announced registration record.
    RemoteCseAnnc,
    /// Announced flexible container.
    FlexContainerAnnc,
}

impl ResourceType {
    /// Numeric `ty` code.
    pub fn code(self) -> u32 {
        match self {
            ResourceType::AccessControlPolicy => 1,
            ResourceType::Ae => 2,
            ResourceType::Container => 3,
            ResourceType::ContentInstance => 4,
            ResourceType::CseBase => 5,
            ResourceType::Group => 9,
            ResourceType::Node => 14,
            ResourceType::RemoteCse => 16,
            ResourceType::Subscription => 23,
            ResourceType::FlexContainer => 28,
            ResourceType::AccessControlPolicyAnnc => 10001,
            ResourceType::AeAnnc => 10002,
            ResourceType::ContainerAnnc => 10003,
            ResourceType::ContentInstanceAnnc => 10004,
            ResourceType::GroupAnnc => 10009,
            ResourceType::NodeAnnc => 10014,
            ResourceType::RemoteCseAnnc => 10016,
            ResourceType::FlexContainerAnnc => 10028,
        }
    }

    /// Parse a numeric `ty` code.
    pub fn from_code(code: u32) -> Option<Self> {
        let ty = match code {
            1 => ResourceType::AccessControlPolicy,
            2 => ResourceType::Ae,
            3 => ResourceType::Container,
            4 => ResourceType::ContentInstance,
            5 => ResourceType::CseBase,
            9 => ResourceType::Group,
            14 => ResourceType::Node,
            16 => ResourceType::RemoteCse,
            23 => ResourceType::Subscription,
            28 => ResourceType::FlexContainer,
            10001 => ResourceType::AccessControlPolicyAnnc,
            10002 => ResourceType::AeAnnc,
            10003 => ResourceType::ContainerAnnc,
            10004 => ResourceType::ContentInstanceAnnc,
            10009 => ResourceType::GroupAnnc,
            10014 => ResourceType::NodeAnnc,
            10016 => ResourceType::RemoteCseAnnc,
            10028 => ResourceType::FlexContainerAnnc,
            _ => return None,
        };
        Some(ty)
    }

    /// The announced variant of this type, if the type can be announced.
    pub fn announced(self) -> Option<ResourceType> {
        match self {
            ResourceType::AccessControlPolicy => Some(ResourceType::AccessControlPolicyAnnc),
            ResourceType::Ae => Some(ResourceType::AeAnnc),
            ResourceType::Container => Some(ResourceType::ContainerAnnc),
            ResourceType::ContentInstance => Some(ResourceType::ContentInstanceAnnc),
            ResourceType::Group => Some(ResourceType::GroupAnnc),
            ResourceType::Node => Some(ResourceType::NodeAnnc),
            ResourceType::RemoteCse => Some(ResourceType::RemoteCseAnnc),
            ResourceType::FlexContainer => Some(ResourceType::FlexContainerAnnc),
            _ => None,
        }
    }

    /// Whether this is an announced (mirror) type.
    pub fn is_announced(self) -> bool {
        self.code() > 10000
    }

    /// Whether resources of this type can be announced to other nodes.
    pub fn is_announceable(self) -> bool {
        self.announced().is_some()
    }

    /// Type-specific attributes that are always carried by the announced variant.
    pub fn announced_attributes(self) -> &'static [&'static str] {
        match self {
            ResourceType::AccessControlPolicy => &["pv", "pvs"],
            ResourceType::Ae => &["api", "apn", "aei", "rr", "srv"],
            ResourceType::Container => &["mni", "mbs", "mia"],
            ResourceType::ContentInstance => &["cnf", "cs", "con"],
            ResourceType::Group => &["mt", "cnm", "mnm", "mid"],
            ResourceType::Node => &["ni"],
            ResourceType::RemoteCse => &["csi", "cst", "srv"],
            ResourceType::FlexContainer => &["cnd", "cs"],
            _ => &[],
        }
    }

    /// Wire name used in oneM2M JSON primitives.
    pub fn short_name(self) -> &'static str {
        match self {
            ResourceType::AccessControlPolicy => "m2m:acp",
            ResourceType::Ae => "m2m:ae",
            ResourceType::Container => "m2m:cnt",
            ResourceType::ContentInstance => "m2m:cin",
            ResourceType::CseBase => "m2m:cb",
            ResourceType::Group => "m2m:grp",
            ResourceType::Node => "m2m:nod",
            ResourceType::RemoteCse => "m2m:csr",
            ResourceType::Subscription => "m2m:sub",
            ResourceType::FlexContainer => "m2m:fcnt",
            ResourceType::AccessControlPolicyAnnc => "m2m:acpA",
            ResourceType::AeAnnc => "m2m:aeA",
            ResourceType::ContainerAnnc => "m2m:cntA",
            ResourceType::ContentInstanceAnnc => "m2m:cinA",
            ResourceType::GroupAnnc => "m2m:grpA",
            ResourceType::NodeAnnc => "m2m:nodA",
            ResourceType::RemoteCseAnnc => "m2m:csrA",
            ResourceType::FlexContainerAnnc => "m2m:fcntA",
        }
    }

    /// Reverse of [`ResourceType::short_name`].
    pub fn from_short_name(name: &str) -> Option<Self> {
        ALL_TYPES.iter().copied().find(|ty| ty.short_name() == name)
    }

    /// Prefix used when generating resource ids.
    pub fn id_prefix(self) -> &'static str {
        match self {
            ResourceType::AccessControlPolicy => "acp",
            ResourceType::Ae => "ae",
            ResourceType::Container => "cnt",
            ResourceType::ContentInstance => "cin",
            ResourceType::CseBase => "cb",
            ResourceType::Group => "grp",
            ResourceType::Node => "nod",
            ResourceType::RemoteCse => "csr",
            ResourceType::Subscription => "sub",
            ResourceType::FlexContainer => "fcnt",
            ResourceType::AccessControlPolicyAnnc => "acpA",
            ResourceType::AeAnnc => "aeA",
            ResourceType::ContainerAnnc => "cntA",
            ResourceType::ContentInstanceAnnc => "cinA",
            ResourceType::GroupAnnc => "grpA",
            ResourceType::NodeAnnc => "nodA",
            ResourceType::RemoteCseAnnc => "csrA",
            ResourceType::FlexContainerAnnc => "fcntA",
        }
    }
}

const ALL_TYPES: [ResourceType; 18] = [
    ResourceType::AccessControlPolicy,
    ResourceType::Ae,
    ResourceType::Container,
    ResourceType::ContentInstance,
    ResourceType::CseBase,
    ResourceType::Group,
    ResourceType::Node,
    ResourceType::RemoteCse,
    ResourceType::Subscription,
    ResourceType::FlexContainer,
    ResourceType::AccessControlPolicyAnnc,
    ResourceType::AeAnnc,
    ResourceType::ContainerAnnc,
    ResourceType::ContentInstanceAnnc,
    ResourceType::GroupAnnc,
    ResourceType::NodeAnnc,
    ResourceType::RemoteCseAnnc,
    ResourceType::FlexContainerAnnc,
];

impl TryFrom<u32> for ResourceType {
    type Error = String;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        ResourceType::from_code(code).ok_or_else(|| format!("unknown resource type {}", code))
    }
}

impl From<ResourceType> for u32 {
    fn from(ty: ResourceType) -> u32 {
        ty.code()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.short_name(), self.code())
    }
}

/// Where a local resource has been mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnnouncementLink {
    /// Node the mirror lives on.
    pub target: NodeId,
    /// Resource id of the mirror on that node.
    pub remote_ri: ResourceId,
}

impl AnnouncementLink {
    /// Create a new link.
    pub fn new(target: impl Into<NodeId>, remote_ri: impl Into<ResourceId>) -> Self {
        Self {
            target: target.into(),
            remote_ri: remote_ri.into(),
        }
    }

    /// The announce-to entry this link corresponds to.
    pub fn entry(&self) -> String {
        qualified_entry(&self.target, &self.remote_ri)
    }
}

/// A resource in a node's resource tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource id, unique within the node.
    pub ri: ResourceId,
    /// Resource name, unique among siblings.
    pub rn: String,
    /// Resource type.
    pub ty: ResourceType,
    /// Parent resource id (empty for the base resource).
    #[serde(default)]
    pub pi: ResourceId,
    /// Creation time (microseconds).
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    pub ct: u64,
    /// Last modification time (microseconds).
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    pub lt: u64,
    /// Announce-to targets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub at: Vec<String>,
    /// Optional attributes to carry in announced variants.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aa: Vec<String>,
    /// Access control policy ids. Never propagated to mirrors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acpi: Vec<String>,
    /// Labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lbl: Vec<String>,
    /// Internal announcement bookkeeping.
    #[serde(
        rename = "__announcedTo__",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub announced_to: Vec<AnnouncementLink>,
    /// Type-specific attributes.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Resource {
    /// Create a resource with empty optional attributes.
    pub fn new(
        ty: ResourceType,
        ri: impl Into<ResourceId>,
        rn: impl Into<String>,
        pi: impl Into<ResourceId>,
    ) -> Self {
        let now = now_us();
        Self {
            ri: ri.into(),
            rn: rn.into(),
            ty,
            pi: pi.into(),
            ct: now,
            lt: now,
            at: Vec::new(),
            aa: Vec::new(),
            acpi: Vec::new(),
            lbl: Vec::new(),
            announced_to: Vec::new(),
            attributes: Map::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Set a type-specific attribute.
    pub fn set_attr(&mut self, name: &str, value: impl Into<Value>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    /// Get a type-specific attribute.
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Get a string attribute.
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    /// Get a string-list attribute; missing or mistyped entries yield an empty list.
    pub fn attr_str_list(&self, name: &str) -> Vec<String> {
        self.attributes
            .get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bump the modification time.
    pub fn touch(&mut self) {
        self.lt = now_us().max(self.lt + 1);
    }

    /// JSON shape presented to clients and remote nodes. The announcement
    /// link list is internal and never leaves the node.
    pub fn public_view(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove(ANNOUNCED_TO_ATTR);
        }
        value
    }

    /// Whether this resource can be mirrored at all.
    pub fn is_announceable(&self) -> bool {
        self.ty.is_announceable()
    }

    /// Distinct target node ids named in `at`, in order of appearance.
    pub fn announce_targets(&self) -> Vec<NodeId> {
        let mut targets: Vec<NodeId> = Vec::new();
        for entry in &self.at {
            let (target, _) = split_announce_entry(entry);
            if !targets.iter().any(|t| t == target) {
                targets.push(target.to_string());
            }
        }
        targets
    }

    /// The link recorded for a target, if any.
    pub fn link_for(&self, target: &str) -> Option<&AnnouncementLink> {
        self.announced_to.iter().find(|l| l.target == target)
    }

    /// Whether a mirror is recorded for the target.
    pub fn is_announced_to(&self, target: &str) -> bool {
        self.link_for(target).is_some()
    }

    /// Whether `at` contains the target in bare or qualified form.
    pub fn names_target(&self, target: &str) -> bool {
        self.at
            .iter()
            .any(|entry| split_announce_entry(entry).0 == target)
    }

    /// Record a fulfilled announcement: adds the link and rewrites the
    /// target's `at` entries to the single qualified form.
    pub fn record_announcement(&mut self, target: &str, remote_ri: &str) {
        self.announced_to.retain(|l| l.target != target);
        self.announced_to.push(AnnouncementLink::new(target, remote_ri));
        let qualified = qualified_entry(target, remote_ri);
        let mut replaced = false;
        let mut entries = Vec::with_capacity(self.at.len());
        for entry in self.at.drain(..) {
            if split_announce_entry(&entry).0 == target {
                if !replaced {
                    entries.push(qualified.clone());
                    replaced = true;
                }
            } else {
                entries.push(entry);
            }
        }
        if !replaced {
            entries.push(qualified);
        }
        self.at = entries;
    }

    /// Drop every trace of a target: its link and its `at` entries.
    /// Returns the removed link, if one existed.
    pub fn forget_target(&mut self, target: &str) -> Option<AnnouncementLink> {
        self.at
            .retain(|entry| split_announce_entry(entry).0 != target);
        let idx = self.announced_to.iter().position(|l| l.target == target)?;
        Some(self.announced_to.remove(idx))
    }

    /// Drop only the link of a target, leaving `at` untouched.
    pub fn remove_link(&mut self, target: &str) -> Option<AnnouncementLink> {
        let idx = self.announced_to.iter().position(|l| l.target == target)?;
        Some(self.announced_to.remove(idx))
    }

    /// Check that links and qualified `at` entries correspond one to one.
    pub fn links_consistent(&self) -> bool {
        let qualified: Vec<(&str, &str)> = self
            .at
            .iter()
            .filter_map(|entry| match split_announce_entry(entry) {
                (target, Some(remote)) => Some((target, remote)),
                _ => None,
            })
            .collect();
        qualified.len() == self.announced_to.len()
            && self.announced_to.iter().all(|link| {
                qualified
                    .iter()
                    .any(|(t, r)| *t == link.target && *r == link.remote_ri)
            })
    }
}
