//! Remote registry: who this node is registered with, and who is registered
//! with this node.
//!
//! All fields sit behind one mutex. The lock is never held across an await
//! point; callers get cloned snapshots.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::events::{EventHandler, FederationEvent};
use crate::record::RegistrationRecord;
use crate::types::NodeId;

/// Outcome of resolving a node id to a way of reaching it.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetResolution {
    /// The node is the registrar or a direct child.
    Direct(RegistrationRecord),
    /// The node is only known through a child's descendant list; requests
    /// must be relayed through `via`.
    Indirect {
        /// The direct child that reported the node.
        via: RegistrationRecord,
    },
    /// The node is not known.
    Unknown,
}

impl TargetResolution {
    /// The directly reachable record, if any.
    pub fn direct(self) -> Option<RegistrationRecord> {
        match self {
            TargetResolution::Direct(record) => Some(record),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct StateInner {
    registrar_record: Option<RegistrationRecord>,
    own_record_at_registrar: Option<RegistrationRecord>,
    descendants: HashMap<NodeId, RegistrationRecord>,
}

/// Process-wide federation state.
#[derive(Debug)]
pub struct FederationState {
    local_id: NodeId,
    registrar_id: Option<NodeId>,
    inner: Mutex<StateInner>,
}

impl FederationState {
    /// Create empty state for node `local_id` with an optional configured registrar.
    pub fn new(local_id: impl Into<NodeId>, registrar_id: Option<NodeId>) -> Self {
        Self {
            local_id: local_id.into(),
            registrar_id,
            inner: Mutex::new(StateInner::default()),
        }
    }

    /// This node's id.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Configured registrar id (None for root nodes).
    pub fn registrar_id(&self) -> Option<&str> {
        self.registrar_id.as_deref()
    }

    /// Whether this node is currently registered with its registrar.
    pub fn is_registered(&self) -> bool {
        self.inner.lock().own_record_at_registrar.is_some()
    }

    /// The registrar's record, if registered.
    pub fn registrar_record(&self) -> Option<RegistrationRecord> {
        self.inner.lock().registrar_record.clone()
    }

    /// This node's record as seen at the registrar, if registered.
    pub fn own_record_at_registrar(&self) -> Option<RegistrationRecord> {
        self.inner.lock().own_record_at_registrar.clone()
    }

    /// Records of all known children.
    pub fn descendant_records(&self) -> Vec<RegistrationRecord> {
        let mut records: Vec<_> = self.inner.lock().descendants.values().cloned().collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }

    /// Record of a known child.
    pub fn descendant(&self, node_id: &str) -> Option<RegistrationRecord> {
        self.inner.lock().descendants.get(node_id).cloned()
    }

    /// Ids of all nodes this node can currently reach directly: the registrar
    /// (when registered) and all children.
    pub fn known_nodes(&self) -> Vec<NodeId> {
        let inner = self.inner.lock();
        let mut nodes: Vec<NodeId> = inner.descendants.keys().cloned().collect();
        nodes.sort();
        if let Some(registrar) = &inner.registrar_record {
            nodes.insert(0, registrar.node_id.clone());
        }
        nodes
    }

    /// All node ids reachable below this node, including transitively
    /// reported ones. This is what this node reports as its own `dcse`.
    pub fn all_descendant_ids(&self) -> Vec<NodeId> {
        let inner = self.inner.lock();
        let mut ids: Vec<NodeId> = Vec::new();
        for record in inner.descendants.values() {
            ids.push(record.node_id.clone());
            ids.extend(record.descendant_ids.iter().cloned());
        }
        ids.sort();
        ids.dedup();
        ids.retain(|id| *id != self.local_id);
        ids
    }

    /// Store a completed registration.
    pub fn set_registration(&self, registrar: RegistrationRecord, own: RegistrationRecord) {
        let mut inner = self.inner.lock();
        inner.descendants.remove(&registrar.node_id);
        inner.registrar_record = Some(registrar);
        inner.own_record_at_registrar = Some(own);
    }

    /// Forget the registration with the registrar.
    pub fn clear_registration(&self) -> Option<RegistrationRecord> {
        let mut inner = self.inner.lock();
        inner.registrar_record = None;
        inner.own_record_at_registrar.take()
    }

    /// Add a child. Returns false when it was already known or is the
    /// registrar (or this node itself).
    pub fn add_descendant(&self, record: RegistrationRecord) -> bool {
        if record.node_id == self.local_id {
            return false;
        }
        if self.registrar_id.as_deref() == Some(record.node_id.as_str()) {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner
            .registrar_record
            .as_ref()
            .is_some_and(|r| r.node_id == record.node_id)
        {
            return false;
        }
        if inner.descendants.contains_key(&record.node_id) {
            return false;
        }
        inner.descendants.insert(record.node_id.clone(), record);
        true
    }

    /// Remove a child. Returns the removed record.
    pub fn remove_descendant(&self, node_id: &str) -> Option<RegistrationRecord> {
        self.inner.lock().descendants.remove(node_id)
    }

    /// Number of known children.
    pub fn descendant_count(&self) -> usize {
        self.inner.lock().descendants.len()
    }

    /// Resolve a node id. The registrar resolves to its record, children to
    /// theirs, and nodes a child reports below itself to `Indirect`.
    pub fn resolve(&self, node_id: &str) -> TargetResolution {
        let inner = self.inner.lock();
        if let Some(registrar) = &inner.registrar_record {
            if registrar.node_id == node_id {
                return TargetResolution::Direct(registrar.clone());
            }
        }
        if let Some(record) = inner.descendants.get(node_id) {
            return TargetResolution::Direct(record.clone());
        }
        let mut children: Vec<&RegistrationRecord> = inner.descendants.values().collect();
        children.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        children
            .into_iter()
            .find(|r| r.descendant_ids.iter().any(|d| d == node_id))
            .map(|via| TargetResolution::Indirect { via: via.clone() })
            .unwrap_or(TargetResolution::Unknown)
    }

    /// Directly reachable record for a node id.
    pub fn resolve_target(&self, node_id: &str) -> Option<RegistrationRecord> {
        self.resolve(node_id).direct()
    }
}

impl EventHandler for FederationState {
    fn on_event(&self, event: &FederationEvent) {
        match event {
            FederationEvent::RegisteredToParent { registrar, own } => {
                info!(registrar = %registrar.node_id, "registered with registrar");
                self.set_registration(registrar.clone(), own.clone());
            }
            FederationEvent::DeregisteredFromParent { .. } => {
                if self.clear_registration().is_some() {
                    info!(node = %self.local_id, "deregistered from registrar");
                }
            }
            FederationEvent::ChildRegistered(record) => {
                if self.add_descendant(record.clone()) {
                    info!(child = %record.node_id, "child registered");
                } else {
                    debug!(child = %record.node_id, "child registration ignored");
                }
            }
            FederationEvent::ChildDeregistered(record) => {
                if self.remove_descendant(&record.node_id).is_some() {
                    info!(child = %record.node_id, "child deregistered");
                }
            }
            FederationEvent::ResourceDeleted(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(id: &str, poa: &str) -> RegistrationRecord {
        RegistrationRecord::new(id, &format!("{}/cse", id), vec![poa.to_string()])
    }

    fn state() -> FederationState {
        FederationState::new("/id-mn", Some("/id-in".to_string()))
    }

    #[test]
    fn test_initially_unregistered() {
        let state = state();
        assert!(!state.is_registered());
        assert!(state.registrar_record().is_none());
        assert!(state.descendant_records().is_empty());
        assert_eq!(state.registrar_id(), Some("/id-in"));
    }

    #[test]
    fn test_registered_event_sets_both_records() {
        let state = state();
        state.on_event(&FederationEvent::RegisteredToParent {
            registrar: record("/id-in", "http://in"),
            own: record("/id-mn", "http://mn"),
        });
        assert!(state.is_registered());
        assert_eq!(state.registrar_record().unwrap().node_id, "/id-in");
        assert_eq!(state.own_record_at_registrar().unwrap().node_id, "/id-mn");
    }

    #[test]
    fn test_deregistered_event_clears() {
        let state = state();
        state.set_registration(record("/id-in", "http://in"), record("/id-mn", "http://mn"));
        state.on_event(&FederationEvent::DeregisteredFromParent { own: None });
        assert!(!state.is_registered());
        assert!(state.registrar_record().is_none());
    }

    #[test]
    fn test_child_registered_is_idempotent() {
        let state = state();
        assert!(state.add_descendant(record("/id-asn", "http://asn")));
        assert!(!state.add_descendant(record("/id-asn", "http://other")));
        assert_eq!(state.descendant_count(), 1);
        assert_eq!(
            state.descendant("/id-asn").unwrap().first_poa(),
            Some("http://asn")
        );
    }

    #[test]
    fn test_registrar_never_becomes_descendant() {
        let state = state();
        state.on_event(&FederationEvent::ChildRegistered(record("/id-in", "http://in")));
        assert_eq!(state.descendant_count(), 0);
    }

    #[test]
    fn test_self_never_becomes_descendant() {
        let state = state();
        assert!(!state.add_descendant(record("/id-mn", "http://mn")));
    }

    #[test]
    fn test_root_node_rejects_registered_registrar_id() {
        let state = FederationState::new("/id-in", None);
        state.set_registration(record("/id-x", "http://x"), record("/id-in", "http://in"));
        assert!(!state.add_descendant(record("/id-x", "http://x")));
    }

    #[test]
    fn test_child_deregistered_removes() {
        let state = state();
        state.add_descendant(record("/id-asn", "http://asn"));
        state.on_event(&FederationEvent::ChildDeregistered(record("/id-asn", "")));
        assert_eq!(state.descendant_count(), 0);
        // Removing again is harmless.
        state.on_event(&FederationEvent::ChildDeregistered(record("/id-asn", "")));
    }

    #[test]
    fn test_resolve() {
        let state = state();
        state.set_registration(record("/id-in", "http://in"), record("/id-mn", "http://mn"));
        let mut child = record("/id-asn", "http://asn");
        child.descendant_ids = vec!["/id-deep".to_string()];
        state.add_descendant(child);

        assert!(matches!(state.resolve("/id-in"), TargetResolution::Direct(r) if r.node_id == "/id-in"));
        assert!(matches!(state.resolve("/id-asn"), TargetResolution::Direct(r) if r.node_id == "/id-asn"));
        assert!(matches!(
            state.resolve("/id-deep"),
            TargetResolution::Indirect { via } if via.node_id == "/id-asn"
        ));
        assert_eq!(state.resolve("/id-nowhere"), TargetResolution::Unknown);
        assert!(state.resolve_target("/id-deep").is_none());
    }

    #[test]
    fn test_known_nodes_lists_registrar_first() {
        let state = state();
        state.add_descendant(record("/id-b", "http://b"));
        state.add_descendant(record("/id-a", "http://a"));
        assert_eq!(state.known_nodes(), vec!["/id-a", "/id-b"]);
        state.set_registration(record("/id-in", "http://in"), record("/id-mn", "http://mn"));
        assert_eq!(state.known_nodes(), vec!["/id-in", "/id-a", "/id-b"]);
    }

    #[test]
    fn test_all_descendant_ids_includes_transitive() {
        let state = state();
        let mut child = record("/id-b", "http://b");
        child.descendant_ids = vec!["/id-c".to_string(), "/id-mn".to_string()];
        state.add_descendant(child);
        assert_eq!(state.all_descendant_ids(), vec!["/id-b", "/id-c"]);
    }

    #[test]
    fn test_concurrent_handlers() {
        let state = Arc::new(state());
        let mut handles = Vec::new();
        for t in 0..8 {
            let state = state.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let id = format!("/id-{}-{}", t, i % 10);
                    state.on_event(&FederationEvent::ChildRegistered(record(&id, "http://x")));
                    state.on_event(&FederationEvent::ChildRegistered(record("/id-in", "http://in")));
                    if i % 3 == 0 {
                        state.on_event(&FederationEvent::ChildDeregistered(record(&id, "")));
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(state.descendant("/id-in").is_none());
        assert!(state.descendant_count() <= 80);
    }
}
