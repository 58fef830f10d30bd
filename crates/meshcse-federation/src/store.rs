//! Resource store interface and an in-memory implementation.
//!
//! The federation logic only needs a small slice of a node's resource store:
//! single-resource CRUD, direct-children listing and the announceable query.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{FederationError, Result};
use crate::types::{now_us, Resource, ResourceId, ResourceType};

/// Resource store operations consumed by the federation subsystem.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    /// Fetch a resource by id.
    async fn get(&self, ri: &str) -> Result<Resource>;

    /// Store a new resource below `parent_ri`. An empty `ri` asks the store
    /// to assign one.
    async fn create(&self, resource: Resource, parent_ri: &str) -> Result<Resource>;

    /// Replace an existing resource, bumping its modification time.
    async fn update(&self, resource: Resource) -> Result<Resource>;

    /// Delete a resource and its subtree.
    async fn delete(&self, ri: &str) -> Result<()>;

    /// List the direct children of a resource, optionally of one type only.
    async fn query_direct_children(
        &self,
        parent_ri: &str,
        ty: Option<ResourceType>,
    ) -> Result<Vec<Resource>>;

    /// Announceable resources naming `target` in their announce-to list.
    ///
    /// With `already_announced` false: those with no mirror on `target` yet.
    /// With `already_announced` true: those with a recorded mirror there.
    async fn query_announceable(&self, target: &str, already_announced: bool)
        -> Result<Vec<Resource>>;
}

/// Thread-safe in-memory resource store.
pub struct MemoryStore {
    resources: RwLock<HashMap<ResourceId, Resource>>,
    next_id: AtomicU64,
    clock: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            clock: AtomicU64::new(0),
        }
    }

    /// Create a store holding only the given base resource.
    pub fn with_base(base: Resource) -> Self {
        let store = Self::new();
        store.insert(base);
        store
    }

    /// Insert a resource as-is, bypassing parent and name checks. Used for
    /// bootstrapping and by simulated peers.
    pub fn insert(&self, resource: Resource) {
        self.resources.write().insert(resource.ri.clone(), resource);
    }

    /// Number of stored resources.
    pub fn len(&self) -> usize {
        self.resources.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.resources.read().is_empty()
    }

    /// Snapshot of every stored resource.
    pub fn all(&self) -> Vec<Resource> {
        self.resources.read().values().cloned().collect()
    }

    /// Find a child of `parent_ri` by name.
    pub fn child_by_name(&self, parent_ri: &str, rn: &str) -> Option<Resource> {
        self.resources
            .read()
            .values()
            .find(|r| r.pi == parent_ri && r.rn == rn)
            .cloned()
    }

    /// Strictly increasing timestamp, so creation order is total.
    fn stamp(&self, floor: u64) -> u64 {
        let candidate = now_us().max(floor);
        let prev = self.clock.fetch_max(candidate, Ordering::SeqCst);
        if prev >= candidate {
            self.clock.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            candidate
        }
    }

    fn generate_id(&self, ty: ResourceType) -> ResourceId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", ty.id_prefix(), n)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, ri: &str) -> Result<Resource> {
        self.resources
            .read()
            .get(ri)
            .cloned()
            .ok_or_else(|| FederationError::NotFound { id: ri.to_string() })
    }

    async fn create(&self, mut resource: Resource, parent_ri: &str) -> Result<Resource> {
        let mut resources = self.resources.write();
        if !resources.contains_key(parent_ri) {
            return Err(FederationError::NotFound {
                id: parent_ri.to_string(),
            });
        }
        if resource.ri.is_empty() {
            resource.ri = self.generate_id(resource.ty);
        }
        if resource.rn.is_empty() {
            resource.rn = resource.ri.clone();
        }
        if resources.contains_key(&resource.ri)
            || resources
                .values()
                .any(|r| r.pi == parent_ri && r.rn == resource.rn)
        {
            return Err(FederationError::AlreadyExists {
                id: format!("{}/{}", parent_ri, resource.rn),
            });
        }
        let now = self.stamp(0);
        resource.pi = parent_ri.to_string();
        resource.ct = now;
        resource.lt = now;
        resources.insert(resource.ri.clone(), resource.clone());
        Ok(resource)
    }

    async fn update(&self, mut resource: Resource) -> Result<Resource> {
        let mut resources = self.resources.write();
        let existing = resources
            .get_mut(&resource.ri)
            .ok_or_else(|| FederationError::NotFound {
                id: resource.ri.clone(),
            })?;
        resource.ct = existing.ct;
        resource.pi = existing.pi.clone();
        resource.lt = self.stamp(existing.lt + 1);
        *existing = resource.clone();
        Ok(resource)
    }

    async fn delete(&self, ri: &str) -> Result<()> {
        let mut resources = self.resources.write();
        if resources.remove(ri).is_none() {
            return Err(FederationError::NotFound { id: ri.to_string() });
        }
        let mut pending = vec![ri.to_string()];
        while let Some(parent) = pending.pop() {
            let children: Vec<ResourceId> = resources
                .values()
                .filter(|r| r.pi == parent)
                .map(|r| r.ri.clone())
                .collect();
            for child in children {
                resources.remove(&child);
                pending.push(child);
            }
        }
        Ok(())
    }

    async fn query_direct_children(
        &self,
        parent_ri: &str,
        ty: Option<ResourceType>,
    ) -> Result<Vec<Resource>> {
        let mut children: Vec<Resource> = self
            .resources
            .read()
            .values()
            .filter(|r| r.pi == parent_ri && ty.map_or(true, |t| r.ty == t))
            .cloned()
            .collect();
        children.sort_by_key(|r| r.ct);
        Ok(children)
    }

    async fn query_announceable(
        &self,
        target: &str,
        already_announced: bool,
    ) -> Result<Vec<Resource>> {
        let mut matches: Vec<Resource> = self
            .resources
            .read()
            .values()
            .filter(|r| r.is_announceable() && r.names_target(target))
            .filter(|r| r.is_announced_to(target) == already_announced)
            .cloned()
            .collect();
        // Parents sort before children so mirrors can nest.
        matches.sort_by_key(|r| r.ct);
        Ok(matches)
    }
}
