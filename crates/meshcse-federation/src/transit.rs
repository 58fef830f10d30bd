//! Transit router: relays requests addressed to resources on other nodes.
//!
//! Identifiers come in three forms:
//! - `//sp/id-x/...` (absolute, provider-prefixed)
//! - `/id-x/...` (SP-relative, node-prefixed)
//! - `id-x/...` or `sp/id-x/...` (CSE-relative)
//!
//! Only the first two can name another node for [`TransitRouter::is_transit_target`];
//! [`TransitRouter::forward`] accepts all three and tries both prefix readings.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::context::FederationContext;
use crate::error::{FederationError, Result};
use crate::registry::TargetResolution;
use crate::transport::{Operation, RemoteResponse};
use crate::types::{bare_id, NodeId};

/// Forwards CRUD requests to the node owning the target resource.
pub struct TransitRouter {
    ctx: Arc<FederationContext>,
}

impl TransitRouter {
    /// Create a router over the shared context.
    pub fn new(ctx: Arc<FederationContext>) -> Self {
        Self { ctx }
    }

    /// Whether `id` addresses a resource outside this node.
    pub fn is_transit_target(&self, id: &str) -> bool {
        let own_csi = bare_id(&self.ctx.config.cse_id);
        if let Some(absolute) = id.strip_prefix("//") {
            let mut segments = absolute.split('/');
            let sp = segments.next().unwrap_or_default();
            let csi = segments.next().unwrap_or_default();
            return sp != self.ctx.config.sp_id_bare() || csi != own_csi;
        }
        match id.strip_prefix('/') {
            Some(relative) => relative.split('/').next().unwrap_or_default() != own_csi,
            None => false,
        }
    }

    /// Remote URL for a transit target.
    pub fn route(&self, target_id: &str) -> Result<String> {
        let not_found = || FederationError::NotFound {
            id: target_id.to_string(),
        };
        for (node_id, remainder) in candidates(target_id) {
            let (record, via) = match self.ctx.state.resolve(&node_id) {
                TargetResolution::Direct(record) => (record, false),
                TargetResolution::Indirect { via } => (via, true),
                TargetResolution::Unknown => continue,
            };
            let poa = record.first_poa().ok_or_else(not_found)?;
            let url = if via {
                format!("{}/~{}/{}", poa, node_id, remainder)
            } else if remainder.is_empty() {
                record.base_url().ok_or_else(not_found)?
            } else {
                format!("{}/~/{}", poa, remainder)
            };
            return Ok(url);
        }
        Err(not_found())
    }

    /// Relay one request and return the remote response verbatim.
    pub async fn forward(
        &self,
        operation: Operation,
        target_id: &str,
        originator: &str,
        payload: Option<Value>,
    ) -> Result<RemoteResponse> {
        let url = self.route(target_id)?;
        debug!(%operation, target = %target_id, url = %url, originator, "forwarding transit request");
        let transport = &self.ctx.transport;
        let body = || payload.clone().unwrap_or_else(|| Value::Object(Map::new()));
        let response = match operation {
            Operation::Retrieve => transport.send_retrieve(&url, originator).await,
            Operation::Delete => transport.send_delete(&url, originator).await,
            Operation::Update => transport.send_update(&url, originator, body()).await,
            Operation::Create { ty } => transport.send_create(&url, originator, ty, body()).await,
        };
        self.ctx.metrics.inc_transit_forwards();
        Ok(response)
    }
}

/// Possible (owning node, remaining path) readings of an identifier, most
/// likely first.
fn candidates(target_id: &str) -> Vec<(NodeId, String)> {
    let (absolute, body) = match target_id.strip_prefix("//") {
        Some(rest) => (true, rest),
        None => (false, target_id),
    };
    let node_relative = !absolute && body.starts_with('/');
    let segments: Vec<&str> = body
        .trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let node_form = segments
        .split_first()
        .map(|(node, rest)| (format!("/{}", node), rest.join("/")));
    let provider_form = (segments.len() >= 2)
        .then(|| (format!("/{}", segments[1]), segments[2..].join("/")));

    let ordered = if absolute {
        vec![provider_form]
    } else if node_relative {
        vec![node_form, provider_form]
    } else {
        vec![provider_form, node_form]
    };
    ordered.into_iter().flatten().collect()
}
