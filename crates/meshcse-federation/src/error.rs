//! Error types for the federation subsystem.

use thiserror::Error;

use crate::transport::{RemoteResponse, ResponseStatus};

/// Errors that can occur in the federation subsystem.
#[derive(Debug, Error)]
pub enum FederationError {
    /// Resource or node is unknown.
    #[error("not found: {id}")]
    NotFound {
        /// The identifier that could not be resolved.
        id: String,
    },

    /// A resource with the same identity already exists.
    #[error("already exists: {id}")]
    AlreadyExists {
        /// The conflicting identifier.
        id: String,
    },

    /// Remote peer could not be reached.
    #[error("target unreachable: {target}: {msg}")]
    Unreachable {
        /// URL or node that was contacted.
        target: String,
        /// Transport diagnostic.
        msg: String,
    },

    /// Remote peer answered with a failure status.
    #[error("rejected by {target} ({status}): {msg}")]
    Rejected {
        /// URL or node that was contacted.
        target: String,
        /// Status returned by the peer.
        status: ResponseStatus,
        /// Diagnostic returned by the peer.
        msg: String,
    },

    /// Local resource store failure.
    #[error("resource store error: {msg}")]
    Store {
        /// Error message describing the failure.
        msg: String,
    },

    /// Resource content does not have the expected shape.
    #[error("invalid resource: {msg}")]
    InvalidResource {
        /// What was wrong with it.
        msg: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {msg}")]
    Config {
        /// What was wrong with it.
        msg: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The subsystem was shut down.
    #[error("federation subsystem shut down")]
    Shutdown,
}

/// Result alias for federation operations.
pub type Result<T> = std::result::Result<T, FederationError>;

impl FederationError {
    /// Classify a failed remote response.
    pub fn from_response(target: &str, response: &RemoteResponse) -> Self {
        let msg = response.diagnostic.clone().unwrap_or_default();
        match response.status {
            ResponseStatus::NotFound => FederationError::NotFound {
                id: target.to_string(),
            },
            ResponseStatus::AlreadyExists => FederationError::AlreadyExists {
                id: target.to_string(),
            },
            status if status.is_unreachable() => FederationError::Unreachable {
                target: target.to_string(),
                msg,
            },
            status => FederationError::Rejected {
                target: target.to_string(),
                status,
                msg,
            },
        }
    }

    /// Status code a client should observe for this error.
    pub fn status(&self) -> ResponseStatus {
        match self {
            FederationError::NotFound { .. } => ResponseStatus::NotFound,
            FederationError::AlreadyExists { .. } => ResponseStatus::AlreadyExists,
            FederationError::Unreachable { .. } => ResponseStatus::TargetNotReachable,
            FederationError::Rejected { status, .. } => *status,
            FederationError::InvalidResource { .. } => ResponseStatus::ContentsUnacceptable,
            FederationError::Config { .. } => ResponseStatus::BadRequest,
            FederationError::Store { .. }
            | FederationError::Serialization(_)
            | FederationError::Io(_)
            | FederationError::Shutdown => ResponseStatus::InternalServerError,
        }
    }

    /// Whether the error means the peer is presumed down.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, FederationError::Unreachable { .. })
    }

    /// Whether the error means the addressed resource is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FederationError::NotFound { .. })
    }

    /// Convert into a response for the dispatch layer.
    pub fn to_response(&self) -> RemoteResponse {
        RemoteResponse::error(self.status(), self.to_string())
    }
}
