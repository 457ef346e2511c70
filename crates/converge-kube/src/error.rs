//! Error types for converge-kube

use thiserror::Error;

use converge_core::{CoreError, GroupVersionKind};
use converge_diff::DiffError;

/// Result type for converge-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors raised by the cluster collaborators and the planning helpers
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Object does not exist
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: String, name: String },

    /// Concurrent modification
    #[error("operation cannot be fulfilled on {kind} \"{name}\": the object has been modified")]
    Conflict { kind: String, name: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Discovery does not know the type
    #[error("the server could not find the requested resource {gvk}")]
    ResourceTypeNotFound { gvk: GroupVersionKind },

    /// The type exists but does not support the verb
    #[error("{verb} is not supported for resource {gvk}")]
    MethodNotSupported { gvk: GroupVersionKind, verb: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Rejected by the API server, e.g. a failed validation
    #[error("{0}")]
    Rejected(String),

    /// Timeout
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Diff error
    #[error("diff error: {0}")]
    Diff(#[from] DiffError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl KubeError {
    /// Whether the object or its type is missing (404)
    pub fn is_not_found(&self) -> bool {
        match self {
            KubeError::NotFound { .. } | KubeError::ResourceTypeNotFound { .. } => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if this is a conflict error (409)
    pub fn is_conflict(&self) -> bool {
        match self {
            KubeError::Conflict { .. } => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Check if this is an authentication error (401)
    pub fn is_unauthorized(&self) -> bool {
        match self {
            KubeError::Unauthorized(_) => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 401,
            _ => false,
        }
    }

    /// Check if the verb is not allowed on the type (405)
    pub fn is_method_not_supported(&self) -> bool {
        match self {
            KubeError::MethodNotSupported { .. } => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 405,
            _ => false,
        }
    }

    pub(crate) fn not_found(kind: &str, name: &str) -> Self {
        KubeError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}
