//! Error types for the PVC clone controller

use thiserror::Error;

use crate::annotations::{ObjectKey, PodRole};
use crate::token::TokenError;

/// Result type alias using the controller's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Controller error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The clone request does not name a `namespace/name` source
    #[error("Bad CloneRequest annotation: {0:?}")]
    MalformedCloneRequest(String),

    /// Source claim is not present in the cache
    #[error("Source PVC not found: {0}")]
    SourceClaimNotFound(ObjectKey),

    /// More than one pod carries a role's unique-id label
    #[error("multiple {role} pods found for clone PVC {claim}")]
    MultiplePods { role: PodRole, claim: ObjectKey },

    /// A pod carries a role's unique-id label but is not controlled by the claim
    #[error("found pod {pod} not owned by pvc {claim}")]
    NotOwned { pod: ObjectKey, claim: ObjectKey },

    /// Clone token rejected
    #[error("clone token rejected: {0}")]
    Unauthorized(#[from] TokenError),

    /// Source and target specs cannot be cloned into each other
    #[error("{0}")]
    Incompatible(String),

    /// Object lacks metadata needed to derive keys or owner references
    #[error("Missing field: {0}")]
    MissingField(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a compatibility rejection
    pub fn incompatible(msg: impl Into<String>) -> Self {
        Error::Incompatible(msg.into())
    }

    /// Broken at-most-one or ownership invariant; will not self-resolve
    pub fn is_consistency_violation(&self) -> bool {
        matches!(self, Error::MultiplePods { .. } | Error::NotOwned { .. })
    }

    /// Authorization or compatibility rejection, surfaced as a warning event
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Unauthorized(_) | Error::Incompatible(_))
    }

    /// Short label used for metrics
    pub fn class(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::MalformedCloneRequest(_) => "malformed_request",
            Error::SourceClaimNotFound(_) => "source_not_found",
            Error::MultiplePods { .. } | Error::NotOwned { .. } => "consistency",
            Error::Unauthorized(_) => "unauthorized",
            Error::Incompatible(_) => "incompatible",
            Error::MissingField(_) => "missing_field",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
        }
    }
}
