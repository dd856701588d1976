//! Error types for the fortsa controller

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The pod disappeared between event delivery and reconcile
    #[error("pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },

    /// An owner in the pod's controller chain disappeared
    #[error("controller {kind} {namespace}/{name} not found")]
    ControllerNotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    /// The owner chain ends at a kind we cannot rolling-restart
    #[error("unsupported kind {0} for rollout restart")]
    UnsupportedKind(String),

    /// xDS transport failure while fetching proxy sync state
    #[error("xds error: {0}")]
    Xds(String),

    /// A proxy-status response could not be decoded
    #[error("proxy status parse error: {0}")]
    ProxyStatusParse(String),
}

impl Error {
    /// Create an xDS transport error with the given message
    pub fn xds(msg: impl Into<String>) -> Self {
        Self::Xds(msg.into())
    }

    /// Create a proxy-status parse error with the given message
    pub fn proxy_status_parse(msg: impl Into<String>) -> Self {
        Self::ProxyStatusParse(msg.into())
    }

    /// True when the underlying object no longer exists and a retry cannot
    /// succeed until a new event arrives.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            Self::PodNotFound { .. } | Self::ControllerNotFound { .. }
        )
    }
}
