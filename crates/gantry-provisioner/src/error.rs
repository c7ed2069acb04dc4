//! Error types for gantry-provisioner.

use std::time::Duration;

use gantry_template::TemplateError;

use crate::cluster::ClusterError;
use crate::types::DiagnosticLogs;

/// Result type alias using [`ProvisionError`].
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Errors that can occur while provisioning an agent.
///
/// Every failure after capacity reservation goes through the same cleanup
/// path (slot release plus node removal); only the classification and the
/// captured diagnostics differ.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The capacity tracker rejected the reservation. Soft failure with no
    /// side effects; the caller may retry later.
    #[error("capacity rejected for template {template} on backend {backend}")]
    CapacityRejected {
        /// Backend the reservation targeted.
        backend: String,
        /// Template the reservation targeted.
        template: String,
    },

    /// The template failed validation before any network call.
    #[error("invalid template: {0}")]
    InvalidTemplate(#[from] TemplateError),

    /// The cluster refused the pod document.
    #[error("failed to submit pod {pod} for template {template} on backend {backend}: {source}")]
    SubmissionFailed {
        /// Backend identity.
        backend: String,
        /// Template identity.
        template: String,
        /// Attempted pod name.
        pod: String,
        /// Underlying cluster error.
        #[source]
        source: ClusterError,
    },

    /// One or more containers exited before becoming ready.
    #[error("containers terminated in pod {pod}: [{containers}]\n{logs}", containers = .containers.join(", "))]
    ContainersTerminated {
        /// Attempted pod name.
        pod: String,
        /// Names of terminated containers.
        containers: Vec<String>,
        /// Captured log tails.
        logs: DiagnosticLogs,
    },

    /// The pod never reached all-containers-running within budget.
    #[error("pod {pod} not ready after {waited:?}")]
    SchedulingTimedOut {
        /// Attempted pod name.
        pod: String,
        /// Total time waited.
        waited: Duration,
    },

    /// The pod became ready but the agent process never connected.
    #[error("agent never connected for pod {pod} after {waited:?}\n{logs}")]
    AgentConnectTimedOut {
        /// Attempted pod name.
        pod: String,
        /// Total time waited.
        waited: Duration,
        /// Captured log tails.
        logs: DiagnosticLogs,
    },

    /// The pod disappeared while being waited on. Distinct from a timeout.
    #[error("pod {pod} no longer exists")]
    PodGone {
        /// Attempted pod name.
        pod: String,
    },

    /// The provisioning attempt was cancelled cooperatively.
    #[error("provisioning of pod {pod} cancelled")]
    Cancelled {
        /// Attempted pod name.
        pod: String,
    },

    /// Cluster transport or API error outside submission.
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Node lifecycle collaborator error.
    #[error("node lifecycle error: {0}")]
    Node(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProvisionError {
    /// Create a node lifecycle error.
    #[must_use]
    pub fn node(msg: impl Into<String>) -> Self {
        Self::Node(msg.into())
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for the soft rejection that leaves no side effects behind.
    #[must_use]
    pub const fn is_capacity_rejection(&self) -> bool {
        matches!(self, Self::CapacityRejected { .. })
    }
}
