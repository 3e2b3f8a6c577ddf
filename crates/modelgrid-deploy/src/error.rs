//! Deployment error types.

use serde::Serialize;
use thiserror::Error;

use modelgrid_cluster::ClusterError;
use modelgrid_state::{NodeId, StateError};

/// How a caller should treat a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad input or a policy refusal. Retrying the same call fails again.
    Validation,
    /// Nothing can take the work right now. Retry after backoff.
    Capacity,
    /// Infrastructure failure. The request was abandoned; re-invoke it.
    Transient,
}

/// Errors surfaced by deploy operations.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("custom deployment plan is not allowed; omit the target node list")]
    PolicyViolation,

    #[error("artifact {artifact_id} is running on {nodes:?}, which are not in the target list; undeploy them first")]
    Conflict {
        artifact_id: String,
        nodes: Vec<NodeId>,
    },

    #[error("no eligible node found for artifact {0}")]
    NoEligibleNode(String),

    #[error("deploy pool on {node_id} is full ({pending} pending)")]
    Capacity { node_id: NodeId, pending: usize },

    #[error("transient store error: {0}")]
    TransientStore(String),

    #[error("failed to create deploy task: {0}")]
    Terminal(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("transport error: {0}")]
    Transport(#[from] ClusterError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

impl DeployError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DeployError::NotFound(_)
            | DeployError::TaskNotFound(_)
            | DeployError::PolicyViolation
            | DeployError::Conflict { .. } => ErrorCategory::Validation,
            DeployError::NoEligibleNode(_) | DeployError::Capacity { .. } => ErrorCategory::Capacity,
            DeployError::TransientStore(_)
            | DeployError::Terminal(_)
            | DeployError::State(_)
            | DeployError::Transport(_)
            | DeployError::Engine(_) => ErrorCategory::Transient,
        }
    }

    /// Whether the same call may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeployError::Terminal(_) => false,
            other => other.category() != ErrorCategory::Validation,
        }
    }
}

pub type DeployResult<T> = Result<T, DeployError>;

/// Failures of the local inference engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("artifact payload missing: {0}")]
    Missing(String),

    #[error("fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("engine I/O error: {0}")]
    Io(String),

    #[error("materialize timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("engine failure: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(DeployError::NotFound("m".into()).category(), ErrorCategory::Validation);
        assert_eq!(DeployError::PolicyViolation.category(), ErrorCategory::Validation);
        assert_eq!(
            DeployError::Conflict {
                artifact_id: "m".into(),
                nodes: vec!["a".into()]
            }
            .category(),
            ErrorCategory::Validation
        );
        assert_eq!(DeployError::NoEligibleNode("m".into()).category(), ErrorCategory::Capacity);
        assert_eq!(
            DeployError::Capacity {
                node_id: "a".into(),
                pending: 3
            }
            .category(),
            ErrorCategory::Capacity
        );
        assert_eq!(DeployError::TransientStore("x".into()).category(), ErrorCategory::Transient);
    }

    #[test]
    fn retryability() {
        assert!(!DeployError::PolicyViolation.is_retryable());
        assert!(!DeployError::Terminal("disk full".into()).is_retryable());
        assert!(DeployError::NoEligibleNode("m".into()).is_retryable());
        assert!(DeployError::TransientStore("busy".into()).is_retryable());
        assert!(DeployError::from(StateError::NotFound("m1".into())).is_retryable());
    }

    #[test]
    fn conflict_message_names_nodes() {
        let err = DeployError::Conflict {
            artifact_id: "m1".into(),
            nodes: vec!["a".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("m1"));
        assert!(msg.contains("\"a\""));
        assert!(msg.contains("undeploy"));
    }
}
