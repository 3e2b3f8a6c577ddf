//! Cluster error types.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while talking to other nodes.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("node unreachable: {0}")]
    Unreachable(String),

    #[error("request to {node_id} timed out after {after:?}")]
    Timeout { node_id: String, after: Duration },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("no cluster leader elected")]
    NoLeader,
}

pub type ClusterResult<T> = Result<T, ClusterError>;
