//! Node-to-node request/response messages.
//!
//! Every message is plain serde data so any transport can carry it as JSON.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use modelgrid_state::{ArtifactId, NodeId, TaskId};

/// Instructs a worker to materialize an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployCommand {
    pub artifact_id: ArtifactId,
    pub task_id: TaskId,
    pub fingerprint: String,
    /// Node that owns the task and collects deploy-done reports.
    pub coordinator: NodeId,
    pub planned_count: u32,
}

/// A worker's single report on how its deploy command ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployDone {
    pub task_id: TaskId,
    pub artifact_id: ArtifactId,
    pub node_id: NodeId,
    /// `None` on success.
    pub error: Option<String>,
}

impl DeployDone {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Instructs a worker to drop an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndeployCommand {
    pub artifact_id: ArtifactId,
}

/// What a node is actually running, returned to the reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStateReport {
    pub node_id: NodeId,
    /// Artifacts fully loaded on this node.
    pub hosted: Vec<ArtifactId>,
    /// Artifacts this node is still loading.
    pub loading: Vec<ArtifactId>,
    /// Deploy tasks this node is still executing.
    pub running_tasks: Vec<TaskId>,
}

/// Cluster-wide view pushed back to every node after a sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    /// Artifact → nodes hosting it.
    pub hosting: BTreeMap<ArtifactId, BTreeSet<NodeId>>,
    /// Task → nodes still executing it.
    pub tasks: BTreeMap<TaskId, BTreeSet<NodeId>>,
    /// Nothing is hosted anywhere; drop all routing state.
    pub clear_all: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeRequest {
    Deploy(DeployCommand),
    DeployDone(DeployDone),
    Undeploy(UndeployCommand),
    ReportState,
    Correct(Correction),
}

impl NodeRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeRequest::Deploy(_) => "deploy",
            NodeRequest::DeployDone(_) => "deploy_done",
            NodeRequest::Undeploy(_) => "undeploy",
            NodeRequest::ReportState => "report_state",
            NodeRequest::Correct(_) => "correct",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeResponse {
    /// The request was taken; any work continues in the background.
    Accepted,
    /// The request was refused.
    Rejected { reason: String, retryable: bool },
    State(NodeStateReport),
}
