//! Domain types for the ModelGrid record store.
//!
//! Artifacts and deployment tasks are persisted as JSON. Node records come
//! from cluster membership and are never written here, but live in this
//! crate so every layer shares one definition.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Opaque identifier of a deployable artifact (model).
pub type ArtifactId = String;

/// Identifier of a deployment task, allocated by the store.
pub type TaskId = String;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

// ── Artifact ──────────────────────────────────────────────────────

/// Lifecycle state of an artifact across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactState {
    NotDeployed,
    Deploying,
    PartiallyDeployed,
    Deployed,
    DeployFailed,
}

impl ArtifactState {
    /// States the reconciliation sweep re-examines.
    pub const RECONCILED: [ArtifactState; 4] = [
        ArtifactState::Deploying,
        ArtifactState::PartiallyDeployed,
        ArtifactState::Deployed,
        ArtifactState::DeployFailed,
    ];
}

/// The authoritative placement record for one artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: ArtifactId,
    /// Category tag that selects the eligibility rules.
    pub category: String,
    /// Hex SHA-256 of the payload workers must load.
    pub fingerprint: String,
    /// Nodes chosen at deploy time.
    pub planned_workers: BTreeSet<NodeId>,
    /// Nodes confirmed to host the artifact.
    pub current_workers: BTreeSet<NodeId>,
    pub planning_count: u32,
    pub current_count: u32,
    pub state: ArtifactState,
    /// Set when the deploy targeted every eligible node.
    pub deploy_to_all_nodes: bool,
    /// Unix millis when the latest deploy started.
    pub deploy_started_at: Option<u64>,
    /// Unix millis.
    pub created_at: u64,
    /// Unix millis.
    pub updated_at: u64,
    /// Bumped by the store on every write.
    pub version: u64,
}

impl Artifact {
    /// A freshly registered, undeployed artifact.
    pub fn new(id: &str, category: &str, fingerprint: &str, now: u64) -> Self {
        Self {
            id: id.to_string(),
            category: category.to_string(),
            fingerprint: fingerprint.to_string(),
            planned_workers: BTreeSet::new(),
            current_workers: BTreeSet::new(),
            planning_count: 0,
            current_count: 0,
            state: ArtifactState::NotDeployed,
            deploy_to_all_nodes: false,
            deploy_started_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

/// Partial update of an artifact record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactPatch {
    pub state: Option<ArtifactState>,
    pub planned_workers: Option<BTreeSet<NodeId>>,
    pub current_workers: Option<BTreeSet<NodeId>>,
    pub planning_count: Option<u32>,
    pub current_count: Option<u32>,
    pub deploy_to_all_nodes: Option<bool>,
    pub deploy_started_at: Option<u64>,
    /// Reject the write unless the stored version still equals this.
    pub if_version: Option<u64>,
}

impl ArtifactPatch {
    pub fn state(state: ArtifactState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Set the current worker set and keep its count in step.
    pub fn with_current_workers(mut self, workers: BTreeSet<NodeId>) -> Self {
        self.current_count = Some(workers.len() as u32);
        self.current_workers = Some(workers);
        self
    }

    /// Set the planned worker set and keep its count in step.
    pub fn with_planned_workers(mut self, workers: BTreeSet<NodeId>) -> Self {
        self.planning_count = Some(workers.len() as u32);
        self.planned_workers = Some(workers);
        self
    }

    pub fn if_version(mut self, version: u64) -> Self {
        self.if_version = Some(version);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.planned_workers.is_none()
            && self.current_workers.is_none()
            && self.planning_count.is_none()
            && self.current_count.is_none()
            && self.deploy_to_all_nodes.is_none()
            && self.deploy_started_at.is_none()
    }

    pub(crate) fn apply(&self, artifact: &mut Artifact, now: u64) {
        if let Some(state) = self.state {
            artifact.state = state;
        }
        if let Some(ref planned) = self.planned_workers {
            artifact.planned_workers = planned.clone();
        }
        if let Some(ref current) = self.current_workers {
            artifact.current_workers = current.clone();
        }
        if let Some(count) = self.planning_count {
            artifact.planning_count = count;
        }
        if let Some(count) = self.current_count {
            artifact.current_count = count;
        }
        if let Some(all) = self.deploy_to_all_nodes {
            artifact.deploy_to_all_nodes = all;
        }
        if let Some(started) = self.deploy_started_at {
            artifact.deploy_started_at = Some(started);
        }
        artifact.updated_at = now;
        artifact.version += 1;
    }
}

// ── Deployment task ───────────────────────────────────────────────

/// Lifecycle state of a deployment task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    /// States of tasks that have not reached an outcome.
    pub const IN_FLIGHT: [TaskState; 2] = [TaskState::Created, TaskState::Running];

    pub fn is_done(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Audit record of one deploy request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentTask {
    pub id: TaskId,
    pub artifact_id: ArtifactId,
    pub is_async: bool,
    /// Target nodes in dispatch order.
    pub targets: Vec<NodeId>,
    /// Node that accepted the deploy call.
    pub coordinator: NodeId,
    pub state: TaskState,
    pub error: Option<String>,
    /// Failure reported per target node.
    #[serde(default)]
    pub node_errors: BTreeMap<NodeId, String>,
    /// Unix millis.
    pub created_at: u64,
    /// Unix millis.
    pub updated_at: u64,
    pub version: u64,
}

/// Fields of a task chosen by the caller; the store assigns the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub artifact_id: ArtifactId,
    pub is_async: bool,
    pub targets: Vec<NodeId>,
    pub coordinator: NodeId,
}

/// Partial update of a task record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub state: Option<TaskState>,
    pub error: Option<String>,
    /// Merged into `node_errors`.
    pub node_errors: BTreeMap<NodeId, String>,
    pub if_version: Option<u64>,
}

impl TaskPatch {
    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_node_error(mut self, node_id: &str, error: impl Into<String>) -> Self {
        self.node_errors.insert(node_id.to_string(), error.into());
        self
    }

    pub fn if_version(mut self, version: u64) -> Self {
        self.if_version = Some(version);
        self
    }

    pub(crate) fn apply(&self, task: &mut DeploymentTask, now: u64) {
        if let Some(state) = self.state {
            task.state = state;
        }
        if let Some(ref error) = self.error {
            task.error = Some(error.clone());
        }
        for (node, error) in &self.node_errors {
            task.node_errors.insert(node.clone(), error.clone());
        }
        task.updated_at = now;
        task.version += 1;
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// A cluster member as seen by placement. Read-only to ModelGrid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    /// Human-readable name; exclusion lists match on it.
    pub name: String,
    pub roles: BTreeSet<String>,
    /// Free-form attributes such as a cost tier.
    pub attributes: BTreeMap<String, String>,
}

impl NodeRecord {
    pub fn new(id: &str, name: &str, roles: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_state_serializes_upper_snake() {
        let json = serde_json::to_string(&ArtifactState::PartiallyDeployed).unwrap();
        assert_eq!(json, "\"PARTIALLY_DEPLOYED\"");
        let json = serde_json::to_string(&TaskState::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }

    #[test]
    fn patch_keeps_counts_in_step() {
        let workers: BTreeSet<NodeId> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let patch = ArtifactPatch::state(ArtifactState::Deploying)
            .with_planned_workers(workers.clone())
            .with_current_workers(BTreeSet::new());

        let mut artifact = Artifact::new("m1", "local", "ff", 1);
        patch.apply(&mut artifact, 5);

        assert_eq!(artifact.planned_workers, workers);
        assert_eq!(artifact.planning_count, 2);
        assert_eq!(artifact.current_count, 0);
        assert_eq!(artifact.updated_at, 5);
        assert_eq!(artifact.version, 1);
    }

    #[test]
    fn empty_patch_detection() {
        assert!(ArtifactPatch::default().if_version(3).is_empty());
        assert!(!ArtifactPatch::state(ArtifactState::Deployed).is_empty());
    }

    #[test]
    fn task_patch_merges_node_errors() {
        let mut task = DeploymentTask {
            id: "task-1".into(),
            artifact_id: "m1".into(),
            is_async: true,
            targets: vec!["a".into(), "b".into()],
            coordinator: "a".into(),
            state: TaskState::Created,
            error: None,
            node_errors: BTreeMap::new(),
            created_at: 1,
            updated_at: 1,
            version: 0,
        };
        TaskPatch::default().with_node_error("a", "boom").apply(&mut task, 2);
        TaskPatch::state(TaskState::Running)
            .with_node_error("b", "bang")
            .apply(&mut task, 3);

        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.node_errors.len(), 2);
        assert_eq!(task.version, 2);
        assert!(!task.state.is_done());
    }

    #[test]
    fn node_record_roles_and_attributes() {
        let node = NodeRecord::new("n1", "node-1", &["data"]).with_attribute("box_type", "warm");
        assert!(node.has_role("data"));
        assert!(!node.has_role("ml"));
        assert_eq!(node.attributes.get("box_type").map(String::as_str), Some("warm"));
    }
}
