//! DeploymentCoordinator — validates a deploy request, plans it, and fans
//! deploy commands out to the chosen workers.
//!
//! The coordinator answers as soon as the task exists and the artifact is
//! marked DEPLOYING; worker outcomes arrive later as deploy-done reports.
//! It never finishes a task itself. The reconciliation sweep does that once
//! it can see what the workers actually host.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use modelgrid_cluster::{
    ClusterError, DeployCommand, DeployDone, Membership, NodeRequest, NodeResponse, Transport,
    UndeployCommand,
};
use modelgrid_core::{SettingsHandle, epoch_millis};
use modelgrid_placement::EligibilityResolver;
use modelgrid_state::*;

use crate::error::{DeployError, DeployResult};
use crate::registry::TaskRegistry;

/// Immediate answer to an accepted deploy request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployAck {
    pub task_id: TaskId,
    pub state: TaskState,
}

/// How one worker took its deploy command.
#[derive(Debug)]
enum Dispatch {
    Accepted,
    Refused(String),
}

impl Dispatch {
    fn from_response(result: Result<NodeResponse, ClusterError>) -> Self {
        match result {
            Ok(NodeResponse::Accepted) => Dispatch::Accepted,
            Ok(NodeResponse::Rejected { reason, .. }) => Dispatch::Refused(reason),
            Ok(other) => Dispatch::Refused(format!("unexpected response: {other:?}")),
            Err(e) => Dispatch::Refused(e.to_string()),
        }
    }
}

pub struct DeploymentCoordinator {
    registry: Arc<TaskRegistry>,
    membership: Arc<dyn Membership>,
    transport: Arc<dyn Transport>,
    settings: SettingsHandle,
}

impl DeploymentCoordinator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        membership: Arc<dyn Membership>,
        transport: Arc<dyn Transport>,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            registry,
            membership,
            transport,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    // ── Deploy ─────────────────────────────────────────────────────

    /// Start deploying `artifact_id`.
    ///
    /// With `targets` the caller names the worker nodes (only when custom
    /// placement is allowed); without, every eligible node is used. An
    /// empty list counts as no list.
    pub async fn deploy(&self, artifact_id: &str, targets: Option<Vec<NodeId>>) -> DeployResult<DeployAck> {
        let explicit = targets.filter(|list| !list.is_empty());
        let settings = self.settings.current();
        let policy = &settings.eligibility;

        let artifact = self.registry.artifact(artifact_id)?;
        if explicit.is_some() && !policy.allow_custom_placement {
            return Err(DeployError::PolicyViolation);
        }

        let nodes = self.membership.list_nodes();
        let resolver = EligibilityResolver::new(policy);
        let workers = match &explicit {
            Some(requested) => {
                let stray: Vec<NodeId> = artifact
                    .current_workers
                    .iter()
                    .filter(|node| !requested.contains(node))
                    .cloned()
                    .collect();
                if !stray.is_empty() {
                    return Err(DeployError::Conflict {
                        artifact_id: artifact_id.to_string(),
                        nodes: stray,
                    });
                }
                resolver.filter_eligible(&nodes, &artifact.category, requested)
            }
            None => resolver.resolve(&nodes, &artifact.category),
        };
        if workers.is_empty() {
            warn!(%artifact_id, category = %artifact.category, "no eligible node for deploy");
            return Err(DeployError::NoEligibleNode(artifact_id.to_string()));
        }

        let coordinator = self.membership.local_node_id();
        let task = self.registry.create_task(&NewTask {
            artifact_id: artifact_id.to_string(),
            is_async: true,
            targets: workers.clone(),
            coordinator: coordinator.clone(),
        })?;

        let mut plan = ArtifactPatch::state(ArtifactState::Deploying)
            .with_planned_workers(workers.iter().cloned().collect());
        plan.deploy_to_all_nodes = Some(explicit.is_none());
        plan.deploy_started_at = Some(epoch_millis());
        if let Err(e) = self.registry.update_artifact(artifact_id, &plan).await {
            return Err(self.abandon(&task, e).await);
        }

        info!(
            %artifact_id,
            task_id = %task.id,
            workers = ?workers,
            deploy_to_all_nodes = explicit.is_none(),
            "deploy started"
        );

        let cmd = DeployCommand {
            artifact_id: artifact_id.to_string(),
            task_id: task.id.clone(),
            fingerprint: artifact.fingerprint.clone(),
            coordinator,
            planned_count: workers.len() as u32,
        };
        tokio::spawn(fan_out(
            self.registry.clone(),
            self.transport.clone(),
            cmd,
            workers,
        ));

        Ok(DeployAck {
            task_id: task.id,
            state: task.state,
        })
    }

    /// Roll back after the artifact could not be marked DEPLOYING.
    async fn abandon(&self, task: &DeploymentTask, cause: DeployError) -> DeployError {
        warn!(task_id = %task.id, artifact_id = %task.artifact_id, error = %cause, "deploy abandoned");
        if let Err(e) = self
            .registry
            .finalize_task(&task.id, TaskState::Failed, Some(cause.to_string()))
            .await
        {
            warn!(task_id = %task.id, error = %e, "failed to mark abandoned task");
        }
        // The artifact permit is what just timed out; write without it.
        if let Err(e) = self.registry.mark_artifact_failed(&task.artifact_id) {
            warn!(artifact_id = %task.artifact_id, error = %e, "failed to mark artifact deploy failed");
        }
        match cause {
            DeployError::TransientStore(_) => cause,
            other => DeployError::TransientStore(other.to_string()),
        }
    }

    /// Fold a worker's deploy-done report into the task and artifact.
    pub async fn handle_deploy_done(&self, done: DeployDone) -> DeployResult<()> {
        self.registry
            .record_node_outcome(&done.task_id, &done.node_id, done.error.as_deref())
            .await?;
        if !done.is_success() {
            return Ok(());
        }

        let node_id = done.node_id.clone();
        let updated = self
            .registry
            .mutate_artifact(&done.artifact_id, |artifact| {
                if !artifact.planned_workers.contains(&node_id)
                    || artifact.current_workers.contains(&node_id)
                {
                    return None;
                }
                let mut current = artifact.current_workers.clone();
                current.insert(node_id.clone());
                Some(ArtifactPatch::default().with_current_workers(current))
            })
            .await?;
        match updated {
            Some(artifact) => debug!(
                artifact_id = %artifact.id,
                node_id = %done.node_id,
                current = artifact.current_count,
                planned = artifact.planning_count,
                "worker confirmed"
            ),
            None => debug!(artifact_id = %done.artifact_id, node_id = %done.node_id, "worker report left artifact unchanged"),
        }
        Ok(())
    }

    /// Durable record of a deploy task.
    pub fn task_status(&self, task_id: &str) -> DeployResult<DeploymentTask> {
        self.registry.task(task_id)
    }

    // ── Undeploy ───────────────────────────────────────────────────

    /// Drop `artifact_id` from `nodes`, or from every planned and current
    /// worker when no list is given.
    pub async fn undeploy(&self, artifact_id: &str, nodes: Option<Vec<NodeId>>) -> DeployResult<Artifact> {
        let artifact = self.registry.artifact(artifact_id)?;
        let targets: BTreeSet<NodeId> = match nodes.filter(|list| !list.is_empty()) {
            Some(list) => list.into_iter().collect(),
            None => artifact
                .planned_workers
                .union(&artifact.current_workers)
                .cloned()
                .collect(),
        };

        let mut sends = JoinSet::new();
        for node_id in &targets {
            let transport = self.transport.clone();
            let node_id = node_id.clone();
            let request = NodeRequest::Undeploy(UndeployCommand {
                artifact_id: artifact_id.to_string(),
            });
            sends.spawn(async move {
                let result = transport.send(&node_id, request).await;
                (node_id, Dispatch::from_response(result))
            });
        }
        while let Some(joined) = sends.join_next().await {
            if let Ok((node_id, Dispatch::Refused(reason))) = joined {
                warn!(%artifact_id, %node_id, %reason, "undeploy not confirmed by node");
            }
        }

        let updated = self
            .registry
            .mutate_artifact(artifact_id, |artifact| {
                let current: BTreeSet<NodeId> =
                    artifact.current_workers.difference(&targets).cloned().collect();
                let mut planned: BTreeSet<NodeId> =
                    artifact.planned_workers.difference(&targets).cloned().collect();
                let state = if current.is_empty() {
                    planned.clear();
                    ArtifactState::NotDeployed
                } else {
                    ArtifactState::PartiallyDeployed
                };
                Some(
                    ArtifactPatch::state(state)
                        .with_current_workers(current)
                        .with_planned_workers(planned),
                )
            })
            .await?;
        let artifact = match updated {
            Some(artifact) => artifact,
            None => self.registry.artifact(artifact_id)?,
        };
        info!(%artifact_id, nodes = ?targets, state = ?artifact.state, "artifact undeployed");
        Ok(artifact)
    }
}

/// Send the deploy command to every worker and record refusals.
async fn fan_out(
    registry: Arc<TaskRegistry>,
    transport: Arc<dyn Transport>,
    cmd: DeployCommand,
    workers: Vec<NodeId>,
) {
    let mut sends = JoinSet::new();
    for node_id in workers {
        let transport = transport.clone();
        let request = NodeRequest::Deploy(cmd.clone());
        sends.spawn(async move {
            let result = transport.send(&node_id, request).await;
            (node_id, Dispatch::from_response(result))
        });
    }

    while let Some(joined) = sends.join_next().await {
        let (node_id, dispatch) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task_id = %cmd.task_id, error = %e, "deploy dispatch aborted");
                continue;
            }
        };
        match dispatch {
            Dispatch::Accepted => {
                debug!(task_id = %cmd.task_id, %node_id, "deploy command accepted");
            }
            Dispatch::Refused(reason) => {
                warn!(task_id = %cmd.task_id, %node_id, %reason, "deploy command refused");
                if let Err(e) = registry
                    .record_node_outcome(&cmd.task_id, &node_id, Some(&reason))
                    .await
                {
                    warn!(task_id = %cmd.task_id, %node_id, error = %e, "failed to record refusal");
                }
            }
        }
    }
}
