//! WorkerDeploymentExecutor — the per-node side of a deploy.
//!
//! Accepts deploy commands into a bounded pool, materializes the artifact
//! through the local [`InferenceEngine`], and sends exactly one deploy-done
//! report back to the coordinating node per command.
//!
//! Admission is fail-fast: a node holds at most `max_concurrent_deploys`
//! running plus `max_queued_deploys` waiting commands, and refuses the rest
//! with a capacity error the coordinator folds into the task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use modelgrid_cluster::{
    Correction, DeployCommand, DeployDone, NodeRequest, NodeResponse, NodeStateReport, Transport,
};
use modelgrid_core::DeploySettings;
use modelgrid_state::{ArtifactId, NodeId, TaskId};

use crate::engine::{EngineResult, InferenceEngine};
use crate::error::{DeployError, DeployResult, EngineError};
use crate::registry::TaskRegistry;

/// What this node runs, as far as it knows.
#[derive(Debug, Default)]
struct LocalModels {
    hosted: BTreeSet<ArtifactId>,
    /// Artifact → deploy tasks currently loading it here.
    loading: BTreeMap<ArtifactId, BTreeSet<TaskId>>,
    /// Cluster-wide artifact → hosting nodes, from the last correction.
    routing: BTreeMap<ArtifactId, BTreeSet<NodeId>>,
}

/// Runs deploy commands addressed to one node.
///
/// Cheap to clone; clones share the pool and local state.
#[derive(Clone)]
pub struct WorkerDeploymentExecutor {
    node_id: NodeId,
    engine: Arc<dyn InferenceEngine>,
    registry: Arc<TaskRegistry>,
    transport: Arc<dyn Transport>,
    slots: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    materialize_timeout: Option<Duration>,
    local: Arc<RwLock<LocalModels>>,
}

impl WorkerDeploymentExecutor {
    /// Pool limits are read once here; changing them needs a restart.
    pub fn new(
        node_id: &str,
        engine: Arc<dyn InferenceEngine>,
        registry: Arc<TaskRegistry>,
        transport: Arc<dyn Transport>,
        limits: &DeploySettings,
    ) -> Self {
        let concurrent = limits.max_concurrent_deploys.max(1);
        Self {
            node_id: node_id.to_string(),
            engine,
            registry,
            transport,
            slots: Arc::new(Semaphore::new(concurrent)),
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending: concurrent + limits.max_queued_deploys,
            materialize_timeout: (!limits.materialize_timeout.is_zero())
                .then_some(limits.materialize_timeout),
            local: Arc::new(RwLock::new(LocalModels::default())),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    // ── Deploy ─────────────────────────────────────────────────────

    /// Admit a deploy command and run it in the background.
    ///
    /// Returns once the command is queued. The outcome travels back to the
    /// coordinator as a [`DeployDone`] report.
    pub fn submit(&self, cmd: DeployCommand) -> DeployResult<()> {
        let pending = self.pending.fetch_add(1, Ordering::SeqCst);
        if pending >= self.max_pending {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(node_id = %self.node_id, task_id = %cmd.task_id, pending, "deploy pool full, command refused");
            return Err(DeployError::Capacity {
                node_id: self.node_id.clone(),
                pending,
            });
        }

        self.write_local()
            .loading
            .entry(cmd.artifact_id.clone())
            .or_default()
            .insert(cmd.task_id.clone());

        debug!(node_id = %self.node_id, task_id = %cmd.task_id, artifact_id = %cmd.artifact_id, "deploy command queued");
        let this = self.clone();
        tokio::spawn(async move { this.run(cmd).await });
        Ok(())
    }

    async fn run(self, cmd: DeployCommand) {
        let slot = self.slots.clone().acquire_owned().await.ok();
        let result = self.materialize(&cmd).await;
        drop(slot);
        self.pending.fetch_sub(1, Ordering::SeqCst);

        {
            let mut local = self.write_local();
            if let Some(tasks) = local.loading.get_mut(&cmd.artifact_id) {
                tasks.remove(&cmd.task_id);
                if tasks.is_empty() {
                    local.loading.remove(&cmd.artifact_id);
                }
            }
            if result.is_ok() {
                local.hosted.insert(cmd.artifact_id.clone());
            }
        }

        match &result {
            Ok(()) => info!(node_id = %self.node_id, task_id = %cmd.task_id, artifact_id = %cmd.artifact_id, "artifact deployed"),
            Err(e) => warn!(node_id = %self.node_id, task_id = %cmd.task_id, artifact_id = %cmd.artifact_id, error = %e, "artifact deploy failed"),
        }

        let done = DeployDone {
            task_id: cmd.task_id.clone(),
            artifact_id: cmd.artifact_id.clone(),
            node_id: self.node_id.clone(),
            error: result.err().map(|e| e.to_string()),
        };
        self.report_done(&cmd.coordinator, done).await;
    }

    /// Send the single deploy-done report. A lost or rejected report is left
    /// to the reconciliation sweep.
    async fn report_done(&self, coordinator: &str, done: DeployDone) {
        let task_id = done.task_id.clone();
        match self
            .transport
            .send(coordinator, NodeRequest::DeployDone(done))
            .await
        {
            Ok(NodeResponse::Rejected { reason, retryable }) => {
                warn!(node_id = %self.node_id, %task_id, %coordinator, %reason, retryable, "deploy-done report rejected");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(node_id = %self.node_id, %task_id, %coordinator, error = %e, "deploy-done report not delivered");
            }
        }
    }

    async fn materialize(&self, cmd: &DeployCommand) -> EngineResult<()> {
        let load = self.engine.materialize(&cmd.artifact_id, &cmd.fingerprint);
        match self.materialize_timeout {
            Some(limit) => tokio::time::timeout(limit, load)
                .await
                .map_err(|_| EngineError::TimedOut(limit))?,
            None => load.await,
        }
    }

    // ── Undeploy ───────────────────────────────────────────────────

    /// Drop an artifact from this node.
    pub async fn undeploy(&self, artifact_id: &str) -> DeployResult<()> {
        self.engine.unload(artifact_id).await?;
        let mut local = self.write_local();
        local.hosted.remove(artifact_id);
        if let Some(nodes) = local.routing.get_mut(artifact_id) {
            nodes.remove(&self.node_id);
        }
        info!(node_id = %self.node_id, %artifact_id, "artifact undeployed");
        Ok(())
    }

    // ── Sync-up ────────────────────────────────────────────────────

    /// Snapshot of what this node runs, for the reconciliation sweep.
    pub fn report(&self) -> NodeStateReport {
        let local = self.read_local();
        NodeStateReport {
            node_id: self.node_id.clone(),
            hosted: local.hosted.iter().cloned().collect(),
            loading: local.loading.keys().cloned().collect(),
            running_tasks: local
                .loading
                .values()
                .flatten()
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        }
    }

    /// Apply the cluster-wide view pushed by the sweep.
    ///
    /// Replaces the routing table and drops settled tasks from the registry
    /// cache. A task still listed by the sweep or loading here is kept.
    pub fn apply_correction(&self, correction: &Correction) {
        let mut active: BTreeSet<TaskId> = {
            let mut local = self.write_local();
            if correction.clear_all {
                local.routing.clear();
            } else {
                local.routing = correction.hosting.clone();
            }
            local.loading.values().flatten().cloned().collect()
        };

        active.extend(correction.tasks.keys().cloned());
        let dropped = self.registry.prune_cache(&active);
        if !dropped.is_empty() {
            debug!(node_id = %self.node_id, dropped = ?dropped, "stale cached tasks dropped");
        }
    }

    /// Nodes hosting `artifact_id` per the last correction.
    pub fn routing(&self, artifact_id: &str) -> Vec<NodeId> {
        self.read_local()
            .routing
            .get(artifact_id)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_hosting(&self, artifact_id: &str) -> bool {
        self.read_local().hosted.contains(artifact_id)
    }

    /// Commands admitted and not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn read_local(&self) -> std::sync::RwLockReadGuard<'_, LocalModels> {
        self.local.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_local(&self) -> std::sync::RwLockWriteGuard<'_, LocalModels> {
        self.local.write().unwrap_or_else(PoisonError::into_inner)
    }
}
