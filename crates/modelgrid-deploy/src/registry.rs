//! TaskRegistry — serialized mutation of task and artifact records.
//!
//! Every write to a task or artifact record goes through a per-record
//! permit (one outstanding mutation per key) acquired with a bounded wait.
//! A mutation that cannot get its permit in time fails with a transient
//! error and is logged; nothing is dropped silently.
//!
//! The registry also keeps an in-memory cache of the deploy tasks this node
//! coordinates: which targets have already reported. A repeated deploy-done
//! report from the same node is folded in only once. The durable record in
//! the [`StateStore`] stays authoritative; a task missing from the cache
//! (after a restart, or once it has settled) is handled from the
//! store alone.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use modelgrid_state::*;

use crate::error::{DeployError, DeployResult};

type PermitTable = Arc<Mutex<HashMap<String, Arc<Semaphore>>>>;

/// Exclusive right to mutate one record.
///
/// The key's table entry is removed when the last holder or waiter is gone.
pub struct RecordPermit {
    key: String,
    permit: Option<OwnedSemaphorePermit>,
    semaphore: Arc<Semaphore>,
    table: PermitTable,
}

impl Drop for RecordPermit {
    fn drop(&mut self) {
        drop(self.permit.take());
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the table, one here: nobody else waits on the key.
        if Arc::strong_count(&self.semaphore) == 2 {
            table.remove(&self.key);
        }
    }
}

/// A task this node coordinates, as remembered in memory.
#[derive(Debug, Clone, PartialEq)]
struct CachedTask {
    task_id: TaskId,
    targets: Vec<NodeId>,
    /// Nodes whose deploy-done outcome has been recorded.
    reported: BTreeSet<NodeId>,
}

impl CachedTask {
    fn from_task(task: &DeploymentTask) -> Self {
        Self {
            task_id: task.id.clone(),
            targets: task.targets.clone(),
            reported: BTreeSet::new(),
        }
    }
}

pub struct TaskRegistry {
    store: StateStore,
    permit_timeout: Duration,
    permits: PermitTable,
    cache: RwLock<BTreeMap<TaskId, CachedTask>>,
}

impl TaskRegistry {
    pub fn new(store: StateStore, permit_timeout: Duration) -> Self {
        Self {
            store,
            permit_timeout,
            permits: Arc::new(Mutex::new(HashMap::new())),
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Permits ────────────────────────────────────────────────────

    /// Wait (bounded) for the permit guarding `artifact_id`.
    pub async fn artifact_permit(&self, artifact_id: &str) -> DeployResult<RecordPermit> {
        self.acquire(&format!("artifact/{artifact_id}")).await
    }

    /// Wait (bounded) for the permit guarding `task_id`.
    pub async fn task_permit(&self, task_id: &str) -> DeployResult<RecordPermit> {
        self.acquire(&format!("task/{task_id}")).await
    }

    async fn acquire(&self, key: &str) -> DeployResult<RecordPermit> {
        let semaphore = {
            let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
            permits
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        match tokio::time::timeout(self.permit_timeout, semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(RecordPermit {
                key: key.to_string(),
                permit: Some(permit),
                semaphore,
                table: self.permits.clone(),
            }),
            Ok(Err(_closed)) => Err(DeployError::TransientStore(format!(
                "permit for {key} is closed"
            ))),
            Err(_elapsed) => {
                warn!(%key, timeout = ?self.permit_timeout, "other update request not finished yet");
                Err(DeployError::TransientStore(format!(
                    "another update of {key} is still in progress"
                )))
            }
        }
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Persist a new task and start tracking it locally.
    ///
    /// Any store failure here is terminal for the request.
    pub fn create_task(&self, new: &NewTask) -> DeployResult<DeploymentTask> {
        let task = self
            .store
            .create_task(new)
            .map_err(|e| DeployError::Terminal(e.to_string()))?;
        self.track(CachedTask::from_task(&task));
        info!(task_id = %task.id, artifact_id = %task.artifact_id, targets = task.targets.len(), "deploy task created");
        Ok(task)
    }

    /// Durable task record.
    pub fn task(&self, task_id: &str) -> DeployResult<DeploymentTask> {
        self.store
            .get_task(task_id)?
            .ok_or_else(|| DeployError::TaskNotFound(task_id.to_string()))
    }

    /// Apply a patch to a task under its permit.
    pub async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> DeployResult<DeploymentTask> {
        let _permit = self.task_permit(task_id).await?;
        Ok(self.store.update_task(task_id, patch)?)
    }

    /// Fold one node's deploy outcome into the task.
    ///
    /// The first outcome moves a CREATED task to RUNNING; a failure is kept
    /// in the per-node error map. Outcomes never finish a task: finished
    /// tasks are returned unchanged. A second outcome from the same node is
    /// ignored while the task is cached.
    pub async fn record_node_outcome(
        &self,
        task_id: &str,
        node_id: &str,
        error: Option<&str>,
    ) -> DeployResult<DeploymentTask> {
        let _permit = self.task_permit(task_id).await?;
        let task = self.task(task_id)?;
        if task.state.is_done() {
            debug!(%task_id, %node_id, state = ?task.state, "outcome for finished task ignored");
            return Ok(task);
        }
        if self.has_reported(task_id, node_id) {
            debug!(%task_id, %node_id, "repeated outcome ignored");
            return Ok(task);
        }

        let mut patch = TaskPatch::default().if_version(task.version);
        if task.state == TaskState::Created {
            patch.state = Some(TaskState::Running);
        }
        if let Some(error) = error {
            patch = patch.with_node_error(node_id, error);
        }
        let updated = if patch.state.is_none() && patch.node_errors.is_empty() {
            task
        } else {
            self.store.update_task(task_id, &patch)?
        };
        if let Some((reported, expected)) = self.mark_reported(task_id, node_id) {
            debug!(%task_id, %node_id, reported, expected, failed = error.is_some(), "node outcome recorded");
            if reported == expected {
                info!(%task_id, "every target has reported");
            }
        }
        Ok(updated)
    }

    /// Move an unfinished task to a terminal state.
    ///
    /// Returns `None` if the task had already finished.
    pub async fn finalize_task(
        &self,
        task_id: &str,
        state: TaskState,
        error: Option<String>,
    ) -> DeployResult<Option<DeploymentTask>> {
        let finished = {
            let _permit = self.task_permit(task_id).await?;
            let task = self.task(task_id)?;
            if task.state.is_done() {
                None
            } else {
                let mut patch = TaskPatch::state(state).if_version(task.version);
                patch.error = error;
                Some(self.store.update_task(task_id, &patch)?)
            }
        };
        self.untrack(task_id);
        if let Some(ref task) = finished {
            info!(%task_id, state = ?task.state, error = ?task.error, "deploy task finished");
        }
        Ok(finished)
    }

    // ── Artifacts ──────────────────────────────────────────────────

    /// Durable artifact record.
    pub fn artifact(&self, artifact_id: &str) -> DeployResult<Artifact> {
        self.store
            .get_artifact(artifact_id)?
            .ok_or_else(|| DeployError::NotFound(artifact_id.to_string()))
    }

    /// Mark an artifact DEPLOY_FAILED without taking its permit.
    ///
    /// For rolling back a deploy whose own write could not get the permit;
    /// waiting again would time out the same way.
    pub fn mark_artifact_failed(&self, artifact_id: &str) -> DeployResult<Artifact> {
        let artifact = self
            .store
            .update_artifact(artifact_id, &ArtifactPatch::state(ArtifactState::DeployFailed))?;
        warn!(%artifact_id, version = artifact.version, "artifact marked deploy failed");
        Ok(artifact)
    }

    /// Apply a patch to an artifact under its permit.
    pub async fn update_artifact(&self, artifact_id: &str, patch: &ArtifactPatch) -> DeployResult<Artifact> {
        let _permit = self.artifact_permit(artifact_id).await?;
        Ok(self.store.update_artifact(artifact_id, patch)?)
    }

    /// Read-modify-write an artifact under its permit.
    ///
    /// `edit` sees the current record and returns the patch to apply, or
    /// `None` to leave it alone. The write is checked against the version
    /// that was read.
    pub async fn mutate_artifact<F>(&self, artifact_id: &str, edit: F) -> DeployResult<Option<Artifact>>
    where
        F: FnOnce(&Artifact) -> Option<ArtifactPatch>,
    {
        let _permit = self.artifact_permit(artifact_id).await?;
        let current = self.artifact(artifact_id)?;
        match edit(&current) {
            Some(patch) => {
                let patch = patch.if_version(current.version);
                Ok(Some(self.store.update_artifact(artifact_id, &patch)?))
            }
            None => Ok(None),
        }
    }

    // ── Local cache ────────────────────────────────────────────────

    fn track(&self, task: CachedTask) {
        debug!(task_id = %task.task_id, "task tracked");
        self.write_cache().insert(task.task_id.clone(), task);
    }

    fn untrack(&self, task_id: &str) -> bool {
        self.write_cache().remove(task_id).is_some()
    }

    /// Drop cached tasks that have settled: not in `active`, and either every
    /// target has reported or the durable record is finished. Returns the
    /// dropped IDs.
    pub fn prune_cache(&self, active: &BTreeSet<TaskId>) -> Vec<TaskId> {
        let candidates: Vec<CachedTask> = self
            .read_cache()
            .values()
            .filter(|task| !active.contains(&task.task_id))
            .cloned()
            .collect();
        let settled: Vec<TaskId> = candidates
            .into_iter()
            .filter(|task| task.reported.len() >= task.targets.len() || self.is_finished(&task.task_id))
            .map(|task| task.task_id)
            .collect();

        let mut cache = self.write_cache();
        for task_id in &settled {
            cache.remove(task_id);
        }
        settled
    }

    fn is_finished(&self, task_id: &str) -> bool {
        match self.store.get_task(task_id) {
            Ok(Some(task)) => task.state.is_done(),
            Ok(None) => true,
            Err(e) => {
                warn!(%task_id, error = %e, "task record unreadable, keeping it cached");
                false
            }
        }
    }

    fn has_reported(&self, task_id: &str, node_id: &str) -> bool {
        self.read_cache()
            .get(task_id)
            .is_some_and(|task| task.reported.contains(node_id))
    }

    /// Returns (reported, expected) counts for a cached task.
    fn mark_reported(&self, task_id: &str, node_id: &str) -> Option<(usize, usize)> {
        let mut cache = self.write_cache();
        let task = cache.get_mut(task_id)?;
        task.reported.insert(node_id.to_string());
        Some((task.reported.len(), task.targets.len()))
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<TaskId, CachedTask>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<TaskId, CachedTask>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}
