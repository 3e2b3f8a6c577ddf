//! StateStore — redb-backed persistence for artifacts and deployment tasks.
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns. Partial
//! updates read, patch, and write a record inside one write transaction and
//! honour an optional expected version (optimistic concurrency). The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use modelgrid_core::epoch_millis;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Result of a batched artifact update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Records written, with their new contents.
    pub applied: Vec<Artifact>,
    /// Records skipped because their version moved on.
    pub conflicts: Vec<ArtifactId>,
    /// Records that no longer exist.
    pub missing: Vec<ArtifactId>,
}

/// Thread-safe record store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write()?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ARTIFACTS)?;
        txn.open_table(TASKS)?;
        txn.open_table(META)?;
        txn.commit()?;
        Ok(())
    }

    // ── Artifacts ──────────────────────────────────────────────────

    /// Insert or replace an artifact record as given.
    pub fn put_artifact(&self, artifact: &Artifact) -> StateResult<()> {
        let value = serde_json::to_vec(artifact)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ARTIFACTS)?;
            table.insert(artifact.id.as_str(), value.as_slice())?;
        }
        txn.commit()?;
        debug!(artifact_id = %artifact.id, "artifact stored");
        Ok(())
    }

    /// Get an artifact by ID.
    pub fn get_artifact(&self, artifact_id: &str) -> StateResult<Option<Artifact>> {
        let txn = self.db.begin_read()?;
        read_record(&txn.open_table(ARTIFACTS)?, artifact_id)
    }

    /// List all artifacts.
    pub fn list_artifacts(&self) -> StateResult<Vec<Artifact>> {
        self.list_artifacts_where(|_| true)
    }

    /// List artifacts whose state is one of `states`.
    pub fn list_artifacts_in_states(&self, states: &[ArtifactState]) -> StateResult<Vec<Artifact>> {
        self.list_artifacts_where(|a| states.contains(&a.state))
    }

    fn list_artifacts_where(&self, keep: impl Fn(&Artifact) -> bool) -> StateResult<Vec<Artifact>> {
        let txn = self.db.begin_read()?;
        scan_records(&txn.open_table(ARTIFACTS)?, keep)
    }

    /// Apply a partial update to one artifact and return the new record.
    ///
    /// Fails with `NotFound` if the artifact is absent and with `Conflict`
    /// if `patch.if_version` no longer matches.
    pub fn update_artifact(&self, artifact_id: &str, patch: &ArtifactPatch) -> StateResult<Artifact> {
        let now = epoch_millis();
        let txn = self.db.begin_write()?;
        let updated;
        {
            let mut table = txn.open_table(ARTIFACTS)?;
            let mut artifact: Artifact = read_record(&table, artifact_id)?
                .ok_or_else(|| StateError::NotFound(artifact_id.to_string()))?;
            check_version(artifact_id, patch.if_version, artifact.version)?;
            patch.apply(&mut artifact, now);
            table.insert(artifact_id, serde_json::to_vec(&artifact)?.as_slice())?;
            updated = artifact;
        }
        txn.commit()?;
        debug!(%artifact_id, version = updated.version, state = ?updated.state, "artifact updated");
        Ok(updated)
    }

    /// Apply many artifact patches in a single write transaction.
    ///
    /// Version conflicts and missing records are skipped and reported; the
    /// remaining patches are committed together.
    pub fn apply_artifact_patches(
        &self,
        patches: &[(ArtifactId, ArtifactPatch)],
    ) -> StateResult<BatchOutcome> {
        let now = epoch_millis();
        let mut outcome = BatchOutcome::default();
        if patches.is_empty() {
            return Ok(outcome);
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ARTIFACTS)?;
            for (artifact_id, patch) in patches {
                let Some(mut artifact) = read_record::<Artifact>(&table, artifact_id)? else {
                    outcome.missing.push(artifact_id.clone());
                    continue;
                };
                if check_version(artifact_id, patch.if_version, artifact.version).is_err() {
                    outcome.conflicts.push(artifact_id.clone());
                    continue;
                }
                patch.apply(&mut artifact, now);
                table.insert(artifact_id.as_str(), serde_json::to_vec(&artifact)?.as_slice())?;
                outcome.applied.push(artifact);
            }
        }
        txn.commit()?;
        debug!(
            applied = outcome.applied.len(),
            conflicts = outcome.conflicts.len(),
            missing = outcome.missing.len(),
            "artifact batch committed"
        );
        Ok(outcome)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Persist a new task in state CREATED with a freshly allocated ID.
    ///
    /// IDs come from a durable sequence, so they stay unique across restarts.
    pub fn create_task(&self, new: &NewTask) -> StateResult<DeploymentTask> {
        let now = epoch_millis();
        let txn = self.db.begin_write()?;
        let task;
        {
            let mut meta = txn.open_table(META)?;
            let seq = meta
                .get(TASK_SEQUENCE)?
                .map(|guard| guard.value())
                .unwrap_or(0)
                + 1;
            meta.insert(TASK_SEQUENCE, seq)?;

            task = DeploymentTask {
                id: format!("task-{seq:08}"),
                artifact_id: new.artifact_id.clone(),
                is_async: new.is_async,
                targets: new.targets.clone(),
                coordinator: new.coordinator.clone(),
                state: TaskState::Created,
                error: None,
                node_errors: Default::default(),
                created_at: now,
                updated_at: now,
                version: 0,
            };
            let mut tasks = txn.open_table(TASKS)?;
            tasks.insert(task.id.as_str(), serde_json::to_vec(&task)?.as_slice())?;
        }
        txn.commit()?;
        debug!(task_id = %task.id, artifact_id = %task.artifact_id, "task created");
        Ok(task)
    }

    /// Get a task by ID.
    pub fn get_task(&self, task_id: &str) -> StateResult<Option<DeploymentTask>> {
        let txn = self.db.begin_read()?;
        read_record(&txn.open_table(TASKS)?, task_id)
    }

    /// List all tasks.
    pub fn list_tasks(&self) -> StateResult<Vec<DeploymentTask>> {
        self.list_tasks_where(|_| true)
    }

    /// List tasks whose state is one of `states`.
    pub fn list_tasks_in_states(&self, states: &[TaskState]) -> StateResult<Vec<DeploymentTask>> {
        self.list_tasks_where(|t| states.contains(&t.state))
    }

    fn list_tasks_where(&self, keep: impl Fn(&DeploymentTask) -> bool) -> StateResult<Vec<DeploymentTask>> {
        let txn = self.db.begin_read()?;
        scan_records(&txn.open_table(TASKS)?, keep)
    }

    /// Apply a partial update to one task and return the new record.
    pub fn update_task(&self, task_id: &str, patch: &TaskPatch) -> StateResult<DeploymentTask> {
        let now = epoch_millis();
        let txn = self.db.begin_write()?;
        let updated;
        {
            let mut table = txn.open_table(TASKS)?;
            let mut task: DeploymentTask = read_record(&table, task_id)?
                .ok_or_else(|| StateError::NotFound(task_id.to_string()))?;
            check_version(task_id, patch.if_version, task.version)?;
            patch.apply(&mut task, now);
            table.insert(task_id, serde_json::to_vec(&task)?.as_slice())?;
            updated = task;
        }
        txn.commit()?;
        debug!(%task_id, state = ?updated.state, "task updated");
        Ok(updated)
    }
}

// ── Record codec ───────────────────────────────────────────────────

fn read_record<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

fn scan_records<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    keep: impl Fn(&T) -> bool,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        let record: T = serde_json::from_slice(value.value())?;
        if keep(&record) {
            results.push(record);
        }
    }
    Ok(results)
}

fn check_version(key: &str, expected: Option<u64>, actual: u64) -> StateResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(StateError::Conflict {
            key: key.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}
