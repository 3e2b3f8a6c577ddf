//! ReconciliationLoop — one sweep of the cluster.
//!
//! A sweep asks every live node what it runs, pushes the aggregated view
//! back to all of them, then corrects the durable artifact records and
//! finalizes deploy tasks nobody is working on any more.
//!
//! Sweeps are single-flight: a sweep that fires while another is running is
//! skipped, not queued.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use modelgrid_cluster::{Correction, Membership, NodeRequest, NodeResponse, NodeStateReport, Transport};
use modelgrid_core::{SettingsHandle, epoch_millis};
use modelgrid_deploy::TaskRegistry;
use modelgrid_state::*;

use crate::error::ReconcileResult;

/// What the live nodes reported in one sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterSnapshot {
    /// Artifact → nodes hosting it.
    pub hosting: BTreeMap<ArtifactId, BTreeSet<NodeId>>,
    /// Artifact → nodes still loading it.
    pub loading: BTreeMap<ArtifactId, BTreeSet<NodeId>>,
    /// Task → nodes still executing it.
    pub tasks: BTreeMap<TaskId, BTreeSet<NodeId>>,
    /// Nodes that answered.
    pub reached: BTreeSet<NodeId>,
}

impl ClusterSnapshot {
    pub fn from_reports(reports: impl IntoIterator<Item = NodeStateReport>) -> Self {
        let mut snapshot = Self::default();
        for report in reports {
            for artifact_id in report.hosted {
                snapshot
                    .hosting
                    .entry(artifact_id)
                    .or_default()
                    .insert(report.node_id.clone());
            }
            for artifact_id in report.loading {
                snapshot
                    .loading
                    .entry(artifact_id)
                    .or_default()
                    .insert(report.node_id.clone());
            }
            for task_id in report.running_tasks {
                snapshot
                    .tasks
                    .entry(task_id)
                    .or_default()
                    .insert(report.node_id.clone());
            }
            snapshot.reached.insert(report.node_id);
        }
        snapshot
    }

    pub fn correction(&self) -> Correction {
        Correction {
            hosting: self.hosting.clone(),
            tasks: self.tasks.clone(),
            clear_all: self.hosting.is_empty(),
        }
    }

    fn hosts(&self, artifact_id: &str) -> BTreeSet<NodeId> {
        self.hosting.get(artifact_id).cloned().unwrap_or_default()
    }

    fn is_loading(&self, artifact_id: &str) -> bool {
        self.loading
            .get(artifact_id)
            .is_some_and(|nodes| !nodes.is_empty())
    }
}

/// Correction for one artifact, or `None` when its record already matches.
///
/// Planned workers that left the cluster are pruned and the current set is
/// replaced by the nodes that actually host the artifact. The state follows
/// the first matching rule:
///
/// | observed | state |
/// |---|---|
/// | some node still loading | DEPLOYING |
/// | nobody hosts it, outside the grace window | DEPLOY_FAILED |
/// | hosted by fewer than planned | PARTIALLY_DEPLOYED |
/// | hosted by at least the planned count | DEPLOYED |
///
/// The grace window only shields a DEPLOYING artifact whose deploy started
/// less than `grace` ago.
pub fn decide(
    artifact: &Artifact,
    snapshot: &ClusterSnapshot,
    live: &BTreeSet<NodeId>,
    now: u64,
    grace: Duration,
) -> Option<ArtifactPatch> {
    let planned: BTreeSet<NodeId> = artifact.planned_workers.intersection(live).cloned().collect();
    let hosting = snapshot.hosts(&artifact.id);
    let (hosted, planned_count) = (hosting.len(), planned.len());

    let within_grace = artifact.state == ArtifactState::Deploying
        && artifact
            .deploy_started_at
            .is_some_and(|started| now < started.saturating_add(grace.as_millis() as u64));

    let state = if snapshot.is_loading(&artifact.id) {
        Some(ArtifactState::Deploying)
    } else if hosted == 0 && !within_grace {
        Some(ArtifactState::DeployFailed)
    } else if hosted > 0 && hosted < planned_count {
        Some(ArtifactState::PartiallyDeployed)
    } else if planned_count > 0 && hosted >= planned_count {
        if hosted > planned_count {
            warn!(artifact_id = %artifact.id, hosted, planned = planned_count, "artifact hosted on more nodes than planned");
        }
        Some(ArtifactState::Deployed)
    } else {
        None
    };

    let mut patch = ArtifactPatch::default();
    if let Some(state) = state.filter(|s| *s != artifact.state) {
        patch.state = Some(state);
    }
    if planned != artifact.planned_workers {
        patch = patch.with_planned_workers(planned);
    }
    if hosting != artifact.current_workers {
        patch = patch.with_current_workers(hosting);
    }
    if patch.is_empty() {
        None
    } else {
        Some(patch.if_version(artifact.version))
    }
}

/// Result of one `run_once` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    /// Another sweep was still running.
    Skipped,
    Completed(SweepReport),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub nodes_polled: usize,
    pub nodes_reached: usize,
    /// Artifacts whose records were corrected.
    pub updated: Vec<ArtifactId>,
    /// Artifacts changed by someone else mid-sweep; left for the next one.
    pub conflicts: Vec<ArtifactId>,
    /// Tasks moved to a terminal state.
    pub finished_tasks: Vec<TaskId>,
}

pub struct ReconciliationLoop {
    registry: Arc<TaskRegistry>,
    membership: Arc<dyn Membership>,
    transport: Arc<dyn Transport>,
    settings: SettingsHandle,
    guard: Semaphore,
    sweeps: AtomicU64,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ReconciliationLoop {
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
            guard: Semaphore::new(1),
            sweeps: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn membership(&self) -> &Arc<dyn Membership> {
        &self.membership
    }

    /// Completed sweeps so far.
    pub fn sweeps_run(&self) -> u64 {
        self.sweeps.load(Ordering::SeqCst)
    }

    /// Most sweeps ever observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub async fn run_once(&self) -> ReconcileResult<SweepOutcome> {
        self.run_once_at(epoch_millis()).await
    }

    /// Run a sweep as if the clock read `now` (unix millis).
    pub async fn run_once_at(&self, now: u64) -> ReconcileResult<SweepOutcome> {
        let Ok(_guard) = self.guard.try_acquire() else {
            debug!("sweep already running, skipped");
            return Ok(SweepOutcome::Skipped);
        };
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        let result = self.sweep(now).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        result.map(SweepOutcome::Completed)
    }

    async fn sweep(&self, now: u64) -> ReconcileResult<SweepReport> {
        let settings = self.settings.current();
        let grace = settings.reconcile.grace_period;
        let nodes = self.membership.list_nodes();
        let live: BTreeSet<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();

        let reports = self.poll(&live, settings.reconcile.request_timeout).await;
        let snapshot = ClusterSnapshot::from_reports(reports);
        self.push_correction(&live, snapshot.correction()).await;

        let mut report = SweepReport {
            nodes_polled: live.len(),
            nodes_reached: snapshot.reached.len(),
            ..SweepReport::default()
        };

        let store = self.registry.store();
        let patches: Vec<(ArtifactId, ArtifactPatch)> = store
            .list_artifacts_in_states(&ArtifactState::RECONCILED)?
            .iter()
            .filter_map(|artifact| {
                decide(artifact, &snapshot, &live, now, grace).map(|patch| (artifact.id.clone(), patch))
            })
            .collect();
        let outcome = store.apply_artifact_patches(&patches)?;
        for artifact in &outcome.applied {
            info!(
                artifact_id = %artifact.id,
                state = ?artifact.state,
                current = ?artifact.current_workers,
                planned = artifact.planning_count,
                "artifact record corrected"
            );
        }
        if !outcome.conflicts.is_empty() {
            debug!(conflicts = ?outcome.conflicts, "artifacts changed mid-sweep, deferred");
        }
        report.updated = outcome.applied.into_iter().map(|a| a.id).collect();
        report.conflicts = outcome.conflicts;

        report.finished_tasks = self.finalize_orphaned_tasks(&snapshot, now, grace).await?;

        debug!(
            polled = report.nodes_polled,
            reached = report.nodes_reached,
            updated = report.updated.len(),
            finished = report.finished_tasks.len(),
            "sweep complete"
        );
        Ok(report)
    }

    /// Ask every live node for its state report. Silent nodes are left out.
    async fn poll(&self, live: &BTreeSet<NodeId>, timeout: Duration) -> Vec<NodeStateReport> {
        let mut requests = JoinSet::new();
        for node_id in live {
            let transport = self.transport.clone();
            let node_id = node_id.clone();
            requests.spawn(async move {
                let reply = tokio::time::timeout(timeout, transport.send(&node_id, NodeRequest::ReportState)).await;
                (node_id, reply)
            });
        }

        let mut reports = Vec::with_capacity(live.len());
        while let Some(joined) = requests.join_next().await {
            match joined {
                Ok((_, Ok(Ok(NodeResponse::State(report))))) => reports.push(report),
                Ok((node_id, Ok(Ok(other)))) => {
                    warn!(%node_id, response = ?other, "unexpected reply to state request");
                }
                Ok((node_id, Ok(Err(e)))) => warn!(%node_id, error = %e, "node did not report state"),
                Ok((node_id, Err(_))) => warn!(%node_id, ?timeout, "state request timed out"),
                Err(e) => warn!(error = %e, "state request aborted"),
            }
        }
        reports
    }

    async fn push_correction(&self, live: &BTreeSet<NodeId>, correction: Correction) {
        let mut sends = JoinSet::new();
        for node_id in live {
            let transport = self.transport.clone();
            let node_id = node_id.clone();
            let request = NodeRequest::Correct(correction.clone());
            sends.spawn(async move {
                let result = transport.send(&node_id, request).await;
                (node_id, result)
            });
        }
        while let Some(joined) = sends.join_next().await {
            if let Ok((node_id, Err(e))) = joined {
                debug!(%node_id, error = %e, "correction not delivered");
            }
        }
    }

    /// Finish in-flight tasks that no node executes and whose grace window
    /// has passed.
    async fn finalize_orphaned_tasks(
        &self,
        snapshot: &ClusterSnapshot,
        now: u64,
        grace: Duration,
    ) -> ReconcileResult<Vec<TaskId>> {
        let grace_ms = grace.as_millis() as u64;
        let mut finished = Vec::new();

        for task in self.registry.store().list_tasks_in_states(&TaskState::IN_FLIGHT)? {
            if snapshot.tasks.contains_key(&task.id) {
                continue;
            }
            if now < task.created_at.saturating_add(grace_ms) {
                continue;
            }

            let hosts = snapshot.hosts(&task.artifact_id);
            let missing: Vec<&NodeId> = task.targets.iter().filter(|n| !hosts.contains(*n)).collect();
            let (state, error) = if missing.len() < task.targets.len() {
                let error = (!missing.is_empty()).then(|| format!("not deployed on {missing:?}"));
                (TaskState::Completed, error)
            } else {
                (TaskState::Failed, Some("no target node hosts the artifact".to_string()))
            };

            match self.registry.finalize_task(&task.id, state, error).await {
                Ok(Some(done)) => finished.push(done.id),
                Ok(None) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "failed to finalize task"),
            }
        }
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use modelgrid_cluster::{BoxFuture, ClusterError, ClusterResult, MembershipManager};
    use modelgrid_core::Settings;

    const GRACE: Duration = Duration::from_secs(20);

    fn set(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn artifact(state: ArtifactState, planned: &[&str], current: &[&str]) -> Artifact {
        let mut artifact = Artifact::new("m1", "remote", "ff", 0);
        artifact.state = state;
        artifact.planned_workers = set(planned);
        artifact.planning_count = planned.len() as u32;
        artifact.current_workers = set(current);
        artifact.current_count = current.len() as u32;
        artifact.deploy_started_at = Some(1_000);
        artifact.version = 7;
        artifact
    }

    fn snapshot(hosting: &[&str], loading: &[&str]) -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot::default();
        if !hosting.is_empty() {
            snapshot.hosting.insert("m1".into(), set(hosting));
        }
        if !loading.is_empty() {
            snapshot.loading.insert("m1".into(), set(loading));
        }
        snapshot
    }

    // ── decide ────────────────────────────────────────────────────

    #[test]
    fn partial_hosting_is_partially_deployed() {
        let a = artifact(ArtifactState::Deploying, &["a", "b", "c"], &[]);
        let patch = decide(&a, &snapshot(&["a", "b"], &[]), &set(&["a", "b", "c"]), 100_000, GRACE).unwrap();

        assert_eq!(patch.state, Some(ArtifactState::PartiallyDeployed));
        assert_eq!(patch.current_workers, Some(set(&["a", "b"])));
        assert_eq!(patch.current_count, Some(2));
        assert_eq!(patch.planned_workers, None);
        assert_eq!(patch.if_version, Some(7));
    }

    #[test]
    fn loading_keeps_deploying() {
        let a = artifact(ArtifactState::Deployed, &["a", "b"], &["a", "b"]);
        let patch = decide(&a, &snapshot(&["a"], &["b"]), &set(&["a", "b"]), 100_000, GRACE).unwrap();
        assert_eq!(patch.state, Some(ArtifactState::Deploying));
        assert_eq!(patch.current_workers, Some(set(&["a"])));
    }

    #[test]
    fn nothing_hosted_fails_after_grace() {
        let a = artifact(ArtifactState::Deploying, &["a"], &[]);
        let live = set(&["a"]);

        assert_eq!(decide(&a, &snapshot(&[], &[]), &live, 5_000, GRACE), None);

        let patch = decide(&a, &snapshot(&[], &[]), &live, 21_000, GRACE).unwrap();
        assert_eq!(patch.state, Some(ArtifactState::DeployFailed));
    }

    #[test]
    fn grace_only_shields_deploying() {
        let a = artifact(ArtifactState::Deployed, &["a"], &["a"]);
        let patch = decide(&a, &snapshot(&[], &[]), &set(&["a"]), 2_000, GRACE).unwrap();
        assert_eq!(patch.state, Some(ArtifactState::DeployFailed));
        assert_eq!(patch.current_workers, Some(BTreeSet::new()));
    }

    #[test]
    fn full_hosting_is_deployed_and_stable() {
        let a = artifact(ArtifactState::PartiallyDeployed, &["a", "b"], &["a"]);
        let live = set(&["a", "b"]);
        let patch = decide(&a, &snapshot(&["a", "b"], &[]), &live, 100_000, GRACE).unwrap();
        assert_eq!(patch.state, Some(ArtifactState::Deployed));

        let settled = artifact(ArtifactState::Deployed, &["a", "b"], &["a", "b"]);
        assert_eq!(decide(&settled, &snapshot(&["a", "b"], &[]), &live, 100_000, GRACE), None);
    }

    #[test]
    fn departed_planned_workers_are_pruned() {
        let a = artifact(ArtifactState::PartiallyDeployed, &["a", "b", "c"], &["a", "b"]);
        let patch = decide(&a, &snapshot(&["a", "b"], &[]), &set(&["a", "b"]), 100_000, GRACE).unwrap();

        assert_eq!(patch.planned_workers, Some(set(&["a", "b"])));
        assert_eq!(patch.planning_count, Some(2));
        assert_eq!(patch.state, Some(ArtifactState::Deployed));
        assert_eq!(patch.current_workers, None);
    }

    #[test]
    fn unchanged_partial_record_is_left_alone() {
        let a = artifact(ArtifactState::PartiallyDeployed, &["a", "b", "c"], &["a", "b"]);
        let live = set(&["a", "b", "c"]);
        assert_eq!(decide(&a, &snapshot(&["a", "b"], &[]), &live, 100_000, GRACE), None);
    }

    #[test]
    fn snapshot_aggregates_reports() {
        let snapshot = ClusterSnapshot::from_reports([
            NodeStateReport {
                node_id: "a".into(),
                hosted: vec!["m1".into()],
                loading: vec!["m2".into()],
                running_tasks: vec!["t2".into()],
            },
            NodeStateReport {
                node_id: "b".into(),
                hosted: vec!["m1".into()],
                ..Default::default()
            },
        ]);
        assert_eq!(snapshot.hosting["m1"], set(&["a", "b"]));
        assert_eq!(snapshot.loading["m2"], set(&["a"]));
        assert_eq!(snapshot.tasks["t2"], set(&["a"]));
        assert_eq!(snapshot.reached, set(&["a", "b"]));

        let correction = snapshot.correction();
        assert!(!correction.clear_all);
        assert!(ClusterSnapshot::default().correction().clear_all);
    }

    // ── sweep ─────────────────────────────────────────────────────

    /// Answers state requests from a fixed table and records corrections.
    struct Reports {
        table: BTreeMap<NodeId, NodeStateReport>,
        corrections: Mutex<Vec<(NodeId, Correction)>>,
        stall: Option<Duration>,
    }

    impl Transport for Reports {
        fn send(&self, node_id: &str, request: NodeRequest) -> BoxFuture<'static, ClusterResult<NodeResponse>> {
            let reply = match request {
                NodeRequest::ReportState => match self.table.get(node_id) {
                    Some(report) => Ok(NodeResponse::State(report.clone())),
                    None => Err(ClusterError::Unreachable(node_id.to_string())),
                },
                NodeRequest::Correct(correction) => {
                    self.corrections
                        .lock()
                        .unwrap()
                        .push((node_id.to_string(), correction));
                    Ok(NodeResponse::Accepted)
                }
                _ => Ok(NodeResponse::Accepted),
            };
            let stall = self.stall;
            Box::pin(async move {
                if let Some(stall) = stall {
                    tokio::time::sleep(stall).await;
                }
                reply
            })
        }
    }

    struct Fixture {
        sweep: Arc<ReconciliationLoop>,
        store: StateStore,
        transport: Arc<Reports>,
    }

    fn fixture(reports: Vec<NodeStateReport>, stall: Option<Duration>) -> Fixture {
        let manager = MembershipManager::new();
        for id in ["a", "b", "c"] {
            manager.join(NodeRecord::new(id, id, &["cluster_manager", "ml"]));
        }
        let store = StateStore::open_in_memory().unwrap();
        let registry = Arc::new(TaskRegistry::new(store.clone(), Duration::from_secs(1)));
        let transport = Arc::new(Reports {
            table: reports.into_iter().map(|r| (r.node_id.clone(), r)).collect(),
            corrections: Mutex::new(Vec::new()),
            stall,
        });
        let sweep = Arc::new(ReconciliationLoop::new(
            registry,
            Arc::new(manager.view("a")),
            transport.clone(),
            SettingsHandle::new(Settings::default()),
        ));
        Fixture {
            sweep,
            store,
            transport,
        }
    }

    fn hosting(node: &str, artifacts: &[&str]) -> NodeStateReport {
        NodeStateReport {
            node_id: node.into(),
            hosted: artifacts.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn completed(outcome: SweepOutcome) -> SweepReport {
        match outcome {
            SweepOutcome::Completed(report) => report,
            SweepOutcome::Skipped => panic!("sweep was skipped"),
        }
    }

    #[tokio::test]
    async fn sweep_corrects_records_and_pushes_view() {
        let fx = fixture(vec![hosting("a", &["m1"]), hosting("b", &["m1"])], None);
        fx.store
            .put_artifact(&artifact(ArtifactState::Deploying, &["a", "b", "c"], &["a"]))
            .unwrap();

        let report = completed(fx.sweep.run_once_at(100_000).await.unwrap());
        assert_eq!(report.nodes_polled, 3);
        assert_eq!(report.nodes_reached, 2);
        assert_eq!(report.updated, vec!["m1".to_string()]);

        let m1 = fx.store.get_artifact("m1").unwrap().unwrap();
        assert_eq!(m1.state, ArtifactState::PartiallyDeployed);
        assert_eq!(m1.current_workers, set(&["a", "b"]));

        let corrections = fx.transport.corrections.lock().unwrap();
        assert_eq!(corrections.len(), 3);
        assert_eq!(corrections[0].1.hosting["m1"], set(&["a", "b"]));

        // Nothing changed since, so a second sweep writes nothing.
        drop(corrections);
        let again = completed(fx.sweep.run_once_at(110_000).await.unwrap());
        assert!(again.updated.is_empty());
    }

    #[tokio::test]
    async fn stale_version_is_deferred() {
        let fx = fixture(vec![hosting("a", &["m1"])], None);
        let a = artifact(ArtifactState::Deploying, &["a"], &[]);
        fx.store.put_artifact(&a).unwrap();

        let snapshot = snapshot(&["a"], &[]);
        let patch = decide(&a, &snapshot, &set(&["a", "b", "c"]), 100_000, GRACE).unwrap();
        // Someone else writes first.
        fx.store
            .update_artifact("m1", &ArtifactPatch::state(ArtifactState::Deploying).if_version(7))
            .unwrap();
        let outcome = fx.store.apply_artifact_patches(&[("m1".into(), patch)]).unwrap();
        assert_eq!(outcome.conflicts, vec!["m1".to_string()]);

        let report = completed(fx.sweep.run_once_at(100_000).await.unwrap());
        assert_eq!(report.updated, vec!["m1".to_string()]);
        assert_eq!(
            fx.store.get_artifact("m1").unwrap().unwrap().state,
            ArtifactState::Deployed
        );
    }

    #[tokio::test]
    async fn orphaned_tasks_are_finalized_after_grace() {
        let fx = fixture(vec![hosting("a", &["m1"])], None);
        fx.store
            .put_artifact(&artifact(ArtifactState::Deploying, &["a", "b"], &[]))
            .unwrap();
        let partial = fx
            .store
            .create_task(&NewTask {
                artifact_id: "m1".into(),
                is_async: true,
                targets: vec!["a".into(), "b".into()],
                coordinator: "a".into(),
            })
            .unwrap();
        let lost = fx
            .store
            .create_task(&NewTask {
                artifact_id: "m9".into(),
                is_async: true,
                targets: vec!["c".into()],
                coordinator: "a".into(),
            })
            .unwrap();

        // Inside the grace window nothing is finalized.
        let early = completed(fx.sweep.run_once_at(partial.created_at + 1_000).await.unwrap());
        assert!(early.finished_tasks.is_empty());

        let late = completed(fx.sweep.run_once_at(partial.created_at + 60_000).await.unwrap());
        assert_eq!(late.finished_tasks, vec![partial.id.clone(), lost.id.clone()]);

        let partial = fx.store.get_task(&partial.id).unwrap().unwrap();
        assert_eq!(partial.state, TaskState::Completed);
        assert!(partial.error.unwrap().contains("\"b\""));

        let lost = fx.store.get_task(&lost.id).unwrap().unwrap();
        assert_eq!(lost.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn tasks_still_running_on_a_node_are_kept() {
        let report = NodeStateReport {
            node_id: "a".into(),
            loading: vec!["m1".into()],
            running_tasks: vec!["task-00000001".into()],
            ..Default::default()
        };
        let fx = fixture(vec![report], None);
        let task = fx
            .store
            .create_task(&NewTask {
                artifact_id: "m1".into(),
                is_async: true,
                targets: vec!["a".into()],
                coordinator: "a".into(),
            })
            .unwrap();
        assert_eq!(task.id, "task-00000001");

        let report = completed(fx.sweep.run_once_at(task.created_at + 600_000).await.unwrap());
        assert!(report.finished_tasks.is_empty());
        assert_eq!(fx.store.get_task(&task.id).unwrap().unwrap().state, TaskState::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_sweeps_are_skipped() {
        let fx = fixture(vec![hosting("a", &[])], Some(Duration::from_millis(500)));

        let first = {
            let sweep = fx.sweep.clone();
            tokio::spawn(async move { sweep.run_once().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = fx.sweep.run_once().await.unwrap();
        assert_eq!(second, SweepOutcome::Skipped);

        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, SweepOutcome::Completed(_)));
        assert_eq!(fx.sweep.sweeps_run(), 1);
        assert_eq!(fx.sweep.peak_concurrency(), 1);
    }
}
