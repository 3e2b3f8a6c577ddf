//! In-process cluster assembly.
//!
//! `LocalCluster` wires one shared state store, one membership table and
//! one transport to any number of nodes. Each node gets its own task
//! registry, deploy executor, coordinator, node service and reconcile
//! service, exactly as a multi-process deployment would.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use modelgrid_cluster::{ClusterError, LocalTransport, Membership, MembershipManager, Transport};
use modelgrid_core::{NodeSettings, SettingsHandle, epoch_millis};
use modelgrid_deploy::{
    DeployAck, DeployError, DeployResult, DeploymentCoordinator, InferenceEngine, NodeService,
    TaskRegistry, WorkerDeploymentExecutor,
};
use modelgrid_reconcile::{ReconcileResult, ReconcileService, ReconciliationLoop, SweepOutcome};
use modelgrid_state::*;

/// Everything one node runs.
pub struct ClusterNode {
    pub id: NodeId,
    pub registry: Arc<TaskRegistry>,
    pub executor: WorkerDeploymentExecutor,
    pub coordinator: Arc<DeploymentCoordinator>,
    pub reconcile: Arc<ReconcileService>,
}

pub struct LocalCluster {
    store: StateStore,
    membership: MembershipManager,
    transport: LocalTransport,
    settings: SettingsHandle,
    nodes: BTreeMap<NodeId, ClusterNode>,
}

impl LocalCluster {
    pub fn new(store: StateStore, settings: SettingsHandle) -> Self {
        let current = settings.current();
        Self {
            store,
            membership: MembershipManager::new().with_dead_timeout(current.cluster.dead_timeout),
            transport: LocalTransport::new(current.reconcile.request_timeout),
            settings,
            nodes: BTreeMap::new(),
        }
    }

    /// A cluster with every node listed under `[cluster]` in the settings.
    pub fn from_settings<F>(store: StateStore, settings: SettingsHandle, engine_for: F) -> Self
    where
        F: Fn(&NodeSettings) -> Arc<dyn InferenceEngine>,
    {
        let mut cluster = Self::new(store, settings);
        let configured = cluster.settings.current().cluster.nodes.clone();
        for node in &configured {
            cluster.add_node(node_record(node), engine_for(node));
        }
        cluster
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn membership(&self) -> &MembershipManager {
        &self.membership
    }

    pub fn transport(&self) -> &LocalTransport {
        &self.transport
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Assemble a node, route requests to it and join it to the cluster.
    pub fn add_node(&mut self, record: NodeRecord, engine: Arc<dyn InferenceEngine>) -> &ClusterNode {
        let settings = self.settings.current();
        let id = record.id.clone();

        let registry = Arc::new(TaskRegistry::new(
            self.store.clone(),
            settings.reconcile.permit_timeout,
        ));
        let view: Arc<dyn Membership> = Arc::new(self.membership.view(&id));
        let transport: Arc<dyn Transport> = Arc::new(self.transport.clone());

        let executor = WorkerDeploymentExecutor::new(
            &id,
            engine,
            registry.clone(),
            transport.clone(),
            &settings.deploy,
        );
        let coordinator = Arc::new(DeploymentCoordinator::new(
            registry.clone(),
            view.clone(),
            transport.clone(),
            self.settings.clone(),
        ));
        self.transport.register(
            &id,
            Arc::new(NodeService::new(executor.clone(), coordinator.clone())),
        );

        let sweep = Arc::new(ReconciliationLoop::new(
            registry.clone(),
            view,
            transport,
            self.settings.clone(),
        ));
        let reconcile = Arc::new(ReconcileService::new(sweep, self.settings.clone()));

        self.membership.join(record);
        info!(node_id = %id, "node started");

        self.nodes.insert(
            id.clone(),
            ClusterNode {
                id: id.clone(),
                registry,
                executor,
                coordinator,
                reconcile,
            },
        );
        &self.nodes[&id]
    }

    /// Take a node out of the cluster as if it crashed.
    pub fn remove_node(&mut self, node_id: &str) -> bool {
        self.transport.deregister(node_id);
        self.membership.leave(node_id);
        let removed = self.nodes.remove(node_id).is_some();
        if removed {
            warn!(%node_id, "node removed");
        }
        removed
    }

    pub fn node(&self, node_id: &str) -> Option<&ClusterNode> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    pub fn leader(&self) -> Option<&ClusterNode> {
        self.membership
            .leader()
            .and_then(|id| self.nodes.get(&id))
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Register an artifact, or refresh the fingerprint of an existing one.
    pub fn register_artifact(&self, artifact_id: &str, category: &str, fingerprint: &str) -> StateResult<Artifact> {
        let artifact = match self.store.get_artifact(artifact_id)? {
            Some(mut existing) => {
                existing.category = category.to_string();
                existing.fingerprint = fingerprint.to_string();
                existing.updated_at = epoch_millis();
                existing
            }
            None => Artifact::new(artifact_id, category, fingerprint, epoch_millis()),
        };
        self.store.put_artifact(&artifact)?;
        debug!(%artifact_id, %category, "artifact registered");
        Ok(artifact)
    }

    /// Deploy through the leader's coordinator.
    ///
    /// Without a leader the call fails with a retryable transport error.
    pub async fn deploy(&self, artifact_id: &str, targets: Option<Vec<NodeId>>) -> DeployResult<DeployAck> {
        let Some(leader) = self.leader() else {
            warn!(%artifact_id, "deploy refused, no cluster leader");
            return Err(ClusterError::NoLeader.into());
        };
        leader.coordinator.deploy(artifact_id, targets).await
    }

    pub fn task_status(&self, task_id: &str) -> DeployResult<DeploymentTask> {
        self.store
            .get_task(task_id)?
            .ok_or_else(|| DeployError::TaskNotFound(task_id.to_string()))
    }

    /// Run one sweep on the leader right now.
    pub async fn sweep(&self) -> ReconcileResult<Option<SweepOutcome>> {
        self.sweep_at(epoch_millis()).await
    }

    /// Run one sweep on the leader as if the clock read `now`.
    pub async fn sweep_at(&self, now: u64) -> ReconcileResult<Option<SweepOutcome>> {
        match self.leader() {
            Some(leader) => Ok(Some(leader.reconcile.sweep().run_once_at(now).await?)),
            None => Ok(None),
        }
    }

    // ── Background work ────────────────────────────────────────────

    /// Start every node's reconcile service and heartbeat loop.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let heartbeat = self.settings.current().cluster.heartbeat_interval;
        let mut handles = Vec::new();
        for node in self.nodes.values() {
            handles.push(node.reconcile.clone().spawn(shutdown.clone()));
            if !heartbeat.is_zero() {
                handles.push(spawn_heartbeat(
                    self.membership.clone(),
                    node.id.clone(),
                    heartbeat,
                    shutdown.clone(),
                ));
            }
        }
        handles
    }
}

pub fn node_record(node: &NodeSettings) -> NodeRecord {
    NodeRecord {
        id: node.id.clone(),
        name: node.name.clone(),
        roles: node.roles.iter().cloned().collect(),
        attributes: node.attributes.clone(),
    }
}

fn spawn_heartbeat(
    membership: MembershipManager,
    node_id: NodeId,
    every: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !membership.heartbeat(&node_id) {
                        debug!(%node_id, "heartbeat loop exiting, node left");
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
