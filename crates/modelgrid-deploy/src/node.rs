//! NodeService — serves node requests for one node.
//!
//! Routes deploy and undeploy commands to the local executor, deploy-done
//! reports to the local coordinator, and sync-up traffic (state reports and
//! corrections) back to the executor.

use std::sync::Arc;

use tracing::debug;

use modelgrid_cluster::{BoxFuture, NodeHandler, NodeRequest, NodeResponse};

use crate::coordinator::DeploymentCoordinator;
use crate::error::DeployError;
use crate::executor::WorkerDeploymentExecutor;

#[derive(Clone)]
pub struct NodeService {
    executor: WorkerDeploymentExecutor,
    coordinator: Arc<DeploymentCoordinator>,
}

impl NodeService {
    pub fn new(executor: WorkerDeploymentExecutor, coordinator: Arc<DeploymentCoordinator>) -> Self {
        Self {
            executor,
            coordinator,
        }
    }

    pub fn executor(&self) -> &WorkerDeploymentExecutor {
        &self.executor
    }

    pub fn coordinator(&self) -> &Arc<DeploymentCoordinator> {
        &self.coordinator
    }
}

impl NodeHandler for NodeService {
    fn handle(&self, request: NodeRequest) -> BoxFuture<'static, NodeResponse> {
        let executor = self.executor.clone();
        let coordinator = self.coordinator.clone();

        Box::pin(async move {
            debug!(node_id = %executor.node_id(), kind = request.kind(), "node request");
            match request {
                NodeRequest::Deploy(cmd) => match executor.submit(cmd) {
                    Ok(()) => NodeResponse::Accepted,
                    Err(e) => rejected(&e),
                },
                NodeRequest::DeployDone(done) => match coordinator.handle_deploy_done(done).await {
                    Ok(()) => NodeResponse::Accepted,
                    Err(e) => rejected(&e),
                },
                NodeRequest::Undeploy(cmd) => match executor.undeploy(&cmd.artifact_id).await {
                    Ok(()) => NodeResponse::Accepted,
                    Err(e) => rejected(&e),
                },
                NodeRequest::ReportState => NodeResponse::State(executor.report()),
                NodeRequest::Correct(correction) => {
                    executor.apply_correction(&correction);
                    NodeResponse::Accepted
                }
            }
        })
    }
}

fn rejected(error: &DeployError) -> NodeResponse {
    NodeResponse::Rejected {
        reason: error.to_string(),
        retryable: error.is_retryable(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use modelgrid_cluster::{
        Correction, DeployCommand, LocalTransport, MembershipManager, Transport,
    };
    use modelgrid_core::{DeploySettings, SettingsHandle};
    use modelgrid_state::{NodeRecord, StateStore};

    use crate::engine::FsEngine;
    use crate::registry::TaskRegistry;

    fn service(transport: &LocalTransport, limits: DeploySettings) -> NodeService {
        let manager = MembershipManager::new();
        manager.join(NodeRecord::new("a", "node-a", &["ml"]));
        let registry = Arc::new(TaskRegistry::new(
            StateStore::open_in_memory().unwrap(),
            Duration::from_secs(1),
        ));
        let transport: Arc<dyn Transport> = Arc::new(transport.clone());
        let executor = WorkerDeploymentExecutor::new(
            "a",
            Arc::new(FsEngine::new("/nonexistent")),
            registry.clone(),
            transport.clone(),
            &limits,
        );
        let coordinator = Arc::new(DeploymentCoordinator::new(
            registry,
            Arc::new(manager.view("a")),
            transport,
            SettingsHandle::default(),
        ));
        NodeService::new(executor, coordinator)
    }

    #[tokio::test]
    async fn report_state_returns_local_snapshot() {
        let transport = LocalTransport::new(Duration::from_secs(1));
        let svc = service(&transport, DeploySettings::default());

        match svc.handle(NodeRequest::ReportState).await {
            NodeResponse::State(report) => {
                assert_eq!(report.node_id, "a");
                assert!(report.hosted.is_empty());
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(
            svc.handle(NodeRequest::Correct(Correction::default())).await,
            NodeResponse::Accepted
        );
    }

    #[tokio::test]
    async fn full_pool_rejects_as_retryable() {
        let transport = LocalTransport::new(Duration::from_secs(1));
        let limits = DeploySettings {
            max_concurrent_deploys: 1,
            max_queued_deploys: 0,
            ..DeploySettings::default()
        };
        let svc = service(&transport, limits);
        let cmd = |task: &str| {
            NodeRequest::Deploy(DeployCommand {
                artifact_id: "m1".into(),
                task_id: task.into(),
                fingerprint: "ff".into(),
                coordinator: "a".into(),
                planned_count: 1,
            })
        };

        assert_eq!(svc.handle(cmd("t1")).await, NodeResponse::Accepted);
        match svc.handle(cmd("t2")).await {
            NodeResponse::Rejected { retryable, reason } => {
                assert!(retryable);
                assert!(reason.contains("full"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn deploy_done_for_unknown_task_is_rejected() {
        let transport = LocalTransport::new(Duration::from_secs(1));
        let svc = service(&transport, DeploySettings::default());

        let resp = svc
            .handle(NodeRequest::DeployDone(modelgrid_cluster::DeployDone {
                task_id: "task-00000042".into(),
                artifact_id: "m1".into(),
                node_id: "a".into(),
                error: None,
            }))
            .await;
        assert!(matches!(resp, NodeResponse::Rejected { retryable: false, .. }));
    }
}
