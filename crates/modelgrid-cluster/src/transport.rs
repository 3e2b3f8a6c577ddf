//! Point-to-point request/response between nodes.
//!
//! [`Transport`] is the seam the coordinator, workers, and the
//! reconciliation sweep talk through. [`LocalTransport`] routes requests to
//! handlers registered in the same process, encoding every message to JSON
//! and back on the way, and can cut individual nodes off to simulate
//! partitions.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use modelgrid_state::NodeId;

use crate::error::{ClusterError, ClusterResult};
use crate::protocol::{NodeRequest, NodeResponse};

/// Boxed, sendable future used at the transport seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Sends one request to one node and waits for its response.
pub trait Transport: Send + Sync {
    fn send(&self, node_id: &str, request: NodeRequest) -> BoxFuture<'static, ClusterResult<NodeResponse>>;
}

/// Serves requests addressed to one node.
pub trait NodeHandler: Send + Sync {
    fn handle(&self, request: NodeRequest) -> BoxFuture<'static, NodeResponse>;
}

#[derive(Default)]
struct Routes {
    handlers: HashMap<NodeId, Arc<dyn NodeHandler>>,
    disconnected: HashSet<NodeId>,
}

/// In-process transport with per-request timeouts.
#[derive(Clone)]
pub struct LocalTransport {
    routes: Arc<RwLock<Routes>>,
    timeout: Duration,
}

impl LocalTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            routes: Arc::new(RwLock::new(Routes::default())),
            timeout,
        }
    }

    /// Route requests for `node_id` to `handler`, replacing any previous one.
    pub fn register(&self, node_id: &str, handler: Arc<dyn NodeHandler>) {
        self.write_routes()
            .handlers
            .insert(node_id.to_string(), handler);
        debug!(%node_id, "transport route registered");
    }

    pub fn deregister(&self, node_id: &str) -> bool {
        self.write_routes().handlers.remove(node_id).is_some()
    }

    /// Make `node_id` unreachable until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self, node_id: &str) {
        self.write_routes().disconnected.insert(node_id.to_string());
        warn!(%node_id, "transport route disconnected");
    }

    pub fn reconnect(&self, node_id: &str) {
        self.write_routes().disconnected.remove(node_id);
        debug!(%node_id, "transport route reconnected");
    }

    fn handler_for(&self, node_id: &str) -> Option<Arc<dyn NodeHandler>> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        if routes.disconnected.contains(node_id) {
            return None;
        }
        routes.handlers.get(node_id).cloned()
    }

    fn write_routes(&self) -> std::sync::RwLockWriteGuard<'_, Routes> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for LocalTransport {
    fn send(&self, node_id: &str, request: NodeRequest) -> BoxFuture<'static, ClusterResult<NodeResponse>> {
        let handler = self.handler_for(node_id);
        let node_id = node_id.to_string();
        let timeout = self.timeout;

        Box::pin(async move {
            let Some(handler) = handler else {
                return Err(ClusterError::Unreachable(node_id));
            };
            let kind = request.kind();
            let request = round_trip(&request)?;

            let response = tokio::time::timeout(timeout, handler.handle(request))
                .await
                .map_err(|_| ClusterError::Timeout {
                    node_id: node_id.clone(),
                    after: timeout,
                })?;
            debug!(%node_id, kind, "request served");
            round_trip(&response)
        })
    }
}

/// Encode and decode a message as it would travel over the wire.
fn round_trip<T>(message: &T) -> ClusterResult<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let bytes = serde_json::to_vec(message).map_err(|e| ClusterError::Codec(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| ClusterError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NodeStateReport;

    struct Echo {
        node_id: String,
    }

    impl NodeHandler for Echo {
        fn handle(&self, request: NodeRequest) -> BoxFuture<'static, NodeResponse> {
            let node_id = self.node_id.clone();
            Box::pin(async move {
                match request {
                    NodeRequest::ReportState => NodeResponse::State(NodeStateReport {
                        node_id,
                        ..Default::default()
                    }),
                    _ => NodeResponse::Accepted,
                }
            })
        }
    }

    struct Stall;

    impl NodeHandler for Stall {
        fn handle(&self, _request: NodeRequest) -> BoxFuture<'static, NodeResponse> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                NodeResponse::Accepted
            })
        }
    }

    #[tokio::test]
    async fn routes_to_registered_handler() {
        let transport = LocalTransport::new(Duration::from_secs(1));
        transport.register("a", Arc::new(Echo { node_id: "a".into() }));

        let resp = transport.send("a", NodeRequest::ReportState).await.unwrap();
        match resp {
            NodeResponse::State(report) => assert_eq!(report.node_id, "a"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_and_disconnected_nodes_are_unreachable() {
        let transport = LocalTransport::new(Duration::from_secs(1));
        transport.register("a", Arc::new(Echo { node_id: "a".into() }));

        assert!(matches!(
            transport.send("zz", NodeRequest::ReportState).await,
            Err(ClusterError::Unreachable(id)) if id == "zz"
        ));

        transport.disconnect("a");
        assert!(transport.send("a", NodeRequest::ReportState).await.is_err());

        transport.reconnect("a");
        assert!(transport.send("a", NodeRequest::ReportState).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let transport = LocalTransport::new(Duration::from_millis(50));
        transport.register("slow", Arc::new(Stall));

        let err = transport
            .send("slow", NodeRequest::ReportState)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Timeout { .. }));
    }

    #[tokio::test]
    async fn deregister_removes_route() {
        let transport = LocalTransport::new(Duration::from_secs(1));
        transport.register("a", Arc::new(Echo { node_id: "a".into() }));
        assert!(transport.deregister("a"));
        assert!(!transport.deregister("a"));
        assert!(transport.send("a", NodeRequest::ReportState).await.is_err());
    }
}
