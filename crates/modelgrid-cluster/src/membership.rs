//! Membership manager — tracks cluster nodes and the elected leader.
//!
//! Nodes join with their [`NodeRecord`], keep themselves alive with
//! heartbeats, and are reaped once they stay silent past the dead timeout.
//! The leader is the lowest live node ID that carries the leader role.
//! Every change is published on a broadcast channel so background services
//! can follow joins, departures, and leadership moves.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use modelgrid_core::epoch_millis;
use modelgrid_state::{NodeId, NodeRecord};

/// Role that makes a node a leader candidate.
pub const LEADER_ROLE: &str = "cluster_manager";

/// Status of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Ready,
    Dead,
}

/// In-memory view of a cluster member.
#[derive(Debug, Clone)]
pub struct Member {
    pub record: NodeRecord,
    pub status: MemberStatus,
    /// Unix millis of the last heartbeat.
    pub last_heartbeat: u64,
}

/// Membership change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeJoined(NodeId),
    NodeLeft(NodeId),
    LeaderChanged(Option<NodeId>),
}

/// Read access to cluster membership from one node's point of view.
pub trait Membership: Send + Sync {
    /// ID of the node this view belongs to.
    fn local_node_id(&self) -> NodeId;

    /// Live members, ordered by ID.
    fn list_nodes(&self) -> Vec<NodeRecord>;

    /// Whether the local node currently holds leadership.
    fn is_leader(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

struct Entry {
    record: NodeRecord,
    last_heartbeat: u64,
}

struct Inner {
    members: RwLock<BTreeMap<NodeId, Entry>>,
    leader: RwLock<Option<NodeId>>,
    events: broadcast::Sender<MembershipEvent>,
}

/// Manages cluster membership state.
///
/// Cheap to clone; all clones share the same member table.
#[derive(Clone)]
pub struct MembershipManager {
    inner: Arc<Inner>,
    /// Dead node detection threshold.
    dead_timeout: Duration,
}

impl MembershipManager {
    /// Create an empty membership table.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                members: RwLock::new(BTreeMap::new()),
                leader: RwLock::new(None),
                events,
            }),
            dead_timeout: Duration::from_secs(30),
        }
    }

    /// Set the dead node detection timeout.
    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    /// A [`Membership`] view for one local node.
    pub fn view(&self, local_node_id: &str) -> ClusterView {
        ClusterView {
            manager: self.clone(),
            local: local_node_id.to_string(),
        }
    }

    /// Register (or refresh) a node. Returns true if the node is new.
    pub fn join(&self, record: NodeRecord) -> bool {
        let node_id = record.id.clone();
        let is_new = {
            let mut members = self.write_members();
            members
                .insert(
                    node_id.clone(),
                    Entry {
                        record,
                        last_heartbeat: epoch_millis(),
                    },
                )
                .is_none()
        };
        if is_new {
            info!(%node_id, "node joined cluster");
            let _ = self.inner.events.send(MembershipEvent::NodeJoined(node_id));
        }
        self.recompute_leader();
        is_new
    }

    /// Record a heartbeat. Returns false for unknown nodes.
    pub fn heartbeat(&self, node_id: &str) -> bool {
        let mut members = self.write_members();
        match members.get_mut(node_id) {
            Some(entry) => {
                entry.last_heartbeat = epoch_millis();
                debug!(%node_id, "heartbeat received");
                true
            }
            None => {
                warn!(%node_id, "heartbeat from unknown node");
                false
            }
        }
    }

    /// Remove a node from the cluster.
    pub fn leave(&self, node_id: &str) -> bool {
        let existed = self.write_members().remove(node_id).is_some();
        if existed {
            info!(%node_id, "node left cluster");
            let _ = self
                .inner
                .events
                .send(MembershipEvent::NodeLeft(node_id.to_string()));
            self.recompute_leader();
        }
        existed
    }

    /// List all current members with their status.
    pub fn list_members(&self) -> Vec<Member> {
        self.list_members_at(epoch_millis())
    }

    fn list_members_at(&self, now: u64) -> Vec<Member> {
        let dead_after = self.dead_timeout.as_millis() as u64;
        self.read_members()
            .values()
            .map(|entry| Member {
                record: entry.record.clone(),
                status: if now.saturating_sub(entry.last_heartbeat) > dead_after {
                    MemberStatus::Dead
                } else {
                    MemberStatus::Ready
                },
                last_heartbeat: entry.last_heartbeat,
            })
            .collect()
    }

    /// Records of members still considered alive.
    pub fn ready_nodes(&self) -> Vec<NodeRecord> {
        self.list_members()
            .into_iter()
            .filter(|m| m.status == MemberStatus::Ready)
            .map(|m| m.record)
            .collect()
    }

    /// Detect and remove dead nodes.
    ///
    /// Returns the IDs of nodes that were removed.
    pub fn reap_dead_nodes(&self) -> Vec<NodeId> {
        self.reap_dead_nodes_at(epoch_millis())
    }

    /// Same as [`reap_dead_nodes`](Self::reap_dead_nodes) against an explicit clock.
    pub fn reap_dead_nodes_at(&self, now: u64) -> Vec<NodeId> {
        let dead: Vec<NodeId> = self
            .list_members_at(now)
            .into_iter()
            .filter(|m| m.status == MemberStatus::Dead)
            .map(|m| m.record.id)
            .collect();
        for node_id in &dead {
            warn!(%node_id, "reaping dead node");
            self.leave(node_id);
        }
        dead
    }

    /// Current leader, if any live node carries the leader role.
    pub fn leader(&self) -> Option<NodeId> {
        self.inner
            .leader
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.inner.events.subscribe()
    }

    fn recompute_leader(&self) {
        let elected = self
            .read_members()
            .values()
            .find(|entry| entry.record.has_role(LEADER_ROLE))
            .map(|entry| entry.record.id.clone());

        let mut leader = self
            .inner
            .leader
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *leader != elected {
            info!(leader = ?elected, previous = ?*leader, "cluster leader changed");
            *leader = elected.clone();
            let _ = self.inner.events.send(MembershipEvent::LeaderChanged(elected));
        }
    }

    fn read_members(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<NodeId, Entry>> {
        self.inner
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_members(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<NodeId, Entry>> {
        self.inner
            .members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MembershipManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Membership as seen from one local node.
#[derive(Clone)]
pub struct ClusterView {
    manager: MembershipManager,
    local: NodeId,
}

impl ClusterView {
    pub fn manager(&self) -> &MembershipManager {
        &self.manager
    }
}

impl Membership for ClusterView {
    fn local_node_id(&self) -> NodeId {
        self.local.clone()
    }

    fn list_nodes(&self) -> Vec<NodeRecord> {
        self.manager.ready_nodes()
    }

    fn is_leader(&self) -> bool {
        self.manager.leader().as_deref() == Some(self.local.as_str())
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.manager.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_node(id: &str) -> NodeRecord {
        NodeRecord::new(id, &format!("{id}-name"), &[LEADER_ROLE, "data"])
    }

    fn data_node(id: &str) -> NodeRecord {
        NodeRecord::new(id, &format!("{id}-name"), &["data"])
    }

    #[test]
    fn join_registers_node() {
        let mgr = MembershipManager::new();
        assert!(mgr.join(data_node("a")));
        assert!(!mgr.join(data_node("a")));

        let members = mgr.list_members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].status, MemberStatus::Ready);
        assert_eq!(members[0].record.name, "a-name");
    }

    #[test]
    fn heartbeat_unknown_node_returns_false() {
        let mgr = MembershipManager::new();
        assert!(!mgr.heartbeat("ghost"));
        mgr.join(data_node("a"));
        assert!(mgr.heartbeat("a"));
    }

    #[test]
    fn leave_removes_node() {
        let mgr = MembershipManager::new();
        mgr.join(data_node("a"));
        assert!(mgr.leave("a"));
        assert!(!mgr.leave("a"));
        assert!(mgr.ready_nodes().is_empty());
    }

    #[test]
    fn leader_is_lowest_manager_id() {
        let mgr = MembershipManager::new();
        mgr.join(data_node("a"));
        assert_eq!(mgr.leader(), None);

        mgr.join(manager_node("c"));
        mgr.join(manager_node("b"));
        assert_eq!(mgr.leader().as_deref(), Some("b"));
        assert!(mgr.view("b").is_leader());
        assert!(!mgr.view("c").is_leader());

        mgr.leave("b");
        assert_eq!(mgr.leader().as_deref(), Some("c"));
    }

    #[test]
    fn events_follow_changes() {
        let mgr = MembershipManager::new();
        let mut rx = mgr.subscribe();

        mgr.join(manager_node("a"));
        mgr.leave("a");

        assert_eq!(rx.try_recv().unwrap(), MembershipEvent::NodeJoined("a".into()));
        assert_eq!(
            rx.try_recv().unwrap(),
            MembershipEvent::LeaderChanged(Some("a".into()))
        );
        assert_eq!(rx.try_recv().unwrap(), MembershipEvent::NodeLeft("a".into()));
        assert_eq!(rx.try_recv().unwrap(), MembershipEvent::LeaderChanged(None));
    }

    #[test]
    fn reap_dead_nodes() {
        let mgr = MembershipManager::new().with_dead_timeout(Duration::from_secs(30));
        mgr.join(manager_node("a"));
        mgr.join(data_node("b"));

        // Nobody is dead yet.
        assert!(mgr.reap_dead_nodes().is_empty());

        // One minute later both are silent.
        let later = epoch_millis() + 60_000;
        let reaped = mgr.reap_dead_nodes_at(later);
        assert_eq!(reaped, vec!["a".to_string(), "b".to_string()]);
        assert!(mgr.list_members().is_empty());
        assert_eq!(mgr.leader(), None);
    }

    #[test]
    fn view_lists_live_nodes_in_id_order() {
        let mgr = MembershipManager::new();
        mgr.join(data_node("c"));
        mgr.join(data_node("a"));
        let view = mgr.view("a");

        let ids: Vec<NodeId> = view.list_nodes().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(view.local_node_id(), "a");
    }
}
