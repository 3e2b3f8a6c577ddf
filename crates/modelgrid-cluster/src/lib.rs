//! modelgrid-cluster — cluster plumbing for ModelGrid.
//!
//! Provides membership tracking with leader election, the node-to-node
//! message protocol, and the transport that carries it.
//!
//! # Architecture
//!
//! ```text
//! MembershipManager (shared table)
//!   ├── join / heartbeat / leave / reap_dead_nodes
//!   ├── leader = lowest live node with the cluster_manager role
//!   └── broadcast: NodeJoined, NodeLeft, LeaderChanged
//!
//! ClusterView (one per node) ── implements Membership
//!
//! Transport
//!   └── LocalTransport
//!       ├── routes NodeRequest → NodeHandler by node ID
//!       ├── JSON-encodes each message in transit
//!       └── per-request timeout, per-node disconnect
//! ```

pub mod error;
pub mod membership;
pub mod protocol;
pub mod transport;

pub use error::{ClusterError, ClusterResult};
pub use membership::{
    ClusterView, LEADER_ROLE, Member, MemberStatus, Membership, MembershipEvent,
    MembershipManager,
};
pub use protocol::{
    Correction, DeployCommand, DeployDone, NodeRequest, NodeResponse, NodeStateReport,
    UndeployCommand,
};
pub use transport::{BoxFuture, LocalTransport, NodeHandler, Transport};
