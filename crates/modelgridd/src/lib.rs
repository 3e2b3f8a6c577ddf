//! modelgridd — the ModelGrid daemon.
//!
//! Assembles the workspace crates into a running cluster:
//! - State store (redb)
//! - Membership + in-process transport
//! - Per node: task registry, deploy executor, coordinator, node service
//! - Per node: leader-gated reconcile service
//!
//! The binary in `main.rs` adds the CLI, logging, signal handling and the
//! dead-node reaper on top of [`LocalCluster`].

pub mod cluster;
pub mod logging;

pub use cluster::{ClusterNode, LocalCluster, node_record};
