//! redb table definitions for the ModelGrid record store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Artifact records keyed by `{artifact_id}`.
pub const ARTIFACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("artifacts");

/// Deployment tasks keyed by `{task_id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Store bookkeeping (id sequences) keyed by name.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key of the task id sequence in [`META`].
pub const TASK_SEQUENCE: &str = "task_seq";
