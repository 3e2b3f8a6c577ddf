//! modelgrid-state — durable record store for ModelGrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds the authoritative artifact
//! records and the deployment task history.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns and
//! keyed by their ID. Writes are partial patches applied inside a single
//! write transaction; each record carries a version so concurrent writers
//! can detect that they computed a patch from a stale copy. Task IDs come
//! from a durable sequence in the `meta` table.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks and across in-process nodes.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{BatchOutcome, StateStore};
pub use types::*;
