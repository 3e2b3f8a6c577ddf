//! Errors raised by the record store.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Failures of the record store. Backend errors convert with `?`.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open database: {0}")]
    Open(#[from] redb::DatabaseError),

    #[error("cannot begin transaction: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("commit failed: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("table unavailable: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage failure: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("record encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },
}

impl StateError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }
}
