use thiserror::Error;

use modelgrid_state::StateError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
