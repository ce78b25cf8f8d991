//! Reconciler error types.

use thiserror::Error;

use custody_chain::ChainError;
use custody_core::{CoreError, OrderId};
use custody_store::StoreError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Order {0} not found")]
    UnknownOrder(OrderId),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Chain {0} has no stake handler")]
    NoStakeHandler(String),
}

impl ReconcileError {
    /// Transient chain I/O; the caller retries on the next round.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Chain(e) if e.is_transient())
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
