//! Scanner error types.

use thiserror::Error;

use custody_chain::ChainError;
use custody_reconciler::ReconcileError;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Scanning halted: {0}")]
    Halted(String),
}

impl ScanError {
    /// Transient chain I/O; the cursor was not advanced.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Chain(e) => e.is_transient(),
            Self::Reconcile(e) => e.is_transient(),
            Self::Halted(_) => false,
        }
    }
}

pub type ScanResult<T> = Result<T, ScanError>;
