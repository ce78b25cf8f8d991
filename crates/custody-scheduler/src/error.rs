//! Scheduler error types.

use thiserror::Error;

use custody_reconciler::ReconcileError;
use custody_scanner::ScanError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Ruler data error: {0}")]
    Ruler(#[from] serde_json::Error),

    #[error("Ruler data version {found} is newer than supported {supported}")]
    RulerVersion { found: u32, supported: u32 },
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
