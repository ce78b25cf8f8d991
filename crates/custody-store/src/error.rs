//! Store error types.

use thiserror::Error;

use custody_core::{CoreError, OrderId, RecordKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Order {0} already exists")]
    DuplicateOrder(OrderId),

    #[error("Record {key} already mapped to order {existing}")]
    DuplicateRecord { key: RecordKey, existing: OrderId },

    #[error("Order {0} not found")]
    UnknownOrder(OrderId),

    #[error("Unsupported snapshot version {0}")]
    SnapshotVersion(u32),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type StoreResult<T> = Result<T, StoreError>;
