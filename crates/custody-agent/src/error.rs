//! Application error types.

use thiserror::Error;

use custody_core::OrderId;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain error: {0}")]
    Chain(#[from] custody_chain::ChainError),

    #[error("Registry error: {0}")]
    Registry(#[from] custody_registry::RegistryError),

    #[error("Store error: {0}")]
    Store(#[from] custody_store::StoreError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] custody_reconciler::ReconcileError),

    #[error("Scan error: {0}")]
    Scan(#[from] custody_scanner::ScanError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] custody_scheduler::SchedulerError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] custody_telemetry::TelemetryError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("Coin {coin_name} is not configured on {chain}")]
    UnknownCoin { chain: String, coin_name: String },

    #[error("Order {0} not found")]
    UnknownOrder(OrderId),

    #[error("Method not exported: {0}")]
    MethodNotExported(String),

    #[error("Invalid params for {method}: {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("{failed} of {total} chain tasks failed")]
    ChainTasksFailed { failed: usize, total: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
