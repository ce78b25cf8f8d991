//! Error types for custody-core.

use thiserror::Error;

use crate::lifecycle::OrderStatus;
use crate::order::OrderId;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Amount {value} has more than {decimals} decimal places")]
    PrecisionLoss { value: String, decimals: u32 },

    #[error("Amount overflow: {0}")]
    AmountOverflow(String),

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),

    #[error("Order {order_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("Invalid address state change: {0}")]
    InvalidAddressState(String),

    #[error("Unknown biz mode: {0}")]
    UnknownBizMode(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
