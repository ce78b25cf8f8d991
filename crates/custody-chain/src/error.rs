//! Chain adapter error types.

use thiserror::Error;

use custody_core::CoreError;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported operation: {0}")]
    NotSupported(String),

    #[error("Unknown coin: {0}")]
    UnknownCoin(String),

    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ChainError {
    /// Transient I/O: retry with backoff, do not advance the cursor.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }

    /// True when a broadcast may have reached the node; its outcome is unknown.
    #[must_use]
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub type ChainResult<T> = Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ChainError::Unreachable("rpc".into()).is_transient());
        assert!(ChainError::Timeout("rpc".into()).is_transient());
        assert!(!ChainError::Rejected("nonce".into()).is_transient());
        assert!(!ChainError::InsufficientFunds("fee".into()).is_transient());
        assert!(ChainError::Timeout("send".into()).is_outcome_unknown());
        assert!(!ChainError::Unreachable("send".into()).is_outcome_unknown());
    }
}
