//! Chain identity and raw chain payload types.
//!
//! These mirror what a chain adapter hands back from a node: block results,
//! transaction references and decoded transaction data.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::DisplayAmount;

/// Block height on a chain.
pub type BlockNumber = u64;

/// Error code reported when address validation itself fails.
pub const DEFAULT_VALIDATION_ERROR_CODE: u32 = 20003;

/// Stable key selecting a chain at startup (e.g. `"eth"`, `"btc"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainKey(String);

impl ChainKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for ChainKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identity of a chain client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainIdentity {
    /// Startup selection key.
    pub key: ChainKey,
    /// Human-readable chain name.
    pub name: String,
    /// Numeric index (e.g. BIP-44 coin type).
    pub index: u32,
    /// Core coin type handled by the default handler.
    pub core_type: String,
}

/// Transaction reference returned by a broadcast or found in a block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxResult {
    pub txid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
}

impl TxResult {
    pub fn new(txid: impl Into<String>) -> Self {
        Self {
            txid: txid.into(),
            meta: None,
        }
    }
}

/// Either a bare transaction hash or a full transaction result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TxRef {
    Hash(String),
    Result(TxResult),
}

impl TxRef {
    pub fn txid(&self) -> &str {
        match self {
            Self::Hash(h) => h,
            Self::Result(r) => &r.txid,
        }
    }
}

impl From<TxResult> for TxRef {
    fn from(r: TxResult) -> Self {
        Self::Result(r)
    }
}

/// One block as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResult {
    pub hash: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub txns: Vec<TxResult>,
}

/// Input or output leg of a decoded transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEndpoint {
    pub address: String,
    pub value: DisplayAmount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
}

/// Decoded transaction data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxData {
    #[serde(rename = "type")]
    pub tx_type: String,
    pub hash: String,
    pub block_hash: String,
    pub fee: DisplayAmount,
    pub block_number: BlockNumber,
    pub confirmations: u64,
    pub from: Vec<TxEndpoint>,
    pub to: Vec<TxEndpoint>,
}

/// What the adapter needs to look up an order on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderInfo {
    pub txid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
    pub coin_name: String,
    pub n: u32,
    pub from: String,
    pub to: String,
    pub value: DisplayAmount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockNumber>,
}

/// Result of validating an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "outcome", content = "code")]
pub enum ValidationOutcome {
    Valid,
    Invalid,
    /// Validation could not be performed; carries an error code.
    Error(u32),
}

impl ValidationOutcome {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Maps the adapter's numeric convention: 1 valid, 0 invalid, anything else an error code.
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Valid,
            0 => Self::Invalid,
            other => Self::Error(other),
        }
    }
}

impl From<bool> for ValidationOutcome {
    fn from(valid: bool) -> Self {
        if valid {
            Self::Valid
        } else {
            Self::Invalid
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_key_lowercases() {
        assert_eq!(ChainKey::new("ETH").as_str(), "eth");
    }

    #[test]
    fn test_tx_ref_untagged() {
        let refs: Vec<TxRef> =
            serde_json::from_str(r#"["0xabc", {"txid": "0xdef", "meta": "m"}]"#).unwrap();
        assert_eq!(refs[0].txid(), "0xabc");
        assert_eq!(refs[1].txid(), "0xdef");
    }

    #[test]
    fn test_validation_outcome_codes() {
        assert_eq!(ValidationOutcome::from_code(1), ValidationOutcome::Valid);
        assert_eq!(ValidationOutcome::from_code(0), ValidationOutcome::Invalid);
        assert_eq!(
            ValidationOutcome::from_code(DEFAULT_VALIDATION_ERROR_CODE),
            ValidationOutcome::Error(20003)
        );
    }
}
