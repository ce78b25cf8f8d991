//! Classified incoming records produced by the scanner.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::DisplayAmount;
use crate::chain::BlockNumber;

/// A classified on-chain value movement. Immutable once classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingRecord {
    pub txid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
    pub bn: BlockNumber,
    pub core_type: String,
    pub coin_name: String,
    pub from_address: String,
    pub to_address: String,
    pub value: DisplayAmount,
    /// Output index within the transaction.
    pub n: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_memo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_results: Option<Vec<String>>,
    #[serde(default)]
    pub is_unexpected: bool,
    #[serde(default)]
    pub is_special: bool,
    #[serde(default)]
    pub is_internal: bool,
}

impl IncomingRecord {
    /// Dedup key: one order per `(coin, txid, n)`.
    pub fn key(&self) -> RecordKey {
        RecordKey {
            coin_name: self.coin_name.clone(),
            txid: self.txid.clone(),
            n: self.n,
        }
    }

    /// Classification, with internal taking priority over special, then unexpected.
    pub fn class(&self) -> RecordClass {
        if self.is_internal {
            RecordClass::Internal
        } else if self.is_special {
            RecordClass::Special
        } else if self.is_unexpected {
            RecordClass::Unexpected
        } else {
            RecordClass::Normal
        }
    }
}

/// Unique identity of an incoming record within a chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    pub coin_name: String,
    pub txid: String,
    pub n: u32,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.coin_name, self.txid, self.n)
    }
}

/// Record classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordClass {
    Normal,
    Unexpected,
    /// Hot/cold transfer, never a customer deposit.
    Internal,
    /// Needs manual review.
    Special,
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Unexpected => write!(f, "unexpected"),
            Self::Internal => write!(f, "internal"),
            Self::Special => write!(f, "special"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record() -> IncomingRecord {
        IncomingRecord {
            txid: "abc".to_string(),
            meta: None,
            bn: 100,
            core_type: "eth".to_string(),
            coin_name: "eth".to_string(),
            from_address: "ext1".to_string(),
            to_address: "dep1".to_string(),
            value: DisplayAmount::new(dec!(1.5)),
            n: 0,
            action: None,
            action_memo: None,
            action_results: None,
            is_unexpected: false,
            is_special: false,
            is_internal: false,
        }
    }

    #[test]
    fn test_class_priority() {
        let mut r = record();
        assert_eq!(r.class(), RecordClass::Normal);
        r.is_unexpected = true;
        assert_eq!(r.class(), RecordClass::Unexpected);
        r.is_special = true;
        assert_eq!(r.class(), RecordClass::Special);
        r.is_internal = true;
        assert_eq!(r.class(), RecordClass::Internal);
    }

    #[test]
    fn test_key_ignores_block() {
        let a = record();
        let mut b = record();
        b.bn = 105;
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().to_string(), "eth:abc:0");
    }

    #[test]
    fn test_camel_case_wire_names() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["coinName"], "eth");
        assert_eq!(json["fromAddress"], "ext1");
        assert_eq!(json["isInternal"], false);
    }
}
