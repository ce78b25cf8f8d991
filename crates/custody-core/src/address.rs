//! System-owned addresses and their business roles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// Business role of a system address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressRole {
    Hot,
    Cold,
    Deposit,
}

impl fmt::Display for AddressRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hot => write!(f, "hot"),
            Self::Cold => write!(f, "cold"),
            Self::Deposit => write!(f, "deposit"),
        }
    }
}

/// Lifecycle state of an issued address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressState {
    #[default]
    Active,
    Frozen,
    Retired,
}

impl fmt::Display for AddressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Frozen => write!(f, "frozen"),
            Self::Retired => write!(f, "retired"),
        }
    }
}

/// Business mode requested when issuing an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BizMode {
    #[default]
    Auto,
    Deposit,
    DepositMemo,
    Delegate,
    DelegateMemo,
    Normal,
}

impl BizMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Deposit => "deposit",
            Self::DepositMemo => "deposit_memo",
            Self::Delegate => "delegate",
            Self::DelegateMemo => "delegate_memo",
            Self::Normal => "normal",
        }
    }

    /// Memo modes share one address and distinguish owners by memo.
    pub fn uses_memo(&self) -> bool {
        matches!(self, Self::DepositMemo | Self::DelegateMemo)
    }
}

impl fmt::Display for BizMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BizMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "deposit" => Ok(Self::Deposit),
            "deposit_memo" => Ok(Self::DepositMemo),
            "delegate" => Ok(Self::Delegate),
            "delegate_memo" => Ok(Self::DelegateMemo),
            "normal" => Ok(Self::Normal),
            other => Err(CoreError::UnknownBizMode(other.to_string())),
        }
    }
}

/// Chain-specific address format selector (e.g. legacy vs segwit).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AddressType(pub u32);

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which system wallet an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemAddressKind {
    Hot,
    Cold,
}

impl From<SystemAddressKind> for AddressRole {
    fn from(kind: SystemAddressKind) -> Self {
        match kind {
            SystemAddressKind::Hot => Self::Hot,
            SystemAddressKind::Cold => Self::Cold,
        }
    }
}

/// An issued address.
///
/// Only `state` changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(rename = "type")]
    pub role: AddressRole,
    pub sub_type: String,
    pub address: String,
    pub state: AddressState,
}

impl Address {
    pub fn new(role: AddressRole, sub_type: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            role,
            sub_type: sub_type.into(),
            address: address.into(),
            state: AddressState::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == AddressState::Active
    }

    /// Change state. Retired is final.
    pub fn set_state(&mut self, next: AddressState) -> Result<()> {
        if self.state == AddressState::Retired && next != AddressState::Retired {
            return Err(CoreError::InvalidAddressState(format!(
                "{} is retired, cannot become {}",
                self.address, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Who an issued deposit address belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressOwner {
    pub appid: String,
    pub callback: String,
    pub biz_mode: BizMode,
}

/// Registry entry: the address plus ownership metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedAddress {
    pub address: Address,
    pub coin_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<AddressOwner>,
    /// Derivation index; `None` for hot main and configured cold addresses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retired_is_final() {
        let mut addr = Address::new(AddressRole::Deposit, "0", "addr1");
        addr.set_state(AddressState::Frozen).unwrap();
        addr.set_state(AddressState::Active).unwrap();
        addr.set_state(AddressState::Retired).unwrap();
        assert!(addr.set_state(AddressState::Active).is_err());
        assert_eq!(addr.state, AddressState::Retired);
    }

    #[test]
    fn test_biz_mode_round_trip_str() {
        for mode in [
            BizMode::Auto,
            BizMode::Deposit,
            BizMode::DepositMemo,
            BizMode::Delegate,
            BizMode::DelegateMemo,
            BizMode::Normal,
        ] {
            assert_eq!(mode.as_str().parse::<BizMode>().unwrap(), mode);
        }
        assert!("bogus".parse::<BizMode>().is_err());
    }

    #[test]
    fn test_address_serializes_type_field() {
        let addr = Address::new(AddressRole::Hot, "1", "hot1");
        let json = serde_json::to_value(&addr).unwrap();
        assert_eq!(json["type"], "hot");
        assert_eq!(json["subType"], "1");
        assert_eq!(json["state"], "active");
    }
}
