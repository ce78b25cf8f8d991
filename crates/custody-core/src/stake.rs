//! Staking query types returned by stake handlers.

use serde::{Deserialize, Serialize};

use crate::amount::{DisplayAmount, RawAmount};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidatorStatus {
    Unstaked,
    Unstaking,
    Staked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commission {
    pub rate: DisplayAmount,
    pub max_rate: DisplayAmount,
    pub max_change_rate: DisplayAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorInfo {
    pub operator_address: String,
    pub moniker: String,
    pub jailed: bool,
    pub status: ValidatorStatus,
    pub tokens: DisplayAmount,
    pub commission: Commission,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationInfo {
    pub delegator_address: String,
    pub validator_address: String,
    pub amount: DisplayAmount,
}

/// Reward accrued with one validator, in the chain's denomination and in
/// the ledger coin it settles as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationReward {
    pub validator_address: String,
    /// Denomination name on chain.
    pub native_name: String,
    pub native_amount: RawAmount,
    pub coin_name: String,
    pub amount: DisplayAmount,
}

impl DelegationReward {
    /// Build from the on-chain amount; the display amount is derived exactly.
    pub fn from_native(
        validator_address: impl Into<String>,
        native_name: impl Into<String>,
        native_amount: RawAmount,
        coin_name: impl Into<String>,
        decimals: u32,
    ) -> Result<Self> {
        Ok(Self {
            validator_address: validator_address.into(),
            native_name: native_name.into(),
            amount: native_amount.to_display(decimals)?,
            native_amount,
            coin_name: coin_name.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnstakingDelegationEntry {
    pub creation_height: u64,
    /// Unix seconds.
    pub completion_time: i64,
    /// Amount when the undelegation started; slashing can shrink the rest.
    pub initial_native_amount: RawAmount,
    pub native_amount: RawAmount,
    pub initial_amount: DisplayAmount,
    pub amount: DisplayAmount,
}

impl UnstakingDelegationEntry {
    pub fn from_native(
        creation_height: u64,
        completion_time: i64,
        initial_native_amount: RawAmount,
        native_amount: RawAmount,
        decimals: u32,
    ) -> Result<Self> {
        Ok(Self {
            creation_height,
            completion_time,
            initial_amount: initial_native_amount.to_display(decimals)?,
            amount: native_amount.to_display(decimals)?,
            initial_native_amount,
            native_amount,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnstakingDelegationInfo {
    pub delegator_address: String,
    pub validator_address: String,
    pub entries: Vec<UnstakingDelegationEntry>,
}

impl UnstakingDelegationInfo {
    /// Sum of every pending entry.
    #[must_use]
    pub fn total(&self) -> DisplayAmount {
        self.entries.iter().map(|e| e.amount).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reward_carries_both_denominations() {
        let reward =
            DelegationReward::from_native("val1", "uatom", RawAmount::new(1_500_000), "atom", 6)
                .unwrap();
        assert_eq!(reward.native_name, "uatom");
        assert_eq!(reward.coin_name, "atom");
        assert_eq!(reward.amount, DisplayAmount::new(dec!(1.5)));

        let json = serde_json::to_value(&reward).unwrap();
        assert_eq!(json["nativeAmount"], "1500000");
        assert_eq!(json["coinName"], "atom");
    }

    #[test]
    fn test_unstaking_total_uses_current_amount() {
        let info = UnstakingDelegationInfo {
            delegator_address: "del1".to_string(),
            validator_address: "val1".to_string(),
            entries: vec![
                UnstakingDelegationEntry::from_native(10, 600, RawAmount::new(300), RawAmount::new(250), 2)
                    .unwrap(),
                UnstakingDelegationEntry::from_native(12, 620, RawAmount::new(100), RawAmount::new(100), 2)
                    .unwrap(),
            ],
        };
        assert_eq!(info.entries[0].initial_amount, DisplayAmount::new(dec!(3)));
        assert_eq!(info.total(), DisplayAmount::new(dec!(3.5)));
        assert!(
            UnstakingDelegationEntry::from_native(1, 1, RawAmount::new(1), RawAmount::new(1), 40).is_err()
        );
    }
}
