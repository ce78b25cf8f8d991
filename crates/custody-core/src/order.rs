//! Order identifiers and order payloads.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::DisplayAmount;

/// Order identifier, unique per chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for OrderId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// What an order moves value for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Observed incoming transfer to a deposit address.
    Deposit,
    /// Observed outgoing transfer from a system address that no order issued.
    External,
    Withdraw,
    SweepToHot,
    SweepToCold,
    Scatter,
    /// Generic contract invocation.
    Invoke,
    Delegate,
    Undelegate,
    Redelegate,
    ClaimReward,
    SetRewardAddress,
}

impl OrderKind {
    /// Business type string passed to fee estimation.
    pub fn biz_type(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::External => "external",
            Self::Withdraw => "withdraw",
            Self::SweepToHot => "sweep",
            Self::SweepToCold => "sweep_cold",
            Self::Scatter => "scatter",
            Self::Invoke => "invoke",
            Self::Delegate => "delegate",
            Self::Undelegate => "undelegate",
            Self::Redelegate => "redelegate",
            Self::ClaimReward => "claim_reward",
            Self::SetRewardAddress => "set_reward_address",
        }
    }

    /// True for orders the system broadcasts itself.
    pub fn is_outgoing(&self) -> bool {
        !matches!(self, Self::Deposit | Self::External)
    }

    /// Address-batched kinds lock the source address rather than the order.
    pub fn locks_source_address(&self) -> bool {
        matches!(self, Self::SweepToHot | Self::Scatter)
    }

    pub fn is_stake(&self) -> bool {
        matches!(
            self,
            Self::Delegate
                | Self::Undelegate
                | Self::Redelegate
                | Self::ClaimReward
                | Self::SetRewardAddress
        )
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.biz_type())
    }
}

/// A unit of intended value movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub from: String,
    pub to: String,
    pub value: DisplayAmount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_memo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

impl Order {
    #[must_use]
    pub fn new(
        id: OrderId,
        from: impl Into<String>,
        to: impl Into<String>,
        value: DisplayAmount,
    ) -> Self {
        Self {
            id,
            from: from.into(),
            to: to.into(),
            value,
            action: None,
            action_args: None,
            action_memo: None,
            auth: None,
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>, args: Vec<String>) -> Self {
        self.action = Some(action.into());
        self.action_args = Some(args);
        self
    }

    #[must_use]
    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.action_memo = Some(memo.into());
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_json_shape() {
        let order = Order::new(OrderId(1), "hot1", "userA", DisplayAmount::new(dec!(10)))
            .with_memo("m-1");
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["value"], "10");
        assert_eq!(json["actionMemo"], "m-1");
        assert!(json.get("auth").is_none());
    }

    #[test]
    fn test_kind_flags() {
        assert!(!OrderKind::Deposit.is_outgoing());
        assert!(!OrderKind::External.is_outgoing());
        assert!(OrderKind::Withdraw.is_outgoing());
        assert!(OrderKind::SweepToHot.locks_source_address());
        assert!(!OrderKind::Withdraw.locks_source_address());
        assert!(OrderKind::ClaimReward.is_stake());
    }
}
