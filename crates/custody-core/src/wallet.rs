use serde::{Deserialize, Serialize};

use crate::amount::DisplayAmount;

/// Balance report for a system wallet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletStatus {
    pub balance: DisplayAmount,
    pub balance_available: DisplayAmount,
    /// Value of outgoing orders currently in flight.
    pub balance_unavailable: DisplayAmount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_frozen: Option<DisplayAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_unfreezing: Option<DisplayAmount>,
}

impl WalletStatus {
    /// Build a status from the on-chain balance and the in-flight total.
    #[must_use]
    pub fn from_balance(balance: DisplayAmount, unavailable: DisplayAmount) -> Self {
        Self {
            balance,
            balance_available: balance.saturating_sub(unavailable),
            balance_unavailable: unavailable,
            balance_frozen: None,
            balance_unfreezing: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_available_never_negative() {
        let st = WalletStatus::from_balance(
            DisplayAmount::new(dec!(5)),
            DisplayAmount::new(dec!(7.5)),
        );
        assert_eq!(st.balance_available, DisplayAmount::ZERO);
        assert_eq!(st.balance_unavailable.inner(), dec!(7.5));
    }
}
