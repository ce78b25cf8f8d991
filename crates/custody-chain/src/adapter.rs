//! Capability traits implemented once per chain.
//!
//! The reconciliation engine only talks to chains through these traits, so a
//! chain is added by registering another implementation under its key. Methods
//! return boxed futures to keep the traits object-safe (`Arc<dyn ChainAdapter>`).

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use custody_core::{
    AddressType, BizMode, BlockNumber, BlockResult, ChainIdentity, DelegationInfo,
    DelegationReward, DisplayAmount, IncomingRecord, Order, OrderInfo, OrderState,
    OrdersUpdateResult, RawAmount, SweepOrderResult, TxData, TxResult,
    UnstakingDelegationInfo, ValidationOutcome, ValidatorInfo,
};

use crate::error::ChainResult;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// How the adapter derives addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyMode {
    /// Derive from the private seed.
    Private,
    /// Derive from an extended public key (watch-only deployments).
    Public,
}

/// Parameters of an address derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRequest {
    pub path: String,
    /// `None` derives the hot main address.
    pub index: Option<u32>,
    pub coin_name: String,
    pub address_type: AddressType,
    pub biz_mode: BizMode,
}

/// Per-chain ledger capabilities.
pub trait ChainAdapter: Send + Sync {
    /// Chain identity.
    fn identity(&self) -> &ChainIdentity;

    /// Key material this adapter derives addresses from.
    fn key_mode(&self) -> KeyMode;

    /// Maximum number of orders per withdraw batch.
    fn get_send_orders_batch_count(&self, coin_name: &str) -> usize;

    /// Canonical textual form of an address (case, prefix).
    fn normalize_address(&self, address: &str) -> String {
        address.trim().to_string()
    }

    /// Reconnect if the node connection was lost.
    fn ensure_connected(&self) -> BoxFuture<'_, ChainResult<()>>;

    /// Current chain tip.
    fn get_block_number(&self) -> BoxFuture<'_, ChainResult<BlockNumber>>;

    fn get_block_result(&self, bn: BlockNumber) -> BoxFuture<'_, ChainResult<BlockResult>>;

    /// Transactions touching `address` from `from_bn` on.
    fn get_transaction_history<'a>(
        &'a self,
        address: &'a str,
        coin_name: &'a str,
        from_bn: BlockNumber,
    ) -> BoxFuture<'a, ChainResult<Vec<TxResult>>>;

    /// Balances per coin; all coins when `coin_names` is `None`.
    fn get_account_balances<'a>(
        &'a self,
        address: &'a str,
        coin_names: Option<&'a [String]>,
    ) -> BoxFuture<'a, ChainResult<BTreeMap<String, DisplayAmount>>>;

    /// Decimal-adjusted balance.
    fn get_balance<'a>(
        &'a self,
        address: &'a str,
        coin_name: &'a str,
    ) -> BoxFuture<'a, ChainResult<DisplayAmount>>;

    /// Spendable balance of the hot wallet; plain [`Self::get_balance`] unless
    /// the chain reserves part of it.
    fn get_wallet_balance<'a>(
        &'a self,
        hot_address: &'a str,
        coin_name: &'a str,
    ) -> BoxFuture<'a, ChainResult<DisplayAmount>> {
        self.get_balance(hot_address, coin_name)
    }

    /// Balance in raw base units.
    fn get_balance_no_decimal<'a>(
        &'a self,
        address: &'a str,
        coin_name: &'a str,
    ) -> BoxFuture<'a, ChainResult<RawAmount>>;

    /// Validation never fails outright; problems surface as `ValidationOutcome::Error`.
    fn validate_address<'a>(
        &'a self,
        address: &'a str,
        coin_name: &'a str,
    ) -> BoxFuture<'a, ValidationOutcome>;

    fn gen_address_by_priv_key<'a>(
        &'a self,
        seed: &'a [u8],
        req: &'a AddressRequest,
    ) -> BoxFuture<'a, ChainResult<String>>;

    fn gen_address_by_pub_key<'a>(
        &'a self,
        pub_key: &'a str,
        req: &'a AddressRequest,
    ) -> BoxFuture<'a, ChainResult<String>>;

    /// Broadcast the batch; adapters may split it over several transactions.
    fn withdraw<'a>(
        &'a self,
        coin_name: &'a str,
        orders: &'a [Order],
    ) -> BoxFuture<'a, ChainResult<Vec<OrdersUpdateResult>>>;

    /// Move `cap` from one deposit address to the hot wallet described by `output`.
    fn sweep_to_hot<'a>(
        &'a self,
        coin_name: &'a str,
        from_address: &'a str,
        cap: DisplayAmount,
        output: &'a Order,
    ) -> BoxFuture<'a, ChainResult<SweepOrderResult>>;

    /// Move `cap` from the hot wallet to the cold address in `output.to`.
    fn sweep_to_cold<'a>(
        &'a self,
        coin_name: &'a str,
        cap: DisplayAmount,
        output: &'a Order,
    ) -> BoxFuture<'a, ChainResult<SweepOrderResult>>;

    /// Generic contract call; method and params come from `order.action` / `order.action_args`.
    fn invoke_general<'a>(
        &'a self,
        coin_name: &'a str,
        order: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>>;

    /// Split `total` from one address across `targets` (`"address,n"` entries).
    fn scatter<'a>(
        &'a self,
        coin_name: &'a str,
        from_address: &'a str,
        total: DisplayAmount,
        targets: &'a [String],
        output: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>>;

    /// Fee for up to `max_order_count` orders sent from `from_address`, in the
    /// debited coin (zero when paid in another coin). `None` means fee funds are
    /// insufficient.
    fn estimate_and_check_fee<'a>(
        &'a self,
        coin_name: &'a str,
        biz_type: &'a str,
        from_address: &'a str,
        max_order_count: usize,
    ) -> BoxFuture<'a, ChainResult<Option<DisplayAmount>>>;

    fn get_order_state<'a>(
        &'a self,
        info: &'a OrderInfo,
        bn: BlockNumber,
    ) -> BoxFuture<'a, ChainResult<OrderState>>;

    fn get_transaction_state<'a>(
        &'a self,
        info: &'a OrderInfo,
        bn: BlockNumber,
    ) -> BoxFuture<'a, ChainResult<Option<TxData>>>;

    /// Decode raw block transactions into unclassified transfer records.
    fn filter_transactions<'a>(
        &'a self,
        txns: &'a [TxResult],
        bn: BlockNumber,
        has_scan_task: bool,
    ) -> BoxFuture<'a, ChainResult<Vec<IncomingRecord>>>;
}

/// Optional staking capabilities.
pub trait StakeHandler: Send + Sync {
    fn submit_delegation<'a>(
        &'a self,
        coin_name: &'a str,
        order: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>>;

    fn submit_un_delegation<'a>(
        &'a self,
        coin_name: &'a str,
        order: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>>;

    /// `order.action_args` carries `[src_validator, dst_validator]`.
    fn submit_re_delegation<'a>(
        &'a self,
        coin_name: &'a str,
        order: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>>;

    fn claim_reward<'a>(
        &'a self,
        coin_name: &'a str,
        order: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>>;

    fn set_reward_address<'a>(
        &'a self,
        coin_name: &'a str,
        order: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>>;

    fn get_validators(&self) -> BoxFuture<'_, ChainResult<Vec<ValidatorInfo>>>;

    fn get_validator<'a>(
        &'a self,
        validator: &'a str,
    ) -> BoxFuture<'a, ChainResult<Option<ValidatorInfo>>>;

    fn get_validator_outstanding_rewards<'a>(
        &'a self,
        validator: &'a str,
    ) -> BoxFuture<'a, ChainResult<DisplayAmount>>;

    fn get_delegations<'a>(
        &'a self,
        delegator: &'a str,
    ) -> BoxFuture<'a, ChainResult<Vec<DelegationInfo>>>;

    fn get_unstaking_delegations<'a>(
        &'a self,
        delegator: &'a str,
    ) -> BoxFuture<'a, ChainResult<Vec<UnstakingDelegationInfo>>>;

    fn get_reward_address<'a>(&'a self, delegator: &'a str) -> BoxFuture<'a, ChainResult<String>>;

    fn get_delegation_rewards<'a>(
        &'a self,
        delegator: &'a str,
    ) -> BoxFuture<'a, ChainResult<Vec<DelegationReward>>>;
}

/// Shared chain adapter.
pub type DynChainAdapter = Arc<dyn ChainAdapter>;

/// Shared stake handler.
pub type DynStakeHandler = Arc<dyn StakeHandler>;
