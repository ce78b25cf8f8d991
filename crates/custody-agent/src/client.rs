//! Host-facing ledger client for one chain.
//!
//! Wraps the reconciler, scanner and registry of a chain behind the
//! operations a host application calls: address issuance, system addresses,
//! wallet status, order creation and ad-hoc scans. Hosts reaching in through
//! [`LedgerClient::invoke`] are limited to [`EXPORTED_METHODS`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use custody_chain::{AddressRequest, BoxFuture, DynChainAdapter, KeyMode};
use custody_core::{
    Address, AddressOwner, AddressRole, AddressType, BizMode, BlockNumber, ChainIdentity,
    DisplayAmount, IssuedAddress, OrderId, RawAmount, SystemAddressKind, TrackedOrder, TxData,
    TxResult, ValidationOutcome, WalletStatus,
};
use custody_reconciler::{OrderReconciler, StakeCoordinator};
use custody_registry::{AddressRegistry, RegistryError, SeedVault, SystemAddressCache};
use custody_scanner::Scanner;
use custody_telemetry::Metrics;

use crate::config::ChainConfig;
use crate::error::{AppError, AppResult};

/// Methods a host may call through [`LedgerClient::invoke`].
pub const EXPORTED_METHODS: &[&str] = &[
    "createAddress",
    "normalizeAddress",
    "validateAddress",
    "getSystemAddress",
    "getWalletStatus",
    "getWalletBalance",
    "getAccountBalances",
    "withdraw",
    "sweepToCold",
    "getOrder",
    "getTxDataByOrder",
    "getValidators",
    "getDelegations",
    "submitDelegation",
    "claimReward",
];

/// Business hooks around client initialization.
pub trait ClientHooks: Send + Sync {
    /// Runs once per coin after [`LedgerClient::init_from_seed`].
    fn initialize_post_hook<'a>(&'a self, _coin_name: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopClientHooks;

impl ClientHooks for NoopClientHooks {}

// ============================================================================
// Invoke params
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAddressParams {
    callback: String,
    coin_name: String,
    appid: String,
    #[serde(default)]
    biz_mode: BizMode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressParams {
    coin_name: String,
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoinParams {
    coin_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemAddressParams {
    coin_name: String,
    kind: SystemAddressKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalancesParams {
    address: String,
    #[serde(default)]
    coin_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WithdrawParams {
    coin_name: String,
    to: String,
    value: DisplayAmount,
    #[serde(default)]
    memo: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SweepParams {
    coin_name: String,
    value: DisplayAmount,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderParams {
    order_id: OrderId,
    #[serde(default)]
    bn: Option<BlockNumber>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegatorParams {
    delegator: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegationParams {
    coin_name: String,
    delegator: String,
    validator: String,
    #[serde(default)]
    value: DisplayAmount,
}

fn params<T: DeserializeOwned>(method: &str, params: Value) -> AppResult<T> {
    serde_json::from_value(params).map_err(|e| AppError::InvalidParams {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

// ============================================================================
// LedgerClient
// ============================================================================

pub struct LedgerClient {
    identity: ChainIdentity,
    coins: Vec<String>,
    derivation_path: String,
    cold_addresses: BTreeMap<String, String>,
    reconciler: Arc<OrderReconciler>,
    scanner: Arc<Scanner>,
    stake: StakeCoordinator,
    system_cache: SystemAddressCache,
    system_data: RwLock<BTreeMap<String, Zeroizing<String>>>,
    vault: RwLock<SeedVault>,
    hooks: Arc<dyn ClientHooks>,
}

impl std::fmt::Debug for LedgerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerClient")
            .field("chain", &self.identity.key)
            .field("coins", &self.coins)
            .field("vault", &*self.vault.read())
            .finish_non_exhaustive()
    }
}

impl LedgerClient {
    pub fn new(config: &ChainConfig, reconciler: Arc<OrderReconciler>, scanner: Arc<Scanner>) -> Self {
        Self {
            identity: reconciler.handlers().identity().clone(),
            coins: config.coin_names(),
            derivation_path: config.derivation_path.clone(),
            cold_addresses: config.cold_addresses.clone(),
            stake: StakeCoordinator::new(reconciler.clone()),
            reconciler,
            scanner,
            system_cache: SystemAddressCache::new(),
            system_data: RwLock::new(BTreeMap::new()),
            vault: RwLock::new(SeedVault::empty()),
            hooks: Arc::new(NoopClientHooks),
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn ClientHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn identity(&self) -> &ChainIdentity {
        &self.identity
    }

    pub fn coins(&self) -> &[String] {
        &self.coins
    }

    pub fn reconciler(&self) -> &Arc<OrderReconciler> {
        &self.reconciler
    }

    pub fn scanner(&self) -> &Arc<Scanner> {
        &self.scanner
    }

    pub fn stake(&self) -> &StakeCoordinator {
        &self.stake
    }

    pub fn registry(&self) -> &Arc<AddressRegistry> {
        self.reconciler.registry()
    }

    pub fn export_methods(&self) -> &'static [&'static str] {
        EXPORTED_METHODS
    }

    fn ensure_coin(&self, coin_name: &str) -> AppResult<()> {
        if self.coins.iter().any(|c| c == coin_name) {
            Ok(())
        } else {
            Err(AppError::UnknownCoin {
                chain: self.identity.key.to_string(),
                coin_name: coin_name.to_string(),
            })
        }
    }

    fn adapter(&self, coin_name: &str) -> DynChainAdapter {
        self.reconciler.adapter(coin_name)
    }

    fn persist_addresses(&self) {
        self.reconciler.store().set_addresses(self.registry().all());
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// Load key material, register hot and cold addresses of every coin,
    /// then run `initialize_post_hook` per coin.
    pub async fn init_from_seed(&self, vault: SeedVault) -> AppResult<Vec<IssuedAddress>> {
        *self.vault.write() = vault;
        self.system_data.write().clear();
        let registry = self.registry();
        let mut issued = Vec::new();
        for coin in &self.coins {
            let hot = self.get_system_address(coin, SystemAddressKind::Hot).await?;
            issued.push(registry.register(coin, Address::new(AddressRole::Hot, "main", hot), None, None)?);
            if self.cold_addresses.contains_key(coin) {
                let cold = self.get_system_address(coin, SystemAddressKind::Cold).await?;
                issued.push(registry.register(
                    coin,
                    Address::new(AddressRole::Cold, "main", cold),
                    None,
                    None,
                )?);
            }
        }
        self.persist_addresses();

        for coin in &self.coins {
            if let Err(e) = self.hooks.initialize_post_hook(coin).await {
                warn!(chain = %self.identity.key, coin = %coin, error = %e, "Initialize hook failed");
                Metrics::hook_failure(self.identity.key.as_str(), "initialize_post_hook");
            }
        }
        info!(
            chain = %self.identity.key,
            coins = self.coins.len(),
            system_addresses = issued.len(),
            "Ledger client initialized"
        );
        Ok(issued)
    }

    // ------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------

    /// Derive an address; `index` absent derives the hot main address.
    pub async fn gen_address(
        &self,
        path: &str,
        index: Option<u32>,
        coin_name: &str,
        address_type: AddressType,
        biz_mode: BizMode,
    ) -> AppResult<String> {
        self.ensure_coin(coin_name)?;
        let req = AddressRequest {
            path: path.to_string(),
            index,
            coin_name: coin_name.to_string(),
            address_type,
            biz_mode,
        };
        let adapter = self.adapter(coin_name);
        let raw = match adapter.key_mode() {
            KeyMode::Private => {
                let seed = Zeroizing::new(self.vault.read().seed()?.to_vec());
                adapter.gen_address_by_priv_key(&seed, &req).await?
            }
            KeyMode::Public => {
                let pub_key = self.vault.read().public_key()?.to_string();
                adapter.gen_address_by_pub_key(&pub_key, &req).await?
            }
        };
        Ok(adapter.normalize_address(&raw))
    }

    /// Issue an address for a customer.
    ///
    /// Memo modes share the hot address; the returned index is the memo the
    /// owner must attach.
    pub async fn create_address(
        &self,
        callback: &str,
        coin_name: &str,
        appid: &str,
        biz_mode: BizMode,
    ) -> AppResult<IssuedAddress> {
        self.ensure_coin(coin_name)?;
        let owner = AddressOwner {
            appid: appid.to_string(),
            callback: callback.to_string(),
            biz_mode,
        };
        let registry = self.registry();
        let index = registry.allocate_index();

        if biz_mode.uses_memo() {
            let hot = self.get_system_address(coin_name, SystemAddressKind::Hot).await?;
            debug!(chain = %self.identity.key, coin = coin_name, memo = index, "Memo address issued");
            return Ok(IssuedAddress {
                address: Address::new(AddressRole::Hot, biz_mode.as_str(), hot),
                coin_name: coin_name.to_string(),
                owner: Some(owner),
                index: Some(index),
                created_at: Utc::now(),
            });
        }

        let address = self
            .gen_address(
                &self.derivation_path,
                Some(index),
                coin_name,
                AddressType::default(),
                biz_mode,
            )
            .await?;
        let issued = registry.register(
            coin_name,
            Address::new(AddressRole::Deposit, biz_mode.as_str(), address),
            Some(owner),
            Some(index),
        )?;
        self.persist_addresses();
        info!(
            chain = %self.identity.key,
            coin = coin_name,
            appid,
            index,
            address = %issued.address.address,
            "Deposit address issued"
        );
        Ok(issued)
    }

    pub fn normalize_address(&self, coin_name: &str, address: &str) -> String {
        self.adapter(coin_name).normalize_address(address)
    }

    pub async fn validate_address(&self, coin_name: &str, address: &str) -> ValidationOutcome {
        self.adapter(coin_name).validate_address(address, coin_name).await
    }

    /// Uncached resolution: hot derived from the seed, cold from configuration.
    pub async fn do_get_system_address(
        &self,
        coin_name: &str,
        kind: SystemAddressKind,
    ) -> AppResult<String> {
        match kind {
            SystemAddressKind::Hot => {
                self.gen_address(
                    &self.derivation_path,
                    None,
                    coin_name,
                    AddressType::default(),
                    BizMode::Normal,
                )
                .await
            }
            SystemAddressKind::Cold => self
                .cold_addresses
                .get(coin_name)
                .map(|a| self.normalize_address(coin_name, a))
                .ok_or_else(|| {
                    AppError::Registry(RegistryError::SystemAddressUnavailable {
                        coin_name: coin_name.to_string(),
                        kind,
                    })
                }),
        }
    }

    /// Cached system address; only [`Self::rotate_system_address`] invalidates it.
    pub async fn get_system_address(
        &self,
        coin_name: &str,
        kind: SystemAddressKind,
    ) -> AppResult<String> {
        if let Some(address) = self.system_cache.get(coin_name, kind) {
            return Ok(address);
        }
        let resolved = self.do_get_system_address(coin_name, kind).await?;
        Ok(self.system_cache.put(coin_name, kind, resolved))
    }

    pub fn rotate_system_address(&self, coin_name: &str, kind: SystemAddressKind) -> Option<String> {
        self.system_cache.rotate(coin_name, kind)
    }

    /// Key material the hot address of a coin derives from: the hex seed, or
    /// the public key for watch-only adapters. Cached until the vault is
    /// reloaded. Never exported to hosts.
    pub fn get_system_data(&self, coin_name: &str) -> AppResult<Zeroizing<String>> {
        self.ensure_coin(coin_name)?;
        if let Some(data) = self.system_data.read().get(coin_name) {
            return Ok(data.clone());
        }
        let data = {
            let vault = self.vault.read();
            match self.adapter(coin_name).key_mode() {
                KeyMode::Private => vault.seed_hex()?,
                KeyMode::Public => Zeroizing::new(vault.public_key()?.to_string()),
            }
        };
        Ok(self
            .system_data
            .write()
            .entry(coin_name.to_string())
            .or_insert(data)
            .clone())
    }

    // ------------------------------------------------------------------
    // Balances
    // ------------------------------------------------------------------

    /// On-chain balance minus the value of outgoing orders in flight.
    pub async fn get_wallet_status(&self, coin_name: &str, address: &str) -> AppResult<WalletStatus> {
        self.ensure_coin(coin_name)?;
        let balance = self.adapter(coin_name).get_balance(address, coin_name).await?;
        let unavailable = self.reconciler.in_flight_value(coin_name, address);
        Ok(WalletStatus::from_balance(balance, unavailable))
    }

    /// Decimal-adjusted balance of the hot wallet.
    pub async fn get_wallet_balance(&self, coin_name: &str) -> AppResult<DisplayAmount> {
        self.ensure_coin(coin_name)?;
        let hot = self.get_system_address(coin_name, SystemAddressKind::Hot).await?;
        Ok(self
            .adapter(coin_name)
            .get_wallet_balance(&hot, coin_name)
            .await?)
    }

    /// Status of several addresses, queried concurrently.
    pub async fn get_wallet_statuses(
        &self,
        coin_name: &str,
        addresses: &[String],
    ) -> Vec<(String, AppResult<WalletStatus>)> {
        let statuses = join_all(
            addresses
                .iter()
                .map(|address| self.get_wallet_status(coin_name, address)),
        )
        .await;
        addresses.iter().cloned().zip(statuses).collect()
    }

    pub async fn get_account_balances(
        &self,
        address: &str,
        coin_names: Option<&[String]>,
    ) -> AppResult<BTreeMap<String, DisplayAmount>> {
        let adapter = self.reconciler.handlers().default_handler();
        Ok(adapter.get_account_balances(address, coin_names).await?)
    }

    pub async fn get_balance_no_decimal(&self, coin_name: &str, address: &str) -> AppResult<RawAmount> {
        self.ensure_coin(coin_name)?;
        Ok(self
            .adapter(coin_name)
            .get_balance_no_decimal(address, coin_name)
            .await?)
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    pub async fn scan_txs(
        &self,
        txns: &[TxResult],
        bn: Option<BlockNumber>,
        has_scan_task: bool,
    ) -> AppResult<Vec<TrackedOrder>> {
        Ok(self.scanner.scan_txs(txns, bn, has_scan_task).await?)
    }

    pub async fn scan_address(
        &self,
        coin_name: &str,
        address: &str,
        from_bn: BlockNumber,
    ) -> AppResult<Vec<TrackedOrder>> {
        self.ensure_coin(coin_name)?;
        Ok(self.scanner.scan_address(coin_name, address, from_bn).await?)
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    pub fn get_order(&self, id: OrderId) -> AppResult<TrackedOrder> {
        self.reconciler.order(id).ok_or(AppError::UnknownOrder(id))
    }

    /// Transaction details of an order that has a txid; `None` before broadcast.
    pub async fn get_tx_data_by_order(
        &self,
        id: OrderId,
        bn: BlockNumber,
    ) -> AppResult<Option<TxData>> {
        let order = self.get_order(id)?;
        let Some(info) = order.order_info() else {
            return Ok(None);
        };
        Ok(self
            .adapter(&order.coin_name)
            .get_transaction_state(&info, bn)
            .await?)
    }

    /// Queue a withdrawal from the hot wallet; it is broadcast at the next settle.
    pub async fn withdraw(
        &self,
        coin_name: &str,
        to: &str,
        value: DisplayAmount,
        memo: Option<String>,
    ) -> AppResult<TrackedOrder> {
        self.ensure_coin(coin_name)?;
        let hot = self.get_system_address(coin_name, SystemAddressKind::Hot).await?;
        Ok(self
            .reconciler
            .create_withdrawal(coin_name, &hot, to, value, memo)
            .await?)
    }

    pub async fn sweep_to_cold(&self, coin_name: &str, value: DisplayAmount) -> AppResult<TrackedOrder> {
        self.ensure_coin(coin_name)?;
        let hot = self.get_system_address(coin_name, SystemAddressKind::Hot).await?;
        let cold = self.get_system_address(coin_name, SystemAddressKind::Cold).await?;
        Ok(self
            .reconciler
            .create_cold_sweep(coin_name, &hot, &cold, value)
            .await?)
    }

    /// Split `total` from the hot wallet over `targets` (`"address,n"` each).
    pub async fn scatter(
        &self,
        coin_name: &str,
        total: DisplayAmount,
        targets: Vec<String>,
    ) -> AppResult<TrackedOrder> {
        self.ensure_coin(coin_name)?;
        let hot = self.get_system_address(coin_name, SystemAddressKind::Hot).await?;
        Ok(self
            .reconciler
            .create_scatter(coin_name, &hot, total, targets)
            .await?)
    }

    // ------------------------------------------------------------------
    // Host invocation
    // ------------------------------------------------------------------

    /// Call an exported method with JSON params.
    pub async fn invoke(&self, method: &str, raw: Value) -> AppResult<Value> {
        if !EXPORTED_METHODS.contains(&method) {
            warn!(chain = %self.identity.key, method, "Rejected call to non-exported method");
            return Err(AppError::MethodNotExported(method.to_string()));
        }
        debug!(chain = %self.identity.key, method, "Host invoke");
        let value = match method {
            "createAddress" => {
                let p: CreateAddressParams = params(method, raw)?;
                serde_json::to_value(
                    self.create_address(&p.callback, &p.coin_name, &p.appid, p.biz_mode)
                        .await?,
                )?
            }
            "normalizeAddress" => {
                let p: AddressParams = params(method, raw)?;
                Value::String(self.normalize_address(&p.coin_name, &p.address))
            }
            "validateAddress" => {
                let p: AddressParams = params(method, raw)?;
                serde_json::to_value(self.validate_address(&p.coin_name, &p.address).await)?
            }
            "getSystemAddress" => {
                let p: SystemAddressParams = params(method, raw)?;
                Value::String(self.get_system_address(&p.coin_name, p.kind).await?)
            }
            "getWalletStatus" => {
                let p: AddressParams = params(method, raw)?;
                serde_json::to_value(self.get_wallet_status(&p.coin_name, &p.address).await?)?
            }
            "getWalletBalance" => {
                let p: CoinParams = params(method, raw)?;
                serde_json::to_value(self.get_wallet_balance(&p.coin_name).await?)?
            }
            "getAccountBalances" => {
                let p: BalancesParams = params(method, raw)?;
                serde_json::to_value(
                    self.get_account_balances(&p.address, p.coin_names.as_deref())
                        .await?,
                )?
            }
            "withdraw" => {
                let p: WithdrawParams = params(method, raw)?;
                serde_json::to_value(self.withdraw(&p.coin_name, &p.to, p.value, p.memo).await?)?
            }
            "sweepToCold" => {
                let p: SweepParams = params(method, raw)?;
                serde_json::to_value(self.sweep_to_cold(&p.coin_name, p.value).await?)?
            }
            "getOrder" => {
                let p: OrderParams = params(method, raw)?;
                serde_json::to_value(self.get_order(p.order_id)?)?
            }
            "getTxDataByOrder" => {
                let p: OrderParams = params(method, raw)?;
                let bn = p.bn.unwrap_or_else(|| self.reconciler.current_bn());
                serde_json::to_value(self.get_tx_data_by_order(p.order_id, bn).await?)?
            }
            "getValidators" => serde_json::to_value(self.stake.get_validators().await?)?,
            "getDelegations" => {
                let p: DelegatorParams = params(method, raw)?;
                serde_json::to_value(self.stake.get_delegations(&p.delegator).await?)?
            }
            "submitDelegation" => {
                let p: DelegationParams = params(method, raw)?;
                let submission = self
                    .stake
                    .submit_delegation(&p.coin_name, &p.delegator, &p.validator, p.value)
                    .await?;
                json!({ "orderId": submission.order_id })
            }
            "claimReward" => {
                let p: DelegationParams = params(method, raw)?;
                let submission = self
                    .stake
                    .claim_reward(&p.coin_name, &p.delegator, &p.validator)
                    .await?;
                json!({ "orderId": submission.order_id })
            }
            other => return Err(AppError::MethodNotExported(other.to_string())),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_chain::{ChainHandlers, SimulatedChain};
    use custody_core::{ChainKey, OrderKind, OrderStatus};
    use custody_reconciler::ConfirmationPolicy;
    use custody_scanner::ScannerConfig;
    use custody_store::{LedgerStore, MemoryStore};
    use rust_decimal_macros::dec;

    struct Fixture {
        sim: Arc<SimulatedChain>,
        store: Arc<MemoryStore>,
        client: LedgerClient,
    }

    fn fixture_with(sim: SimulatedChain, cold: bool) -> Fixture {
        let sim = Arc::new(sim);
        let store = Arc::new(MemoryStore::new());
        let mut config = ChainConfig::new("sim", "sim", 8);
        if cold {
            config
                .cold_addresses
                .insert("sim".to_string(), " cold-1 ".to_string());
        }
        let reconciler = Arc::new(OrderReconciler::new(
            Arc::new(ChainHandlers::new(sim.clone())),
            store.clone(),
            Arc::new(AddressRegistry::new()),
            ConfirmationPolicy::default(),
        ));
        let scanner = Arc::new(Scanner::new(reconciler.clone(), ScannerConfig::default()));
        Fixture {
            sim,
            store,
            client: LedgerClient::new(&config, reconciler, scanner),
        }
    }

    fn sim_chain() -> SimulatedChain {
        SimulatedChain::new(ChainIdentity {
            key: ChainKey::new("sim"),
            name: "Simulated".to_string(),
            index: 1,
            core_type: "sim".to_string(),
        })
    }

    async fn initialized(cold: bool) -> Fixture {
        let f = fixture_with(sim_chain(), cold);
        f.client
            .init_from_seed(SeedVault::from_hex("00112233").unwrap())
            .await
            .unwrap();
        f
    }

    #[tokio::test]
    async fn test_init_registers_system_addresses() {
        let f = initialized(true).await;
        let hot = f
            .client
            .get_system_address("sim", SystemAddressKind::Hot)
            .await
            .unwrap();
        let cold = f
            .client
            .get_system_address("sim", SystemAddressKind::Cold)
            .await
            .unwrap();
        assert_eq!(cold, "cold-1");
        assert!(f.client.registry().is_hot_address("sim", &hot));
        assert!(f.client.registry().is_cold_address("sim", &cold));
        assert_eq!(f.store.addresses().len(), 2);

        // derivation is deterministic, so rotation resolves the same hot address
        assert_eq!(
            f.client.rotate_system_address("sim", SystemAddressKind::Hot),
            Some(hot.clone())
        );
        assert_eq!(
            f.client
                .get_system_address("sim", SystemAddressKind::Hot)
                .await
                .unwrap(),
            hot
        );
    }

    #[tokio::test]
    async fn test_missing_cold_address() {
        let f = initialized(false).await;
        let err = f
            .client
            .get_system_address("sim", SystemAddressKind::Cold)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Registry(RegistryError::SystemAddressUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_address_issues_deposit() {
        let f = initialized(false).await;
        let first = f
            .client
            .create_address("https://cb", "sim", "app1", BizMode::Deposit)
            .await
            .unwrap();
        let second = f
            .client
            .create_address("https://cb", "sim", "app1", BizMode::Deposit)
            .await
            .unwrap();
        assert_ne!(first.address.address, second.address.address);
        assert_eq!(first.index, Some(0));
        assert_eq!(second.index, Some(1));
        assert_eq!(first.owner.as_ref().map(|o| o.appid.as_str()), Some("app1"));
        assert!(f.client.registry().is_deposit_address("sim", &first.address.address));
        assert_eq!(f.store.addresses().len(), 3);

        let memo = f
            .client
            .create_address("https://cb", "sim", "app2", BizMode::DepositMemo)
            .await
            .unwrap();
        assert_eq!(memo.address.role, AddressRole::Hot);
        assert_eq!(memo.index, Some(2));
    }

    #[tokio::test]
    async fn test_unknown_coin_rejected() {
        let f = initialized(false).await;
        let err = f
            .client
            .create_address("cb", "btc", "app1", BizMode::Auto)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnknownCoin { .. }));
    }

    #[tokio::test]
    async fn test_public_key_mode_needs_public_key() {
        let f = fixture_with(sim_chain().with_key_mode(KeyMode::Public), false);
        let err = f
            .client
            .init_from_seed(SeedVault::from_hex("00112233").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Registry(RegistryError::KeyNotLoaded)));

        let issued = f
            .client
            .init_from_seed(SeedVault::from_public_key("xpub-test".to_string()))
            .await
            .unwrap();
        assert_eq!(issued.len(), 1);
    }

    #[tokio::test]
    async fn test_wallet_status_subtracts_in_flight() {
        let f = initialized(false).await;
        let hot = f
            .client
            .get_system_address("sim", SystemAddressKind::Hot)
            .await
            .unwrap();
        f.sim.set_balance(&hot, "sim", DisplayAmount::new(dec!(10)));

        let order = f
            .client
            .withdraw("sim", "userA", DisplayAmount::new(dec!(4)), None)
            .await
            .unwrap();
        assert_eq!(order.kind, OrderKind::Withdraw);
        f.client.reconciler().settle("sim", 0).await.unwrap();
        assert_eq!(f.store.order(order.id()).unwrap().status, OrderStatus::Seen);

        let status = f.client.get_wallet_status("sim", &hot).await.unwrap();
        assert_eq!(status.balance, DisplayAmount::new(dec!(10)));
        assert_eq!(status.balance_unavailable, DisplayAmount::new(dec!(4)));
        assert_eq!(status.balance_available, DisplayAmount::new(dec!(6)));

        let statuses = f
            .client
            .get_wallet_statuses("sim", &[hot.clone(), "other".to_string()])
            .await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|(_, s)| s.is_ok()));
    }

    #[tokio::test]
    async fn test_wallet_balance_reads_hot_address() {
        let f = initialized(true).await;
        let hot = f
            .client
            .get_system_address("sim", SystemAddressKind::Hot)
            .await
            .unwrap();
        let cold = f
            .client
            .get_system_address("sim", SystemAddressKind::Cold)
            .await
            .unwrap();
        f.sim.set_balance(&hot, "sim", DisplayAmount::new(dec!(7.25)));
        f.sim.set_balance(&cold, "sim", DisplayAmount::new(dec!(100)));

        let balance = f.client.get_wallet_balance("sim").await.unwrap();
        assert_eq!(balance, DisplayAmount::new(dec!(7.25)));
        assert_eq!(
            f.client.get_balance_no_decimal("sim", &hot).await.unwrap(),
            DisplayAmount::new(dec!(7.25)).to_raw(8).unwrap()
        );

        let invoked = f
            .client
            .invoke("getWalletBalance", json!({ "coinName": "sim" }))
            .await
            .unwrap();
        let invoked: DisplayAmount = serde_json::from_value(invoked).unwrap();
        assert_eq!(invoked, balance);

        assert!(matches!(
            f.client.get_wallet_balance("btc").await,
            Err(AppError::UnknownCoin { .. })
        ));
    }

    #[tokio::test]
    async fn test_system_data_follows_key_mode() {
        let f = initialized(false).await;
        assert_eq!(f.client.get_system_data("sim").unwrap().as_str(), "00112233");
        assert!(f.client.invoke("getSystemData", json!({ "coinName": "sim" })).await.is_err());

        let watch = fixture_with(sim_chain().with_key_mode(KeyMode::Public), false);
        assert!(matches!(
            watch.client.get_system_data("sim"),
            Err(AppError::Registry(RegistryError::KeyNotLoaded))
        ));
        watch
            .client
            .init_from_seed(SeedVault::from_public_key("xpub-test".to_string()))
            .await
            .unwrap();
        assert_eq!(watch.client.get_system_data("sim").unwrap().as_str(), "xpub-test");

        // reloading the vault drops the cached value
        watch
            .client
            .init_from_seed(SeedVault::from_public_key("xpub-next".to_string()))
            .await
            .unwrap();
        assert_eq!(watch.client.get_system_data("sim").unwrap().as_str(), "xpub-next");
    }

    #[tokio::test]
    async fn test_invoke_respects_export_list() {
        let f = initialized(false).await;
        assert!(matches!(
            f.client.invoke("initFromSeed", json!({})).await,
            Err(AppError::MethodNotExported(_))
        ));
        assert!(matches!(
            f.client.invoke("withdraw", json!({ "coinName": "sim" })).await,
            Err(AppError::InvalidParams { .. })
        ));

        let issued = f
            .client
            .invoke(
                "createAddress",
                json!({ "callback": "cb", "coinName": "sim", "appid": "app1", "bizMode": "deposit" }),
            )
            .await
            .unwrap();
        assert_eq!(issued["address"]["type"], "deposit");

        let order = f
            .client
            .invoke(
                "withdraw",
                json!({ "coinName": "sim", "to": "userB", "value": "1.5" }),
            )
            .await
            .unwrap();
        let id: OrderId = serde_json::from_value(order["order"]["id"].clone()).unwrap();
        let fetched = f
            .client
            .invoke("getOrder", json!({ "orderId": id }))
            .await
            .unwrap();
        assert_eq!(fetched["status"], order["status"]);
        assert_eq!(
            f.client
                .invoke("getTxDataByOrder", json!({ "orderId": id }))
                .await
                .unwrap(),
            Value::Null
        );
    }
}
