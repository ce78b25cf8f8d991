//! In-process simulated chain.
//!
//! Implements [`ChainAdapter`] and [`StakeHandler`] over an in-memory block
//! list so the whole engine can run without a node: `--simulate` mode, unit
//! tests and the integration suite. Blocks are produced explicitly with
//! [`SimulatedChain::mine`]; reorgs, dropped broadcasts, slow responses and
//! node failures can be injected.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use custody_core::{
    BlockNumber, BlockResult, ChainIdentity, Commission, DelegationInfo, DelegationReward,
    DisplayAmount, IncomingRecord, Order, OrderId, OrderInfo, OrderState, OrdersUpdateResult,
    RawAmount, SweepOrderResult, TxData, TxEndpoint, TxResult, UnstakingDelegationEntry,
    UnstakingDelegationInfo, ValidationOutcome, ValidatorInfo, ValidatorStatus,
    DEFAULT_VALIDATION_ERROR_CODE,
};

use crate::adapter::{AddressRequest, BoxFuture, ChainAdapter, KeyMode, StakeHandler};
use crate::error::{ChainError, ChainResult};

/// Seconds between simulated blocks.
const BLOCK_TIME_SECS: i64 = 12;

/// Decimals used for the core coin unless configured otherwise.
const DEFAULT_DECIMALS: u32 = 8;

/// Operation class used for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    BlockFetch,
    Broadcast,
    StateQuery,
}

/// Injected failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFailure {
    /// Node unreachable; nothing was submitted.
    Unreachable,
    /// Request timed out; for broadcasts the transaction is still submitted.
    Timeout,
}

/// One transfer leg inside a simulated transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimOutput {
    pub from: String,
    pub to: String,
    pub value: DisplayAmount,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimTx {
    pub txid: String,
    pub coin_name: String,
    pub outputs: Vec<SimOutput>,
    pub fee: DisplayAmount,
}

#[derive(Debug, Clone)]
struct SimBlock {
    hash: String,
    timestamp: i64,
    txs: Vec<SimTx>,
}

/// Broadcast observed by the simulated node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRecord {
    pub kind: &'static str,
    pub txid: String,
    pub order_ids: Vec<OrderId>,
    pub at_tip: BlockNumber,
}

#[derive(Debug)]
struct SimState {
    coins: HashMap<String, u32>,
    tip: BlockNumber,
    blocks: BTreeMap<BlockNumber, SimBlock>,
    tx_blocks: HashMap<String, BlockNumber>,
    mempool: Vec<SimTx>,
    balances: HashMap<(String, String), DisplayAmount>,
    broadcasts: Vec<BroadcastRecord>,
    failures: VecDeque<(SimOp, SimFailure)>,
    fee: Option<DisplayAmount>,
    batch_count: usize,
    drop_broadcasts: bool,
    latency: Option<Duration>,
    epoch: u64,
    next_tx: u64,
    validators: Vec<ValidatorInfo>,
    delegations: HashMap<String, Vec<DelegationInfo>>,
    unstaking: HashMap<String, Vec<UnstakingDelegationInfo>>,
    reward_addresses: HashMap<String, String>,
}

/// Simulated chain node plus adapter.
#[derive(Debug)]
pub struct SimulatedChain {
    identity: ChainIdentity,
    key_mode: KeyMode,
    state: Mutex<SimState>,
}

impl SimulatedChain {
    /// Create a chain at height 0 with the core coin configured.
    pub fn new(identity: ChainIdentity) -> Self {
        let mut coins = HashMap::new();
        coins.insert(identity.core_type.clone(), DEFAULT_DECIMALS);
        let mut blocks = BTreeMap::new();
        blocks.insert(
            0,
            SimBlock {
                hash: block_hash(0, 0),
                timestamp: 0,
                txs: Vec::new(),
            },
        );
        Self {
            identity,
            key_mode: KeyMode::Private,
            state: Mutex::new(SimState {
                coins,
                tip: 0,
                blocks,
                tx_blocks: HashMap::new(),
                mempool: Vec::new(),
                balances: HashMap::new(),
                broadcasts: Vec::new(),
                failures: VecDeque::new(),
                fee: Some(DisplayAmount::ZERO),
                batch_count: 20,
                drop_broadcasts: false,
                latency: None,
                epoch: 0,
                next_tx: 1,
                validators: default_validators(),
                delegations: HashMap::new(),
                unstaking: HashMap::new(),
                reward_addresses: HashMap::new(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    #[must_use]
    pub fn with_coin(self, coin_name: impl Into<String>, decimals: u32) -> Self {
        self.state.lock().coins.insert(coin_name.into(), decimals);
        self
    }

    #[must_use]
    pub fn with_key_mode(mut self, mode: KeyMode) -> Self {
        self.key_mode = mode;
        self
    }

    pub fn set_batch_count(&self, count: usize) {
        self.state.lock().batch_count = count.max(1);
    }

    /// `None` makes every fee check report insufficient funds.
    pub fn set_fee(&self, fee: Option<DisplayAmount>) {
        self.state.lock().fee = fee;
    }

    /// Accept broadcasts but never mine them.
    pub fn set_drop_broadcasts(&self, drop: bool) {
        self.state.lock().drop_broadcasts = drop;
    }

    /// Delay every adapter response.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Fail the next call of class `op`.
    pub fn fail_next(&self, op: SimOp, failure: SimFailure) {
        self.state.lock().failures.push_back((op, failure));
    }

    pub fn set_balance(&self, address: &str, coin_name: &str, value: DisplayAmount) {
        self.state
            .lock()
            .balances
            .insert((address.to_string(), coin_name.to_string()), value);
    }

    // ------------------------------------------------------------------
    // Block production
    // ------------------------------------------------------------------

    /// Queue a transfer from outside the system. Returns its txid.
    pub fn submit_external(
        &self,
        coin_name: &str,
        from: &str,
        to: &str,
        value: DisplayAmount,
    ) -> String {
        let mut st = self.state.lock();
        let txid = next_txid(&mut st, &self.identity);
        st.mempool.push(SimTx {
            txid: txid.clone(),
            coin_name: coin_name.to_string(),
            outputs: vec![SimOutput {
                from: from.to_string(),
                to: to.to_string(),
                value,
                memo: None,
            }],
            fee: DisplayAmount::ZERO,
        });
        txid
    }

    /// Produce one block containing the whole mempool.
    pub fn mine(&self) -> BlockNumber {
        let mut st = self.state.lock();
        let bn = st.tip + 1;
        let txs = std::mem::take(&mut st.mempool);
        for tx in &txs {
            apply_balances(&mut st.balances, tx, false);
            st.tx_blocks.insert(tx.txid.clone(), bn);
        }
        let block = SimBlock {
            hash: block_hash(bn, st.epoch),
            timestamp: bn as i64 * BLOCK_TIME_SECS,
            txs,
        };
        st.blocks.insert(bn, block);
        st.tip = bn;
        bn
    }

    /// Mine `count` blocks; returns the new tip.
    pub fn mine_blocks(&self, count: u64) -> BlockNumber {
        let mut tip = self.tip();
        for _ in 0..count {
            tip = self.mine();
        }
        tip
    }

    /// Orphan every block from `height` up. Orphaned transactions return to
    /// the mempool when `keep_txs`, otherwise they vanish. Later blocks get
    /// fresh hashes.
    pub fn reorg(&self, height: BlockNumber, keep_txs: bool) {
        let mut st = self.state.lock();
        if height == 0 || height > st.tip {
            return;
        }
        let orphaned = st.blocks.split_off(&height);
        let mut returned = Vec::new();
        for (_, block) in orphaned.into_iter().rev() {
            for tx in block.txs.into_iter().rev() {
                apply_balances(&mut st.balances, &tx, true);
                st.tx_blocks.remove(&tx.txid);
                if keep_txs {
                    returned.push(tx);
                }
            }
        }
        returned.reverse();
        returned.append(&mut st.mempool);
        st.mempool = returned;
        st.tip = height - 1;
        st.epoch += 1;
        debug!(chain = %self.identity.key, height, epoch = st.epoch, "Simulated reorg");
    }

    pub fn tip(&self) -> BlockNumber {
        self.state.lock().tip
    }

    pub fn broadcasts(&self) -> Vec<BroadcastRecord> {
        self.state.lock().broadcasts.clone()
    }

    pub fn broadcast_count(&self) -> usize {
        self.state.lock().broadcasts.len()
    }

    pub fn mempool_len(&self) -> usize {
        self.state.lock().mempool.len()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Sleep for the configured latency, then consume a pending failure for `op`.
    async fn io(&self, op: SimOp) -> Result<(), SimFailure> {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut st = self.state.lock();
        match st.failures.iter().position(|(o, _)| *o == op) {
            Some(idx) => match st.failures.remove(idx) {
                Some((_, failure)) => Err(failure),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    async fn io_checked(&self, op: SimOp) -> ChainResult<()> {
        self.io(op).await.map_err(|f| self.failure_error(f, op))
    }

    fn failure_error(&self, failure: SimFailure, op: SimOp) -> ChainError {
        let what = format!("{} {:?}", self.identity.key, op);
        match failure {
            SimFailure::Unreachable => ChainError::Unreachable(what),
            SimFailure::Timeout => ChainError::Timeout(what),
        }
    }

    fn decimals(&self, coin_name: &str) -> ChainResult<u32> {
        self.state
            .lock()
            .coins
            .get(coin_name)
            .copied()
            .ok_or_else(|| ChainError::UnknownCoin(coin_name.to_string()))
    }

    /// Submit a transaction built from `outputs`.
    ///
    /// A `Timeout` failure still submits the transaction before reporting the
    /// error, like a node that accepted the request but never answered.
    async fn broadcast(
        &self,
        kind: &'static str,
        coin_name: &str,
        outputs: Vec<SimOutput>,
        order_ids: Vec<OrderId>,
    ) -> ChainResult<String> {
        self.decimals(coin_name)?;
        let outcome = self.io(SimOp::Broadcast).await;
        if outcome == Err(SimFailure::Unreachable) {
            return Err(self.failure_error(SimFailure::Unreachable, SimOp::Broadcast));
        }

        let mut st = self.state.lock();
        let txid = next_txid(&mut st, &self.identity);
        let fee = st.fee.unwrap_or(DisplayAmount::ZERO);
        if !st.drop_broadcasts {
            st.mempool.push(SimTx {
                txid: txid.clone(),
                coin_name: coin_name.to_string(),
                outputs,
                fee,
            });
        }
        let at_tip = st.tip;
        st.broadcasts.push(BroadcastRecord {
            kind,
            txid: txid.clone(),
            order_ids,
            at_tip,
        });
        drop(st);

        match outcome {
            Err(failure) => Err(self.failure_error(failure, SimOp::Broadcast)),
            Ok(()) => Ok(txid),
        }
    }

    fn find_tx(&self, txid: &str) -> Option<(BlockNumber, SimTx)> {
        let st = self.state.lock();
        let bn = *st.tx_blocks.get(txid)?;
        let block = st.blocks.get(&bn)?;
        block
            .txs
            .iter()
            .find(|tx| tx.txid == txid)
            .map(|tx| (bn, tx.clone()))
    }
}

fn block_hash(bn: BlockNumber, epoch: u64) -> String {
    format!(
        "0x{}{}",
        hex::encode(epoch.to_be_bytes()),
        hex::encode(bn.to_be_bytes())
    )
}

fn next_txid(st: &mut SimState, identity: &ChainIdentity) -> String {
    let n = st.next_tx;
    st.next_tx += 1;
    format!("{}-{}", identity.key, hex::encode(n.to_be_bytes()))
}

fn apply_balances(
    balances: &mut HashMap<(String, String), DisplayAmount>,
    tx: &SimTx,
    revert: bool,
) {
    for out in &tx.outputs {
        let from = balances
            .entry((out.from.clone(), tx.coin_name.clone()))
            .or_default();
        *from = if revert {
            *from + out.value
        } else {
            from.saturating_sub(out.value)
        };
        let to = balances
            .entry((out.to.clone(), tx.coin_name.clone()))
            .or_default();
        *to = if revert {
            to.saturating_sub(out.value)
        } else {
            *to + out.value
        };
    }
}

fn default_validators() -> Vec<ValidatorInfo> {
    let commission = Commission {
        rate: DisplayAmount::new(rust_decimal::Decimal::new(5, 2)),
        max_rate: DisplayAmount::new(rust_decimal::Decimal::new(20, 2)),
        max_change_rate: DisplayAmount::new(rust_decimal::Decimal::new(1, 2)),
    };
    vec![
        ValidatorInfo {
            operator_address: "valoper1".to_string(),
            moniker: "alpha".to_string(),
            jailed: false,
            status: ValidatorStatus::Staked,
            tokens: DisplayAmount::new(rust_decimal::Decimal::new(1_000_000, 0)),
            commission: commission.clone(),
        },
        ValidatorInfo {
            operator_address: "valoper2".to_string(),
            moniker: "beta".to_string(),
            jailed: true,
            status: ValidatorStatus::Unstaking,
            tokens: DisplayAmount::new(rust_decimal::Decimal::new(250_000, 0)),
            commission,
        },
    ]
}

fn order_output(order: &Order) -> SimOutput {
    SimOutput {
        from: order.from.clone(),
        to: order.to.clone(),
        value: order.value,
        memo: order.action_memo.clone(),
    }
}

/// Parse a scatter target `"address,n"`.
fn parse_target(target: &str) -> ChainResult<(String, u32)> {
    let (address, count) = target
        .split_once(',')
        .ok_or_else(|| ChainError::Rejected(format!("malformed scatter target {target}")))?;
    let count: u32 = count
        .trim()
        .parse()
        .map_err(|_| ChainError::Rejected(format!("malformed scatter count in {target}")))?;
    if count == 0 {
        return Err(ChainError::Rejected(format!("zero outputs in {target}")));
    }
    Ok((address.trim().to_string(), count))
}

impl ChainAdapter for SimulatedChain {
    fn identity(&self) -> &ChainIdentity {
        &self.identity
    }

    fn key_mode(&self) -> KeyMode {
        self.key_mode
    }

    fn get_send_orders_batch_count(&self, _coin_name: &str) -> usize {
        self.state.lock().batch_count
    }

    fn ensure_connected(&self) -> BoxFuture<'_, ChainResult<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn get_block_number(&self) -> BoxFuture<'_, ChainResult<BlockNumber>> {
        Box::pin(async move {
            self.io_checked(SimOp::BlockFetch).await?;
            Ok(self.tip())
        })
    }

    fn get_block_result(&self, bn: BlockNumber) -> BoxFuture<'_, ChainResult<BlockResult>> {
        Box::pin(async move {
            self.io_checked(SimOp::BlockFetch).await?;
            let st = self.state.lock();
            let block = st
                .blocks
                .get(&bn)
                .ok_or_else(|| ChainError::NotFound(format!("block {bn}")))?;
            Ok(BlockResult {
                hash: block.hash.clone(),
                timestamp: block.timestamp,
                txns: block
                    .txs
                    .iter()
                    .map(|tx| TxResult::new(tx.txid.clone()))
                    .collect(),
            })
        })
    }

    fn get_transaction_history<'a>(
        &'a self,
        address: &'a str,
        coin_name: &'a str,
        from_bn: BlockNumber,
    ) -> BoxFuture<'a, ChainResult<Vec<TxResult>>> {
        Box::pin(async move {
            self.io_checked(SimOp::StateQuery).await?;
            let st = self.state.lock();
            Ok(st
                .blocks
                .range(from_bn..)
                .flat_map(|(_, b)| b.txs.iter())
                .filter(|tx| {
                    tx.coin_name == coin_name
                        && tx
                            .outputs
                            .iter()
                            .any(|o| o.from == address || o.to == address)
                })
                .map(|tx| TxResult::new(tx.txid.clone()))
                .collect())
        })
    }

    fn get_account_balances<'a>(
        &'a self,
        address: &'a str,
        coin_names: Option<&'a [String]>,
    ) -> BoxFuture<'a, ChainResult<BTreeMap<String, DisplayAmount>>> {
        Box::pin(async move {
            self.io_checked(SimOp::StateQuery).await?;
            let st = self.state.lock();
            let mut out = BTreeMap::new();
            for coin in st.coins.keys() {
                if coin_names.is_some_and(|names| !names.contains(coin)) {
                    continue;
                }
                let value = st
                    .balances
                    .get(&(address.to_string(), coin.clone()))
                    .copied()
                    .unwrap_or_default();
                out.insert(coin.clone(), value);
            }
            Ok(out)
        })
    }

    fn get_balance<'a>(
        &'a self,
        address: &'a str,
        coin_name: &'a str,
    ) -> BoxFuture<'a, ChainResult<DisplayAmount>> {
        Box::pin(async move {
            self.decimals(coin_name)?;
            self.io_checked(SimOp::StateQuery).await?;
            Ok(self
                .state
                .lock()
                .balances
                .get(&(address.to_string(), coin_name.to_string()))
                .copied()
                .unwrap_or_default())
        })
    }

    fn get_balance_no_decimal<'a>(
        &'a self,
        address: &'a str,
        coin_name: &'a str,
    ) -> BoxFuture<'a, ChainResult<RawAmount>> {
        Box::pin(async move {
            let decimals = self.decimals(coin_name)?;
            let balance = self.get_balance(address, coin_name).await?;
            Ok(balance.to_raw(decimals)?)
        })
    }

    fn validate_address<'a>(
        &'a self,
        address: &'a str,
        coin_name: &'a str,
    ) -> BoxFuture<'a, ValidationOutcome> {
        Box::pin(async move {
            if address.starts_with("err:") || self.decimals(coin_name).is_err() {
                return ValidationOutcome::Error(DEFAULT_VALIDATION_ERROR_CODE);
            }
            let valid = !address.is_empty()
                && !address.starts_with("invalid")
                && address
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            ValidationOutcome::from(valid)
        })
    }

    fn gen_address_by_priv_key<'a>(
        &'a self,
        seed: &'a [u8],
        req: &'a AddressRequest,
    ) -> BoxFuture<'a, ChainResult<String>> {
        Box::pin(async move {
            if seed.is_empty() {
                return Err(ChainError::NotSupported("empty seed".to_string()));
            }
            let mut hasher = DefaultHasher::new();
            seed.hash(&mut hasher);
            req.path.hash(&mut hasher);
            req.index.hash(&mut hasher);
            req.address_type.hash(&mut hasher);
            Ok(format!(
                "{}{}",
                self.identity.key,
                hex::encode(hasher.finish().to_be_bytes())
            ))
        })
    }

    fn gen_address_by_pub_key<'a>(
        &'a self,
        pub_key: &'a str,
        req: &'a AddressRequest,
    ) -> BoxFuture<'a, ChainResult<String>> {
        Box::pin(async move {
            if pub_key.is_empty() {
                return Err(ChainError::NotSupported("empty public key".to_string()));
            }
            self.gen_address_by_priv_key(pub_key.as_bytes(), req).await
        })
    }

    fn withdraw<'a>(
        &'a self,
        coin_name: &'a str,
        orders: &'a [Order],
    ) -> BoxFuture<'a, ChainResult<Vec<OrdersUpdateResult>>> {
        Box::pin(async move {
            let ids: Vec<OrderId> = orders.iter().map(|o| o.id).collect();
            let outputs = orders.iter().map(order_output).collect();
            let txid = self.broadcast("withdraw", coin_name, outputs, ids.clone()).await?;
            Ok(vec![OrdersUpdateResult::new(txid, ids)])
        })
    }

    fn sweep_to_hot<'a>(
        &'a self,
        coin_name: &'a str,
        from_address: &'a str,
        cap: DisplayAmount,
        output: &'a Order,
    ) -> BoxFuture<'a, ChainResult<SweepOrderResult>> {
        Box::pin(async move {
            let leg = SimOutput {
                from: from_address.to_string(),
                to: output.to.clone(),
                value: cap,
                memo: None,
            };
            let txid = self
                .broadcast("sweep_to_hot", coin_name, vec![leg], vec![output.id])
                .await?;
            Ok(SweepOrderResult {
                update: OrdersUpdateResult::new(txid, vec![output.id]),
                to: Some(output.to.clone()),
                value: Some(cap),
            })
        })
    }

    fn sweep_to_cold<'a>(
        &'a self,
        coin_name: &'a str,
        cap: DisplayAmount,
        output: &'a Order,
    ) -> BoxFuture<'a, ChainResult<SweepOrderResult>> {
        Box::pin(async move {
            let leg = SimOutput {
                from: output.from.clone(),
                to: output.to.clone(),
                value: cap,
                memo: None,
            };
            let txid = self
                .broadcast("sweep_to_cold", coin_name, vec![leg], vec![output.id])
                .await?;
            Ok(SweepOrderResult {
                update: OrdersUpdateResult::new(txid, vec![output.id]),
                to: Some(output.to.clone()),
                value: Some(cap),
            })
        })
    }

    fn invoke_general<'a>(
        &'a self,
        coin_name: &'a str,
        order: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>> {
        Box::pin(async move {
            let method = order
                .action
                .clone()
                .ok_or_else(|| ChainError::Rejected("invoke without method".to_string()))?;
            let txid = self
                .broadcast("invoke", coin_name, vec![order_output(order)], vec![order.id])
                .await?;
            let mut result = OrdersUpdateResult::new(txid, vec![order.id]);
            result.action_memo = order.action_memo.clone();
            result.action_results = Some(vec![format!("{method}:ok")]);
            Ok(result)
        })
    }

    fn scatter<'a>(
        &'a self,
        coin_name: &'a str,
        from_address: &'a str,
        total: DisplayAmount,
        targets: &'a [String],
        output: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>> {
        Box::pin(async move {
            let parsed = targets
                .iter()
                .map(|t| parse_target(t))
                .collect::<ChainResult<Vec<_>>>()?;
            let pieces: u32 = parsed.iter().map(|(_, n)| *n).sum();
            if pieces == 0 {
                return Err(ChainError::Rejected("scatter without targets".to_string()));
            }
            let share = DisplayAmount::new(total.inner() / rust_decimal::Decimal::from(pieces));
            let mut legs = Vec::new();
            for (address, n) in parsed {
                for _ in 0..n {
                    legs.push(SimOutput {
                        from: from_address.to_string(),
                        to: address.clone(),
                        value: share,
                        memo: None,
                    });
                }
            }
            let txid = self
                .broadcast("scatter", coin_name, legs, vec![output.id])
                .await?;
            Ok(OrdersUpdateResult::new(txid, vec![output.id]))
        })
    }

    fn estimate_and_check_fee<'a>(
        &'a self,
        coin_name: &'a str,
        _biz_type: &'a str,
        _from_address: &'a str,
        max_order_count: usize,
    ) -> BoxFuture<'a, ChainResult<Option<DisplayAmount>>> {
        Box::pin(async move {
            self.decimals(coin_name)?;
            let fee = self.state.lock().fee;
            Ok(fee.map(|per_tx| {
                if coin_name == self.identity.core_type {
                    DisplayAmount::new(per_tx.inner() * rust_decimal::Decimal::from(max_order_count.max(1)))
                } else {
                    DisplayAmount::ZERO
                }
            }))
        })
    }

    fn get_order_state<'a>(
        &'a self,
        info: &'a OrderInfo,
        _bn: BlockNumber,
    ) -> BoxFuture<'a, ChainResult<OrderState>> {
        Box::pin(async move {
            self.io_checked(SimOp::StateQuery).await?;
            if let Some((block, tx)) = self.find_tx(&info.txid) {
                let mut state = OrderState::found_at(block);
                state.fee = Some(tx.fee);
                return Ok(state);
            }
            let in_mempool = self
                .state
                .lock()
                .mempool
                .iter()
                .any(|tx| tx.txid == info.txid);
            let mut state = OrderState::not_found();
            state.message = Some(if in_mempool {
                "transaction pending in mempool".to_string()
            } else {
                "transaction not found".to_string()
            });
            Ok(state)
        })
    }

    fn get_transaction_state<'a>(
        &'a self,
        info: &'a OrderInfo,
        bn: BlockNumber,
    ) -> BoxFuture<'a, ChainResult<Option<TxData>>> {
        Box::pin(async move {
            self.io_checked(SimOp::StateQuery).await?;
            let Some((block, tx)) = self.find_tx(&info.txid) else {
                return Ok(None);
            };
            let block_hash = self
                .state
                .lock()
                .blocks
                .get(&block)
                .map(|b| b.hash.clone())
                .unwrap_or_default();
            let endpoint = |address: &str, value: DisplayAmount, n: usize| TxEndpoint {
                address: address.to_string(),
                value,
                txid: Some(tx.txid.clone()),
                n: Some(n as u32),
                asset: Some(tx.coin_name.clone()),
            };
            Ok(Some(TxData {
                tx_type: "transfer".to_string(),
                hash: tx.txid.clone(),
                block_hash,
                fee: tx.fee,
                block_number: block,
                confirmations: bn.saturating_sub(block),
                from: tx
                    .outputs
                    .iter()
                    .enumerate()
                    .map(|(n, o)| endpoint(&o.from, o.value, n))
                    .collect(),
                to: tx
                    .outputs
                    .iter()
                    .enumerate()
                    .map(|(n, o)| endpoint(&o.to, o.value, n))
                    .collect(),
            }))
        })
    }

    fn filter_transactions<'a>(
        &'a self,
        txns: &'a [TxResult],
        bn: BlockNumber,
        _has_scan_task: bool,
    ) -> BoxFuture<'a, ChainResult<Vec<IncomingRecord>>> {
        Box::pin(async move {
            let st = self.state.lock();
            let Some(block) = st.blocks.get(&bn) else {
                return Err(ChainError::NotFound(format!("block {bn}")));
            };
            let mut records = Vec::new();
            for txref in txns {
                let Some(tx) = block.txs.iter().find(|tx| tx.txid == txref.txid) else {
                    continue;
                };
                if !st.coins.contains_key(&tx.coin_name) {
                    continue;
                }
                for (n, out) in tx.outputs.iter().enumerate() {
                    records.push(IncomingRecord {
                        txid: tx.txid.clone(),
                        meta: txref.meta.clone(),
                        bn,
                        core_type: self.identity.core_type.clone(),
                        coin_name: tx.coin_name.clone(),
                        from_address: out.from.clone(),
                        to_address: out.to.clone(),
                        value: out.value,
                        n: n as u32,
                        action: None,
                        action_memo: out.memo.clone(),
                        action_results: None,
                        is_unexpected: false,
                        is_special: false,
                        is_internal: false,
                    });
                }
            }
            Ok(records)
        })
    }
}

impl StakeHandler for SimulatedChain {
    fn submit_delegation<'a>(
        &'a self,
        coin_name: &'a str,
        order: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>> {
        Box::pin(async move {
            let txid = self
                .broadcast("delegate", coin_name, vec![order_output(order)], vec![order.id])
                .await?;
            let mut st = self.state.lock();
            let entries = st.delegations.entry(order.from.clone()).or_default();
            match entries.iter_mut().find(|d| d.validator_address == order.to) {
                Some(existing) => existing.amount = existing.amount + order.value,
                None => entries.push(DelegationInfo {
                    delegator_address: order.from.clone(),
                    validator_address: order.to.clone(),
                    amount: order.value,
                }),
            }
            Ok(OrdersUpdateResult::new(txid, vec![order.id]))
        })
    }

    fn submit_un_delegation<'a>(
        &'a self,
        coin_name: &'a str,
        order: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>> {
        Box::pin(async move {
            {
                let st = self.state.lock();
                let delegated = st
                    .delegations
                    .get(&order.from)
                    .and_then(|ds| ds.iter().find(|d| d.validator_address == order.to))
                    .map(|d| d.amount)
                    .unwrap_or_default();
                if delegated < order.value {
                    return Err(ChainError::InsufficientFunds(format!(
                        "{} delegated to {}, {} requested",
                        delegated, order.to, order.value
                    )));
                }
            }
            let txid = self
                .broadcast("undelegate", coin_name, Vec::new(), vec![order.id])
                .await?;
            let decimals = self.decimals(coin_name)?;
            let native = order.value.to_raw(decimals)?;
            let mut st = self.state.lock();
            let tip = st.tip;
            if let Some(d) = st
                .delegations
                .get_mut(&order.from)
                .and_then(|ds| ds.iter_mut().find(|d| d.validator_address == order.to))
            {
                d.amount = d.amount.saturating_sub(order.value);
            }
            let unstaking = st.unstaking.entry(order.from.clone()).or_default();
            let entry = UnstakingDelegationEntry::from_native(
                tip,
                (tip as i64 + 100) * BLOCK_TIME_SECS,
                native,
                native,
                decimals,
            )?;
            match unstaking.iter_mut().find(|u| u.validator_address == order.to) {
                Some(info) => info.entries.push(entry),
                None => unstaking.push(UnstakingDelegationInfo {
                    delegator_address: order.from.clone(),
                    validator_address: order.to.clone(),
                    entries: vec![entry],
                }),
            }
            Ok(OrdersUpdateResult::new(txid, vec![order.id]))
        })
    }

    fn submit_re_delegation<'a>(
        &'a self,
        coin_name: &'a str,
        order: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>> {
        Box::pin(async move {
            let (src, dst) = match order.action_args.as_deref() {
                Some([src, dst]) => (src.clone(), dst.clone()),
                _ => {
                    return Err(ChainError::Rejected(
                        "redelegation needs [src, dst] validators".to_string(),
                    ))
                }
            };
            let txid = self
                .broadcast("redelegate", coin_name, Vec::new(), vec![order.id])
                .await?;
            let mut st = self.state.lock();
            let entries = st.delegations.entry(order.from.clone()).or_default();
            if let Some(d) = entries.iter_mut().find(|d| d.validator_address == src) {
                d.amount = d.amount.saturating_sub(order.value);
            }
            match entries.iter_mut().find(|d| d.validator_address == dst) {
                Some(d) => d.amount = d.amount + order.value,
                None => entries.push(DelegationInfo {
                    delegator_address: order.from.clone(),
                    validator_address: dst,
                    amount: order.value,
                }),
            }
            Ok(OrdersUpdateResult::new(txid, vec![order.id]))
        })
    }

    fn claim_reward<'a>(
        &'a self,
        coin_name: &'a str,
        order: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>> {
        Box::pin(async move {
            let txid = self
                .broadcast("claim_reward", coin_name, Vec::new(), vec![order.id])
                .await?;
            let mut result = OrdersUpdateResult::new(txid, vec![order.id]);
            result.action_results = Some(vec!["claimed".to_string()]);
            Ok(result)
        })
    }

    fn set_reward_address<'a>(
        &'a self,
        coin_name: &'a str,
        order: &'a Order,
    ) -> BoxFuture<'a, ChainResult<OrdersUpdateResult>> {
        Box::pin(async move {
            let txid = self
                .broadcast("set_reward_address", coin_name, Vec::new(), vec![order.id])
                .await?;
            self.state
                .lock()
                .reward_addresses
                .insert(order.from.clone(), order.to.clone());
            Ok(OrdersUpdateResult::new(txid, vec![order.id]))
        })
    }

    fn get_validators(&self) -> BoxFuture<'_, ChainResult<Vec<ValidatorInfo>>> {
        Box::pin(async move { Ok(self.state.lock().validators.clone()) })
    }

    fn get_validator<'a>(
        &'a self,
        validator: &'a str,
    ) -> BoxFuture<'a, ChainResult<Option<ValidatorInfo>>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .validators
                .iter()
                .find(|v| v.operator_address == validator)
                .cloned())
        })
    }

    fn get_validator_outstanding_rewards<'a>(
        &'a self,
        validator: &'a str,
    ) -> BoxFuture<'a, ChainResult<DisplayAmount>> {
        Box::pin(async move {
            let st = self.state.lock();
            let delegated: DisplayAmount = st
                .delegations
                .values()
                .flatten()
                .filter(|d| d.validator_address == validator)
                .map(|d| d.amount)
                .sum();
            // flat 1% of delegated stake
            Ok(DisplayAmount::new(
                delegated.inner() / rust_decimal::Decimal::ONE_HUNDRED,
            ))
        })
    }

    fn get_delegations<'a>(
        &'a self,
        delegator: &'a str,
    ) -> BoxFuture<'a, ChainResult<Vec<DelegationInfo>>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .delegations
                .get(delegator)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn get_unstaking_delegations<'a>(
        &'a self,
        delegator: &'a str,
    ) -> BoxFuture<'a, ChainResult<Vec<UnstakingDelegationInfo>>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .unstaking
                .get(delegator)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn get_reward_address<'a>(&'a self, delegator: &'a str) -> BoxFuture<'a, ChainResult<String>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .reward_addresses
                .get(delegator)
                .cloned()
                .unwrap_or_else(|| delegator.to_string()))
        })
    }

    fn get_delegation_rewards<'a>(
        &'a self,
        delegator: &'a str,
    ) -> BoxFuture<'a, ChainResult<Vec<DelegationReward>>> {
        Box::pin(async move {
            let coin_name = self.identity.core_type.as_str();
            let decimals = self.decimals(coin_name)?;
            // one percent of the stake, in the chain's micro denomination
            let native_name = format!("u{coin_name}");
            let st = self.state.lock();
            let Some(delegations) = st.delegations.get(delegator) else {
                return Ok(Vec::new());
            };
            delegations
                .iter()
                .map(|d| -> ChainResult<DelegationReward> {
                    let staked = d.amount.to_raw(decimals)?;
                    Ok(DelegationReward::from_native(
                        d.validator_address.clone(),
                        native_name.clone(),
                        RawAmount::new(staked.inner() / 100),
                        coin_name,
                        decimals,
                    )?)
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_core::ChainKey;
    use rust_decimal_macros::dec;

    fn chain() -> SimulatedChain {
        SimulatedChain::new(ChainIdentity {
            key: ChainKey::new("sim"),
            name: "Simulated".to_string(),
            index: 1,
            core_type: "sim".to_string(),
        })
    }

    fn amount(v: rust_decimal::Decimal) -> DisplayAmount {
        DisplayAmount::new(v)
    }

    #[tokio::test]
    async fn test_mine_and_filter() {
        let sim = chain();
        let txid = sim.submit_external("sim", "ext1", "dep1", amount(dec!(2.5)));
        let bn = sim.mine();
        assert_eq!(bn, 1);

        let block = sim.get_block_result(bn).await.unwrap();
        assert_eq!(block.txns.len(), 1);
        let records = sim.filter_transactions(&block.txns, bn, true).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].txid, txid);
        assert_eq!(records[0].to_address, "dep1");
        assert_eq!(
            sim.get_balance("dep1", "sim").await.unwrap().inner(),
            dec!(2.5)
        );
    }

    #[tokio::test]
    async fn test_reorg_changes_hash_and_reverts_balance() {
        let sim = chain();
        sim.submit_external("sim", "ext1", "dep1", amount(dec!(1)));
        sim.mine();
        let before = sim.get_block_result(1).await.unwrap().hash;

        sim.reorg(1, false);
        assert_eq!(sim.tip(), 0);
        assert!(sim.get_block_result(1).await.is_err());
        assert!(sim.get_balance("dep1", "sim").await.unwrap().is_zero());

        sim.mine();
        let after = sim.get_block_result(1).await.unwrap();
        assert_ne!(before, after.hash);
        assert!(after.txns.is_empty());
    }

    #[tokio::test]
    async fn test_order_state_confirmations() {
        let sim = chain();
        let order = Order::new(OrderId(1), "hot1", "userA", amount(dec!(10)));
        let results = sim.withdraw("sim", std::slice::from_ref(&order)).await.unwrap();
        let txid = results[0].txid.clone();
        let info = OrderInfo {
            txid,
            meta: None,
            coin_name: "sim".to_string(),
            n: 0,
            from: "hot1".to_string(),
            to: "userA".to_string(),
            value: order.value,
            block: None,
        };

        let pending = sim.get_order_state(&info, 0).await.unwrap();
        assert!(!pending.found);

        let bn = sim.mine();
        sim.mine_blocks(6);
        let st = sim.get_order_state(&info, sim.tip()).await.unwrap();
        assert!(st.found);
        assert_eq!(st.block, Some(bn));
        assert_eq!(st.confirmations_at(sim.tip()), 6);
    }

    #[tokio::test]
    async fn test_timeout_still_submits() {
        let sim = chain();
        sim.fail_next(SimOp::Broadcast, SimFailure::Timeout);
        let order = Order::new(OrderId(7), "hot1", "userA", amount(dec!(1)));
        let err = sim.withdraw("sim", std::slice::from_ref(&order)).await.unwrap_err();
        assert!(err.is_outcome_unknown());
        assert_eq!(sim.broadcast_count(), 1);
        assert_eq!(sim.mempool_len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_submits_nothing() {
        let sim = chain();
        sim.fail_next(SimOp::Broadcast, SimFailure::Unreachable);
        let order = Order::new(OrderId(7), "hot1", "userA", amount(dec!(1)));
        assert!(sim.withdraw("sim", std::slice::from_ref(&order)).await.is_err());
        assert_eq!(sim.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_validate_address_tri_state() {
        let sim = chain();
        assert_eq!(sim.validate_address("dep1", "sim").await, ValidationOutcome::Valid);
        assert_eq!(
            sim.validate_address("invalid-x", "sim").await,
            ValidationOutcome::Invalid
        );
        assert_eq!(
            sim.validate_address("err:boom", "sim").await,
            ValidationOutcome::Error(DEFAULT_VALIDATION_ERROR_CODE)
        );
    }

    #[tokio::test]
    async fn test_fee_paid_in_other_coin_is_zero() {
        let sim = chain().with_coin("usdt", 6);
        sim.set_fee(Some(amount(dec!(0.01))));
        let core = sim.estimate_and_check_fee("sim", "withdraw", "hot1", 3).await.unwrap();
        assert_eq!(core, Some(amount(dec!(0.03))));
        let token = sim.estimate_and_check_fee("usdt", "withdraw", "hot1", 3).await.unwrap();
        assert_eq!(token, Some(DisplayAmount::ZERO));
        sim.set_fee(None);
        assert_eq!(
            sim.estimate_and_check_fee("sim", "withdraw", "hot1", 1).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_scatter_splits_total() {
        let sim = chain();
        let output = Order::new(OrderId(3), "hot1", "hot1", amount(dec!(9)));
        let targets = vec!["a1,2".to_string(), "a2,1".to_string()];
        sim.scatter("sim", "hot1", amount(dec!(9)), &targets, &output)
            .await
            .unwrap();
        sim.mine();
        assert_eq!(sim.get_balance("a1", "sim").await.unwrap().inner(), dec!(6));
        assert_eq!(sim.get_balance("a2", "sim").await.unwrap().inner(), dec!(3));
    }

    #[tokio::test]
    async fn test_delegation_round_trip() {
        let sim = chain();
        let order = Order::new(OrderId(1), "del1", "valoper1", amount(dec!(100)));
        sim.submit_delegation("sim", &order).await.unwrap();
        let ds = sim.get_delegations("del1").await.unwrap();
        assert_eq!(ds[0].amount.inner(), dec!(100));

        let undel = Order::new(OrderId(2), "del1", "valoper1", amount(dec!(40)));
        sim.submit_un_delegation("sim", &undel).await.unwrap();
        let unstaking = sim.get_unstaking_delegations("del1").await.unwrap();
        assert_eq!(unstaking[0].total().inner(), dec!(40));
        assert_eq!(
            sim.get_delegations("del1").await.unwrap()[0].amount.inner(),
            dec!(60)
        );
        assert_eq!(
            unstaking[0].entries[0].native_amount,
            RawAmount::new(4_000_000_000)
        );

        let rewards = sim.get_delegation_rewards("del1").await.unwrap();
        assert_eq!(rewards.len(), 1);
        assert_eq!(rewards[0].native_name, "usim");
        assert_eq!(rewards[0].coin_name, "sim");
        assert_eq!(rewards[0].native_amount, RawAmount::new(60_000_000));
        assert_eq!(rewards[0].amount.inner(), dec!(0.6));
    }
}
