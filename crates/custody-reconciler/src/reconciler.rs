//! Order reconciliation for one chain.
//!
//! The reconciler owns every status change of every order. It merges three
//! sources of truth:
//! - broadcast results returned by the adapter (`pending -> broadcasting -> seen`)
//! - scanned records (deposits, inclusion of our own transactions)
//! - periodic order-state observations (`seen -> confirmed`, resends)
//!
//! Reorgs detected by the scanner arrive through [`OrderReconciler::rollback_from`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use custody_chain::{ChainError, ChainHandlers, ChainResult, DynChainAdapter};
use custody_core::{
    AwaitPlan, BlockNumber, ChainKey, DisplayAmount, IncomingRecord, InterventionReason,
    ManualIntervention, NotiState, Order, OrderId, OrderKind, OrderStatus, OrdersUpdateResult,
    RecordClass, RecordKey, TrackedOrder, ValidationOutcome,
};
use custody_registry::AddressRegistry;
use custody_store::{JournalEntry, JournalWriter, LedgerStore, StoreError};
use custody_telemetry::Metrics;

use crate::deferred::{plan_satisfied, readiness, Readiness};
use crate::error::{ReconcileError, ReconcileResult};
use crate::hooks::{DefaultOrderHooks, HookRunner, OrderHooks};
use crate::locks::{BroadcastLocks, LockKey};
use crate::policy::ConfirmationPolicy;

// ============================================================================
// Requests and reports
// ============================================================================

/// Parameters of a new outgoing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderDraft {
    pub kind: OrderKind,
    pub coin_name: String,
    pub from: String,
    pub to: String,
    pub value: DisplayAmount,
    pub action: Option<String>,
    pub action_args: Option<Vec<String>>,
    pub action_memo: Option<String>,
    pub auth: Option<String>,
    pub depends_on: Vec<OrderId>,
}

impl OrderDraft {
    pub fn new(
        kind: OrderKind,
        coin_name: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        value: DisplayAmount,
    ) -> Self {
        Self {
            kind,
            coin_name: coin_name.into(),
            from: from.into(),
            to: to.into(),
            value,
            action: None,
            action_args: None,
            action_memo: None,
            auth: None,
            depends_on: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>, args: Vec<String>) -> Self {
        self.action = Some(action.into());
        self.action_args = Some(args);
        self
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
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

    #[must_use]
    pub fn depends_on(mut self, ids: Vec<OrderId>) -> Self {
        self.depends_on = ids;
        self
    }

    fn into_order(self, id: OrderId) -> (Order, OrderKind, String, Vec<OrderId>) {
        let order = Order {
            id,
            from: self.from,
            to: self.to,
            value: self.value,
            action: self.action,
            action_args: self.action_args,
            action_memo: self.action_memo,
            auth: self.auth,
        };
        (order, self.kind, self.coin_name, self.depends_on)
    }
}

/// Result of trying to broadcast one order (or one batch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Adapter returned results; acknowledged orders are `seen`.
    Submitted(Vec<OrdersUpdateResult>),
    /// Fee check reported insufficient funds; nothing was broadcast.
    Aborted(String),
    /// Another broadcast holds the lock.
    Locked,
    /// Await plan or dependencies hold the order back.
    NotReady(Readiness),
    /// No longer pending.
    Skipped(OrderStatus),
    /// Broadcast failed; the order carries the message.
    Failed(String),
}

/// Summary of one [`OrderReconciler::settle`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettleReport {
    pub submitted: Vec<OrderId>,
    pub aborted: Vec<OrderId>,
    pub deferred: Vec<OrderId>,
    pub blocked: Vec<OrderId>,
    pub locked: Vec<OrderId>,
    pub failed: Vec<OrderId>,
}

impl SettleReport {
    fn note(&mut self, ids: &[OrderId], outcome: &DispatchOutcome) {
        let bucket = match outcome {
            DispatchOutcome::Submitted(_) => &mut self.submitted,
            DispatchOutcome::Aborted(_) => &mut self.aborted,
            DispatchOutcome::Locked => &mut self.locked,
            DispatchOutcome::NotReady(Readiness::Blocked) => &mut self.blocked,
            DispatchOutcome::NotReady(_) => &mut self.deferred,
            DispatchOutcome::Failed(_) => &mut self.failed,
            DispatchOutcome::Skipped(_) => return,
        };
        bucket.extend_from_slice(ids);
    }

    pub fn is_empty(&self) -> bool {
        self.submitted.is_empty()
            && self.aborted.is_empty()
            && self.deferred.is_empty()
            && self.blocked.is_empty()
            && self.locked.is_empty()
            && self.failed.is_empty()
    }
}

/// Summary of one reorg rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub height: BlockNumber,
    pub depth: u64,
    pub rolled_back: Vec<OrderId>,
    pub deferred: Vec<OrderId>,
    /// Deeper than the reorg window; nothing was changed.
    pub unrecoverable: bool,
}

// ============================================================================
// OrderReconciler
// ============================================================================

/// Reconciliation engine of one chain.
pub struct OrderReconciler {
    chain: ChainKey,
    handlers: Arc<ChainHandlers>,
    store: Arc<dyn LedgerStore>,
    registry: Arc<AddressRegistry>,
    hooks: HookRunner,
    policy: ConfirmationPolicy,
    locks: BroadcastLocks,
    journal: Option<Mutex<JournalWriter>>,
}

impl std::fmt::Debug for OrderReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderReconciler")
            .field("chain", &self.chain)
            .field("policy", &self.policy)
            .field("locks_held", &self.locks.held_count())
            .finish()
    }
}

impl OrderReconciler {
    pub fn new(
        handlers: Arc<ChainHandlers>,
        store: Arc<dyn LedgerStore>,
        registry: Arc<AddressRegistry>,
        policy: ConfirmationPolicy,
    ) -> Self {
        let chain = handlers.identity().key.clone();
        let hooks = HookRunner::new(chain.as_str(), Arc::new(DefaultOrderHooks), policy);
        Self {
            chain,
            handlers,
            store,
            registry,
            hooks,
            policy,
            locks: BroadcastLocks::new(),
            journal: None,
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn OrderHooks>) -> Self {
        self.hooks = HookRunner::new(self.chain.as_str(), hooks, self.policy);
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: JournalWriter) -> Self {
        self.journal = Some(Mutex::new(journal));
        self
    }

    pub fn chain(&self) -> &ChainKey {
        &self.chain
    }

    pub fn handlers(&self) -> &Arc<ChainHandlers> {
        &self.handlers
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<AddressRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &ConfirmationPolicy {
        &self.policy
    }

    pub fn locks(&self) -> &BroadcastLocks {
        &self.locks
    }

    pub fn order(&self, id: OrderId) -> Option<TrackedOrder> {
        self.store.order(id)
    }

    pub fn interventions(&self) -> Vec<ManualIntervention> {
        self.store.interventions()
    }

    /// Handler registered for `coin_name`, else the chain default.
    pub fn adapter(&self, coin_name: &str) -> DynChainAdapter {
        self.handlers.get_handler(coin_name)
    }

    /// Block number used when the caller has none: the scan cursor.
    pub fn current_bn(&self) -> BlockNumber {
        self.store.cursor().unwrap_or(0)
    }

    pub fn flush_journal(&self) -> ReconcileResult<()> {
        if let Some(journal) = &self.journal {
            journal.lock().flush()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals: transitions, journal, interventions
    // ------------------------------------------------------------------

    fn journal(&self, entry: JournalEntry) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.lock().append(entry) {
                warn!(chain = %self.chain, error = %e, "Failed to append journal entry");
            }
        }
    }

    fn raise_intervention(&self, order_id: OrderId, reason: InterventionReason, message: String) {
        let record = ManualIntervention::new(order_id, reason, message);
        error!(
            chain = %self.chain,
            order_id = %order_id,
            reason = %reason,
            message = %record.message,
            "Manual intervention required"
        );
        Metrics::intervention(self.chain.as_str(), &reason.to_string());
        self.journal(JournalEntry::Intervention(record.clone()));
        self.store.push_intervention(record);
    }

    /// Checked status change bracketed by the notification hooks.
    async fn transition(
        &self,
        id: OrderId,
        to: OrderStatus,
        bn: Option<BlockNumber>,
        note: Option<String>,
        mut mutate: impl FnMut(&mut TrackedOrder) + Send,
    ) -> ReconcileResult<TrackedOrder> {
        let current = self.store.order(id).ok_or(ReconcileError::UnknownOrder(id))?;
        self.hooks.pre(&current, to).await;

        let updated = self.store.update_order(id, &mut |o| {
            mutate(o);
            o.transition(to, bn, note.clone())
        })?;
        debug!(
            chain = %self.chain,
            order_id = %id,
            kind = %updated.kind,
            from = %current.status,
            to = %to,
            bn = ?bn,
            "Order transition"
        );
        Metrics::order_transition(self.chain.as_str(), updated.kind.biz_type(), &to.to_string());
        self.journal(JournalEntry::Transition {
            at: Utc::now(),
            order_id: id,
            kind: updated.kind,
            from: Some(current.status),
            to,
            bn,
            txid: updated.txid.clone(),
            note,
        });
        if to == OrderStatus::Rejected && updated.kind == OrderKind::SweepToHot {
            self.release_settlement(&updated, bn)?;
        }

        self.hooks.after(&updated).await;
        Ok(updated)
    }

    /// Set the order message; repeated identical notes are not re-recorded.
    fn annotate(&self, id: OrderId, bn: Option<BlockNumber>, note: &str) -> ReconcileResult<TrackedOrder> {
        Ok(self.store.update_order(id, &mut |o| {
            if o.message.as_deref() != Some(note) {
                o.annotate(bn, note);
            }
            Ok(())
        })?)
    }

    fn journal_creation(&self, order: &TrackedOrder) {
        Metrics::order_transition(
            self.chain.as_str(),
            order.kind.biz_type(),
            &order.status.to_string(),
        );
        self.journal(JournalEntry::Transition {
            at: Utc::now(),
            order_id: order.id(),
            kind: order.kind,
            from: None,
            to: order.status,
            bn: order.block,
            txid: order.txid.clone(),
            note: None,
        });
    }

    async fn fail_critical(
        &self,
        id: OrderId,
        bn: BlockNumber,
        reason: String,
    ) -> ReconcileResult<TrackedOrder> {
        let message = reason.clone();
        let updated = self
            .transition(id, OrderStatus::FailedCritical, Some(bn), Some(reason.clone()), move |o| {
                o.message = Some(message.clone())
            })
            .await?;
        self.raise_intervention(id, InterventionReason::FailedCritical, reason);
        Ok(updated)
    }

    /// Make a rejected sweep's deposits sweepable again.
    fn release_settlement(&self, sweep: &TrackedOrder, bn: Option<BlockNumber>) -> ReconcileResult<()> {
        let sweep_id = sweep.id();
        for dep in &sweep.depends_on {
            self.store.update_order(*dep, &mut |o| {
                if o.settled_by == Some(sweep_id) {
                    o.settled_by = None;
                    o.annotate(bn, format!("sweep {sweep_id} rejected, deposit released"));
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Order creation
    // ------------------------------------------------------------------

    /// Create a new outgoing order in `pending`.
    pub async fn enqueue(&self, draft: OrderDraft) -> ReconcileResult<TrackedOrder> {
        if !draft.kind.is_outgoing() {
            return Err(ReconcileError::InvalidOrder(format!(
                "{} orders are created by the scanner",
                draft.kind
            )));
        }
        let value_optional = matches!(
            draft.kind,
            OrderKind::ClaimReward | OrderKind::SetRewardAddress
        );
        if draft.value.inner().is_sign_negative()
            || (!value_optional && !draft.value.is_positive())
        {
            return Err(ReconcileError::InvalidOrder(format!(
                "{} value must be positive, got {}",
                draft.kind, draft.value
            )));
        }
        if matches!(draft.kind, OrderKind::Withdraw | OrderKind::SweepToCold) {
            let adapter = self.adapter(&draft.coin_name);
            match adapter.validate_address(&draft.to, &draft.coin_name).await {
                ValidationOutcome::Valid => {}
                ValidationOutcome::Invalid => {
                    return Err(ReconcileError::InvalidOrder(format!(
                        "invalid destination address {}",
                        draft.to
                    )))
                }
                ValidationOutcome::Error(code) => {
                    return Err(ReconcileError::InvalidOrder(format!(
                        "address validation error {code} for {}",
                        draft.to
                    )))
                }
            }
        }

        let id = self.store.next_order_id();
        let (order, kind, coin_name, depends_on) = draft.into_order(id);
        let mut tracked = TrackedOrder::new_outgoing(order, kind, coin_name);
        tracked.depends_on = depends_on;
        self.store.insert_order(tracked.clone())?;
        info!(
            chain = %self.chain,
            order_id = %id,
            kind = %tracked.kind,
            coin = %tracked.coin_name,
            to = %tracked.order.to,
            value = %tracked.order.value,
            "Order created"
        );
        self.journal_creation(&tracked);
        Ok(tracked)
    }

    pub async fn create_withdrawal(
        &self,
        coin_name: &str,
        from: &str,
        to: &str,
        value: DisplayAmount,
        memo: Option<String>,
    ) -> ReconcileResult<TrackedOrder> {
        let mut draft = OrderDraft::new(OrderKind::Withdraw, coin_name, from, to, value);
        draft.action_memo = memo;
        self.enqueue(draft).await
    }

    pub async fn create_cold_sweep(
        &self,
        coin_name: &str,
        hot: &str,
        cold: &str,
        value: DisplayAmount,
    ) -> ReconcileResult<TrackedOrder> {
        self.enqueue(OrderDraft::new(OrderKind::SweepToCold, coin_name, hot, cold, value))
            .await
    }

    pub async fn create_invoke(
        &self,
        coin_name: &str,
        from: &str,
        contract: &str,
        value: DisplayAmount,
        method: &str,
        params: Vec<String>,
    ) -> ReconcileResult<TrackedOrder> {
        let draft = OrderDraft::new(OrderKind::Invoke, coin_name, from, contract, value)
            .with_action(method, params);
        self.enqueue(draft).await
    }

    /// Spread `total` from `from` over `targets` (`"address,n"` each).
    pub async fn create_scatter(
        &self,
        coin_name: &str,
        from: &str,
        total: DisplayAmount,
        targets: Vec<String>,
    ) -> ReconcileResult<TrackedOrder> {
        let mut first = None;
        for target in &targets {
            let (address, count) = target.split_once(',').ok_or_else(|| {
                ReconcileError::InvalidOrder(format!("scatter target {target} is not address,n"))
            })?;
            match count.trim().parse::<u32>() {
                Ok(n) if n > 0 => {}
                _ => {
                    return Err(ReconcileError::InvalidOrder(format!(
                        "scatter target {target} has no positive count"
                    )))
                }
            }
            first.get_or_insert_with(|| address.trim().to_string());
        }
        let to = first.ok_or_else(|| ReconcileError::InvalidOrder("scatter without targets".into()))?;
        let draft = OrderDraft::new(OrderKind::Scatter, coin_name, from, to, total).with_args(targets);
        self.enqueue(draft).await
    }

    /// Create one sweep per deposit address holding confirmed, unswept
    /// deposits. The sweeps depend on those deposits.
    pub async fn sweep_deposits(
        &self,
        coin_name: &str,
        hot_address: &str,
        bn: BlockNumber,
    ) -> ReconcileResult<Vec<OrderId>> {
        let mut by_address: BTreeMap<String, Vec<OrderId>> = BTreeMap::new();
        for order in self.store.orders_by_status(&[OrderStatus::Confirmed]) {
            if order.kind != OrderKind::Deposit
                || order.coin_name != coin_name
                || order.settled_by.is_some()
                || matches!(order.class, Some(RecordClass::Special | RecordClass::Internal))
                || !self.registry.is_deposit_address(coin_name, &order.order.to)
            {
                continue;
            }
            by_address.entry(order.order.to.clone()).or_default().push(order.id());
        }

        let mut created = Vec::new();
        for (address, candidates) in by_address {
            let Some(_guard) = self.locks.try_acquire(LockKey::address(coin_name, &address)) else {
                debug!(chain = %self.chain, address = %address, "Sweep already in progress");
                continue;
            };
            // re-read under the address lock
            let deposits: Vec<TrackedOrder> = candidates
                .iter()
                .filter_map(|id| self.store.order(*id))
                .filter(|o| o.status == OrderStatus::Confirmed && o.settled_by.is_none())
                .collect();
            let total: DisplayAmount = deposits.iter().map(|d| d.order.value).sum();
            if !total.is_positive() {
                continue;
            }
            let ids: Vec<OrderId> = deposits.iter().map(TrackedOrder::id).collect();
            let draft =
                OrderDraft::new(OrderKind::SweepToHot, coin_name, &address, hot_address, total)
                    .depends_on(ids.clone());
            let sweep_id = self.enqueue(draft).await?.id();
            for id in &ids {
                self.store.update_order(*id, &mut |o| {
                    o.settled_by = Some(sweep_id);
                    o.annotate(Some(bn), format!("swept by order {sweep_id}"));
                    Ok(())
                })?;
            }
            info!(
                chain = %self.chain,
                coin = coin_name,
                address = %address,
                deposits = ids.len(),
                total = %total,
                sweep_id = %sweep_id,
                "Sweep created"
            );
            created.push(sweep_id);
        }
        Ok(created)
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    /// Broadcast every ready pending order of `coin_name`.
    ///
    /// Withdrawals are batched per source address, bounded by the adapter's
    /// batch count; every other kind goes out on its own.
    pub async fn settle(&self, coin_name: &str, bn: BlockNumber) -> ReconcileResult<SettleReport> {
        let mut report = SettleReport::default();
        let mut withdrawals: BTreeMap<String, Vec<OrderId>> = BTreeMap::new();

        for order in self.store.orders_by_status(&[OrderStatus::Pending]) {
            if order.coin_name != coin_name || !order.kind.is_outgoing() {
                continue;
            }
            let id = order.id();
            match readiness(&order, bn, self.store.as_ref()) {
                Readiness::Ready => {}
                Readiness::Orphaned(dep) => {
                    self.abandon_orphaned(id, dep, bn).await?;
                    report.aborted.push(id);
                    continue;
                }
                not_ready => {
                    report.note(&[id], &DispatchOutcome::NotReady(not_ready));
                    continue;
                }
            }
            if order.kind == OrderKind::Withdraw {
                withdrawals.entry(order.order.from.clone()).or_default().push(id);
                continue;
            }
            let outcome = self.dispatch_single(id, bn).await?;
            report.note(&[id], &outcome);
        }

        let batch_size = self
            .adapter(coin_name)
            .get_send_orders_batch_count(coin_name)
            .max(1);
        for (from, ids) in withdrawals {
            for chunk in ids.chunks(batch_size) {
                let outcome = self
                    .dispatch_withdraw_batch(coin_name, &from, chunk, bn, &mut report)
                    .await?;
                if matches!(outcome, Some(DispatchOutcome::Aborted(_))) {
                    // later batches from the same address would fail the same check
                    break;
                }
            }
        }

        if !report.is_empty() {
            info!(
                chain = %self.chain,
                coin = coin_name,
                bn,
                submitted = report.submitted.len(),
                aborted = report.aborted.len(),
                deferred = report.deferred.len(),
                blocked = report.blocked.len(),
                failed = report.failed.len(),
                "Settle pass complete"
            );
        }
        Ok(report)
    }

    /// Reject a pending order whose dependency can never confirm. A rejected
    /// sweep hands its remaining deposits back to the next sweep pass.
    async fn abandon_orphaned(
        &self,
        id: OrderId,
        dep: OrderId,
        bn: BlockNumber,
    ) -> ReconcileResult<TrackedOrder> {
        let status = self
            .store
            .order(dep)
            .map_or_else(|| "missing".to_string(), |o| o.status.to_string());
        let reason = format!("dependency {dep} is {status} and will not confirm");
        warn!(chain = %self.chain, order_id = %id, dependency = %dep, status = %status, "Rejecting orphaned order");
        let message = reason.clone();
        self.transition(id, OrderStatus::Rejected, Some(bn), Some(reason), move |o| {
            o.message = Some(message.clone())
        })
        .await
    }

    /// Broadcast one order now, whatever its kind.
    pub async fn dispatch(&self, id: OrderId, bn: BlockNumber) -> ReconcileResult<DispatchOutcome> {
        let order = self.store.order(id).ok_or(ReconcileError::UnknownOrder(id))?;
        if order.status != OrderStatus::Pending {
            return Ok(DispatchOutcome::Skipped(order.status));
        }
        match readiness(&order, bn, self.store.as_ref()) {
            Readiness::Ready => self.dispatch_single(id, bn).await,
            not_ready => Ok(DispatchOutcome::NotReady(not_ready)),
        }
    }

    async fn dispatch_single(&self, id: OrderId, bn: BlockNumber) -> ReconcileResult<DispatchOutcome> {
        let order = self.store.order(id).ok_or(ReconcileError::UnknownOrder(id))?;
        let key = if order.kind.locks_source_address() {
            LockKey::address(&order.coin_name, &order.order.from)
        } else {
            LockKey::Order(id)
        };
        let Some(_guard) = self.locks.try_acquire(key) else {
            debug!(chain = %self.chain, order_id = %id, "Broadcast lock held, skipping");
            return Ok(DispatchOutcome::Locked);
        };
        // re-read under the lock: a concurrent settle may have moved it
        let order = self.store.order(id).ok_or(ReconcileError::UnknownOrder(id))?;
        if order.status != OrderStatus::Pending {
            return Ok(DispatchOutcome::Skipped(order.status));
        }

        let adapter = self.adapter(&order.coin_name);
        if let Some(outcome) = self
            .check_fee(&adapter, &order.coin_name, order.kind, &order.order.from, &[id], bn)
            .await?
        {
            return Ok(outcome);
        }

        self.mark_broadcasting(&[id], bn).await?;
        info!(
            chain = %self.chain,
            order_id = %id,
            kind = %order.kind,
            from = %order.order.from,
            to = %order.order.to,
            value = %order.order.value,
            "Broadcasting order"
        );
        let result = self.broadcast_single(&adapter, &order).await;
        self.absorb(order.kind, &[id], result, bn).await
    }

    async fn dispatch_withdraw_batch(
        &self,
        coin_name: &str,
        from: &str,
        ids: &[OrderId],
        bn: BlockNumber,
        report: &mut SettleReport,
    ) -> ReconcileResult<Option<DispatchOutcome>> {
        let mut guards = Vec::with_capacity(ids.len());
        let mut batch = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(guard) = self.locks.try_acquire(LockKey::Order(*id)) else {
                report.locked.push(*id);
                continue;
            };
            match self.store.order(*id) {
                Some(order) if order.status == OrderStatus::Pending => {
                    guards.push(guard);
                    batch.push(order.order);
                }
                _ => {}
            }
        }
        if batch.is_empty() {
            return Ok(None);
        }
        let batch_ids: Vec<OrderId> = batch.iter().map(|o| o.id).collect();

        let adapter = self.adapter(coin_name);
        if let Some(outcome) = self
            .check_fee(&adapter, coin_name, OrderKind::Withdraw, from, &batch_ids, bn)
            .await?
        {
            report.note(&batch_ids, &outcome);
            return Ok(Some(outcome));
        }

        self.mark_broadcasting(&batch_ids, bn).await?;
        info!(
            chain = %self.chain,
            coin = coin_name,
            from,
            count = batch_ids.len(),
            "Broadcasting withdraw batch"
        );
        let result = adapter.withdraw(coin_name, &batch).await;
        let outcome = self.absorb(OrderKind::Withdraw, &batch_ids, result, bn).await?;
        report.note(&batch_ids, &outcome);
        drop(guards);
        Ok(Some(outcome))
    }

    /// `Some(outcome)` when the fee check stops the broadcast.
    async fn check_fee(
        &self,
        adapter: &DynChainAdapter,
        coin_name: &str,
        kind: OrderKind,
        from: &str,
        ids: &[OrderId],
        bn: BlockNumber,
    ) -> ReconcileResult<Option<DispatchOutcome>> {
        match adapter
            .estimate_and_check_fee(coin_name, kind.biz_type(), from, ids.len())
            .await
        {
            Ok(Some(fee)) => {
                debug!(chain = %self.chain, coin = coin_name, kind = %kind, fee = %fee, "Fee check passed");
                Ok(None)
            }
            Ok(None) => {
                let msg = format!("insufficient fee funds on {from} for {} order(s)", ids.len());
                warn!(chain = %self.chain, coin = coin_name, kind = %kind, from, "Batch aborted: insufficient fee funds");
                Metrics::broadcast(self.chain.as_str(), kind.biz_type(), "fee_insufficient");
                for id in ids {
                    self.annotate(*id, Some(bn), &msg)?;
                }
                Ok(Some(DispatchOutcome::Aborted(msg)))
            }
            Err(e) => {
                let msg = format!("fee estimation failed: {e}");
                warn!(chain = %self.chain, coin = coin_name, kind = %kind, error = %e, "Fee estimation failed");
                for id in ids {
                    self.annotate(*id, Some(bn), &msg)?;
                }
                Ok(Some(DispatchOutcome::Failed(msg)))
            }
        }
    }

    async fn mark_broadcasting(&self, ids: &[OrderId], bn: BlockNumber) -> ReconcileResult<()> {
        for id in ids {
            self.transition(*id, OrderStatus::Broadcasting, Some(bn), None, |o| {
                o.send_attempts += 1;
                o.broadcast_at_bn = Some(bn);
                o.message = None;
            })
            .await?;
        }
        Ok(())
    }

    async fn broadcast_single(
        &self,
        adapter: &DynChainAdapter,
        order: &TrackedOrder,
    ) -> ChainResult<Vec<OrdersUpdateResult>> {
        let coin = order.coin_name.as_str();
        let o = &order.order;
        match order.kind {
            OrderKind::Withdraw => adapter.withdraw(coin, std::slice::from_ref(o)).await,
            OrderKind::SweepToHot => adapter
                .sweep_to_hot(coin, &o.from, o.value, o)
                .await
                .map(|r| vec![r.update]),
            OrderKind::SweepToCold => adapter
                .sweep_to_cold(coin, o.value, o)
                .await
                .map(|r| vec![r.update]),
            OrderKind::Invoke => adapter.invoke_general(coin, o).await.map(|r| vec![r]),
            OrderKind::Scatter => {
                let targets = o.action_args.clone().unwrap_or_default();
                adapter
                    .scatter(coin, &o.from, o.value, &targets, o)
                    .await
                    .map(|r| vec![r])
            }
            OrderKind::Delegate
            | OrderKind::Undelegate
            | OrderKind::Redelegate
            | OrderKind::ClaimReward
            | OrderKind::SetRewardAddress => {
                let stake = self.handlers.get_stake_handler().ok_or_else(|| {
                    ChainError::NotSupported(format!("{} has no stake handler", self.chain))
                })?;
                let result = match order.kind {
                    OrderKind::Delegate => stake.submit_delegation(coin, o).await,
                    OrderKind::Undelegate => stake.submit_un_delegation(coin, o).await,
                    OrderKind::Redelegate => stake.submit_re_delegation(coin, o).await,
                    OrderKind::ClaimReward => stake.claim_reward(coin, o).await,
                    _ => stake.set_reward_address(coin, o).await,
                };
                result.map(|r| vec![r])
            }
            OrderKind::Deposit | OrderKind::External => Err(ChainError::NotSupported(format!(
                "{} orders are never broadcast",
                order.kind
            ))),
        }
    }

    /// Fold a broadcast outcome into the submitted orders.
    async fn absorb(
        &self,
        kind: OrderKind,
        submitted: &[OrderId],
        result: ChainResult<Vec<OrdersUpdateResult>>,
        bn: BlockNumber,
    ) -> ReconcileResult<DispatchOutcome> {
        let chain = self.chain.as_str();
        let results = match result {
            Ok(results) => results,
            Err(e) if e.is_outcome_unknown() => {
                let msg = format!("broadcast outcome unknown: {e}");
                Metrics::broadcast(chain, kind.biz_type(), "timeout");
                for id in submitted {
                    self.annotate(*id, Some(bn), &msg)?;
                    self.raise_intervention(*id, InterventionReason::BroadcastOutcomeUnknown, msg.clone());
                }
                return Ok(DispatchOutcome::Failed(msg));
            }
            Err(e) if e.is_transient() || matches!(e, ChainError::InsufficientFunds(_)) => {
                let msg = format!("broadcast not submitted: {e}");
                let outcome = if e.is_transient() { "unreachable" } else { "insufficient_funds" };
                warn!(chain = %self.chain, kind = %kind, error = %e, "Broadcast failed before submission");
                Metrics::broadcast(chain, kind.biz_type(), outcome);
                for id in submitted {
                    let message = msg.clone();
                    self.transition(*id, OrderStatus::Pending, Some(bn), Some(msg.clone()), move |o| {
                        o.message = Some(message.clone())
                    })
                    .await?;
                }
                return Ok(DispatchOutcome::Failed(msg));
            }
            Err(e) => {
                let msg = format!("broadcast rejected: {e}");
                warn!(chain = %self.chain, kind = %kind, error = %e, "Broadcast rejected");
                Metrics::broadcast(chain, kind.biz_type(), "rejected");
                for id in submitted {
                    let message = msg.clone();
                    self.transition(*id, OrderStatus::Rejected, Some(bn), Some(msg.clone()), move |o| {
                        o.message = Some(message.clone())
                    })
                    .await?;
                }
                return Ok(DispatchOutcome::Failed(msg));
            }
        };

        let mut acknowledged = BTreeSet::new();
        for result in &results {
            if result.await_plan.is_some() && !result.rollback {
                warn!(
                    chain = %self.chain,
                    txid = %result.txid,
                    "Await plan without rollback dropped"
                );
            }
            let plan = result.effective_await_plan();
            for (idx, id) in result.order_ids.iter().enumerate() {
                if !submitted.contains(id) {
                    warn!(chain = %self.chain, order_id = %id, "Result names an order outside the broadcast");
                    continue;
                }
                if !acknowledged.insert(*id) {
                    continue;
                }
                if result.rollback {
                    let note = match plan {
                        Some(plan) => format!("broadcast rolled back by adapter, awaiting {plan:?}"),
                        None => "broadcast rolled back by adapter".to_string(),
                    };
                    Metrics::broadcast(chain, kind.biz_type(), "rolled_back");
                    self.transition(*id, OrderStatus::Pending, Some(bn), Some(note), move |o| {
                        o.await_plan = plan;
                    })
                    .await?;
                    continue;
                }
                let txid = result.txid.clone();
                let meta = result.meta.clone();
                let memo = result.action_memo.clone();
                let action_results = result.action_results.clone();
                let n = idx as u32;
                self.transition(
                    *id,
                    OrderStatus::Seen,
                    Some(bn),
                    Some(format!("txid {}", result.txid)),
                    move |o| {
                        o.txid = Some(txid.clone());
                        o.meta = meta.clone();
                        o.n = n;
                        if memo.is_some() {
                            o.order.action_memo = memo.clone();
                        }
                        if action_results.is_some() {
                            o.action_results = action_results.clone();
                        }
                    },
                )
                .await?;
                Metrics::broadcast(chain, kind.biz_type(), "submitted");
            }
        }

        for id in submitted.iter().filter(|id| !acknowledged.contains(id)) {
            let msg = "adapter returned no result for this order".to_string();
            self.annotate(*id, Some(bn), &msg)?;
            self.raise_intervention(*id, InterventionReason::BroadcastOutcomeUnknown, msg);
        }
        Ok(DispatchOutcome::Submitted(results))
    }

    // ------------------------------------------------------------------
    // Scanned records
    // ------------------------------------------------------------------

    /// Resolve classified records against existing orders. Returns the
    /// orders created or updated; duplicates are ignored.
    pub async fn apply_records(&self, records: &[IncomingRecord]) -> ReconcileResult<Vec<TrackedOrder>> {
        let mut touched = Vec::new();
        for record in records {
            if let Some(order) = self.apply_record(record).await? {
                touched.push(order);
            }
        }
        Ok(touched)
    }

    async fn apply_record(&self, record: &IncomingRecord) -> ReconcileResult<Option<TrackedOrder>> {
        let key = record.key();
        if let Some(id) = self.store.record_link(&key) {
            return self.reobserve(id, record).await;
        }
        if self.registry.contains(&record.coin_name, &record.from_address) {
            return self.match_outgoing(record, key).await;
        }
        self.create_deposit(record).await
    }

    async fn reobserve(&self, id: OrderId, record: &IncomingRecord) -> ReconcileResult<Option<TrackedOrder>> {
        let Some(order) = self.store.order(id) else {
            return Ok(None);
        };
        if order.status != OrderStatus::RolledBack {
            debug!(chain = %self.chain, record = %record.key(), order_id = %id, "Duplicate record ignored");
            Metrics::record_discarded(self.chain.as_str(), "duplicate");
            return Ok(None);
        }
        let bn = record.bn;
        let updated = self
            .transition(id, OrderStatus::Seen, Some(bn), Some(format!("re-included at block {bn}")), move |o| {
                o.block = Some(bn);
                o.confirmations = 0;
            })
            .await?;
        Ok(Some(updated))
    }

    async fn match_outgoing(&self, record: &IncomingRecord, key: RecordKey) -> ReconcileResult<Option<TrackedOrder>> {
        let candidates: Vec<TrackedOrder> = self
            .store
            .orders_by_txid(&record.txid)
            .into_iter()
            .filter_map(|id| self.store.order(id))
            .filter(|o| o.kind.is_outgoing() && o.coin_name == record.coin_name)
            .collect();
        let matched = candidates
            .iter()
            .find(|o| o.n == record.n)
            .or_else(|| candidates.first())
            .cloned()
            .or_else(|| self.find_unacknowledged(record));

        let Some(order) = matched else {
            return self.unmatched_outgoing(record).await;
        };
        match self.store.link_record(key, order.id()) {
            Ok(()) => {}
            Err(StoreError::DuplicateRecord { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        self.observe_inclusion(order, record).await.map(Some)
    }

    /// A broadcast whose outcome was unknown, recognised by its transfer.
    fn find_unacknowledged(&self, record: &IncomingRecord) -> Option<TrackedOrder> {
        self.store
            .orders_by_status(&[OrderStatus::Broadcasting])
            .into_iter()
            .find(|o| {
                o.txid.is_none()
                    && o.coin_name == record.coin_name
                    && o.order.from == record.from_address
                    && o.order.to == record.to_address
                    && o.order.value == record.value
            })
    }

    async fn observe_inclusion(&self, order: TrackedOrder, record: &IncomingRecord) -> ReconcileResult<TrackedOrder> {
        let id = order.id();
        let bn = record.bn;
        match order.status {
            OrderStatus::Broadcasting => {
                let txid = record.txid.clone();
                let n = record.n;
                self.transition(
                    id,
                    OrderStatus::Seen,
                    Some(bn),
                    Some(format!("found on chain as {} after unknown broadcast outcome", record.txid)),
                    move |o| {
                        o.txid = Some(txid.clone());
                        o.n = n;
                        o.block = Some(bn);
                        o.message = None;
                    },
                )
                .await
            }
            OrderStatus::RolledBack => {
                self.transition(id, OrderStatus::Seen, Some(bn), Some(format!("re-included at block {bn}")), move |o| {
                    o.block = Some(bn);
                })
                .await
            }
            OrderStatus::Seen if order.block.is_none() => Ok(self.store.update_order(id, &mut |o| {
                o.block = Some(bn);
                Ok(())
            })?),
            _ => Ok(order),
        }
    }

    async fn unmatched_outgoing(&self, record: &IncomingRecord) -> ReconcileResult<Option<TrackedOrder>> {
        if self.registry.contains(&record.coin_name, &record.to_address) {
            debug!(
                chain = %self.chain,
                record = %record.key(),
                "Internal transfer without order discarded"
            );
            Metrics::record_discarded(self.chain.as_str(), "internal_unmatched");
            return Ok(None);
        }
        let id = self.store.next_order_id();
        let mut order = TrackedOrder::from_record(id, record);
        order.kind = OrderKind::External;
        order.class = Some(RecordClass::Special);
        match self.store.insert_order(order.clone()) {
            Ok(()) => {}
            Err(StoreError::DuplicateRecord { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        self.journal_creation(&order);
        self.raise_intervention(
            id,
            InterventionReason::SpecialRecord,
            format!(
                "transfer {} of {} from system address {} matches no order",
                record.key(),
                record.value,
                record.from_address
            ),
        );
        Ok(Some(order))
    }

    async fn create_deposit(&self, record: &IncomingRecord) -> ReconcileResult<Option<TrackedOrder>> {
        if !self.registry.contains(&record.coin_name, &record.to_address) {
            Metrics::record_discarded(self.chain.as_str(), "foreign");
            return Ok(None);
        }
        let id = self.store.next_order_id();
        let order = TrackedOrder::from_record(id, record);
        match self.store.insert_order(order.clone()) {
            Ok(()) => {}
            Err(StoreError::DuplicateRecord { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        info!(
            chain = %self.chain,
            order_id = %id,
            coin = %record.coin_name,
            to = %record.to_address,
            value = %record.value,
            txid = %record.txid,
            bn = record.bn,
            class = %record.class(),
            "Deposit observed"
        );
        self.journal_creation(&order);
        if record.class() == RecordClass::Special {
            self.raise_intervention(
                id,
                InterventionReason::SpecialRecord,
                format!("deposit {} flagged for review", record.key()),
            );
        }
        Ok(Some(order))
    }

    // ------------------------------------------------------------------
    // Confirmation
    // ------------------------------------------------------------------

    /// Observe every `seen` or `rolled-back` order at `bn` and apply the
    /// resulting state. Returns orders whose status changed.
    pub async fn notify_orders(&self, bn: BlockNumber) -> ReconcileResult<Vec<TrackedOrder>> {
        let mut changed = Vec::new();
        for order in self
            .store
            .orders_by_status(&[OrderStatus::Seen, OrderStatus::RolledBack])
        {
            let id = order.id();
            match self.notify_order(order, bn).await {
                Ok(Some(updated)) => changed.push(updated),
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    warn!(chain = %self.chain, order_id = %id, error = %e, "Order state query failed, retrying next round");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(changed)
    }

    async fn notify_order(&self, order: TrackedOrder, bn: BlockNumber) -> ReconcileResult<Option<TrackedOrder>> {
        let id = order.id();
        let Some(info) = order.order_info() else {
            return Ok(None);
        };

        if let Some(replacement) = self.hooks.overriding_order(&order).await {
            let note = format!("superseded by order {replacement}");
            let message = note.clone();
            return self
                .transition(id, OrderStatus::Rejected, Some(bn), Some(note), move |o| {
                    o.message = Some(message.clone())
                })
                .await
                .map(Some);
        }

        let observation = self.adapter(&order.coin_name).get_order_state(&info, bn).await?;
        let mut order = self.store.update_order(id, &mut |o| {
            o.fold_observation(&observation, bn);
            Ok(())
        })?;
        let mut changed = false;
        if order.status == OrderStatus::RolledBack && observation.found {
            order = self
                .transition(id, OrderStatus::Seen, Some(bn), Some("observed again after rollback".into()), |_| {})
                .await?;
            changed = true;
        }

        if self.hooks.is_failed_critical(&order).await {
            return self
                .fail_critical(id, bn, "flagged by is_order_failed_critical".to_string())
                .await
                .map(Some);
        }

        let delta = order.confirmations_at(bn);
        let decision = self.hooks.state(&order, bn, delta, observation.state).await;
        match decision.state {
            NotiState::Confirmed if order.status == OrderStatus::Seen => self
                .transition(id, OrderStatus::Confirmed, Some(bn), Some(format!("{delta} confirmations")), |_| {})
                .await
                .map(Some),
            NotiState::Failed => {
                let msg = observation
                    .message
                    .clone()
                    .unwrap_or_else(|| "chain reported failure".to_string());
                let message = msg.clone();
                self.transition(id, OrderStatus::Rejected, Some(bn), Some(msg), move |o| {
                    o.message = Some(message.clone())
                })
                .await
                .map(Some)
            }
            NotiState::Pending if decision.send_again => self.request_resend(order, bn).await.map(Some),
            _ => Ok(changed.then_some(order)),
        }
    }

    async fn request_resend(&self, order: TrackedOrder, bn: BlockNumber) -> ReconcileResult<TrackedOrder> {
        let id = order.id();
        if !order.kind.is_outgoing() {
            warn!(chain = %self.chain, order_id = %id, kind = %order.kind, "Resend requested for an order we never broadcast");
            return Ok(order);
        }
        if order.send_attempts >= self.policy.max_send_attempts {
            return self
                .fail_critical(
                    id,
                    bn,
                    format!("resend limit reached after {} attempts", order.send_attempts),
                )
                .await;
        }
        let previous = order.txid.clone().unwrap_or_default();
        let note = format!("re-issue requested, previous txid {previous}");
        let message = note.clone();
        warn!(chain = %self.chain, order_id = %id, previous_txid = %previous, "Re-issuing order");
        self.transition(id, OrderStatus::Pending, Some(bn), Some(note), move |o| {
            o.txid = None;
            o.meta = None;
            o.block = None;
            o.confirmations = 0;
            o.message = Some(message.clone());
        })
        .await
    }

    // ------------------------------------------------------------------
    // Reorg
    // ------------------------------------------------------------------

    /// Roll back every order included at or above `height`.
    ///
    /// `scanned_tip` is the last block folded before the reorg was detected.
    /// Pending dependents of rolled-back orders are deferred until the chain
    /// has re-stabilised. A reorg deeper than the window changes nothing and
    /// raises an intervention per affected order.
    pub async fn rollback_from(
        &self,
        height: BlockNumber,
        scanned_tip: BlockNumber,
    ) -> ReconcileResult<RollbackReport> {
        let depth = scanned_tip.saturating_sub(height) + 1;
        let affected: Vec<OrderId> = self
            .store
            .orders_by_status(&[OrderStatus::Seen, OrderStatus::Confirmed])
            .into_iter()
            .filter(|o| o.block.is_some_and(|b| b >= height))
            .map(|o| o.id())
            .collect();

        if depth > self.policy.max_reorg_depth {
            error!(
                chain = %self.chain,
                height,
                depth,
                max = self.policy.max_reorg_depth,
                affected = affected.len(),
                "Reorg deeper than window, manual intervention required"
            );
            for id in &affected {
                self.raise_intervention(
                    *id,
                    InterventionReason::UnrecoverableReorg,
                    format!(
                        "reorg of depth {depth} at block {height} exceeds window of {}",
                        self.policy.max_reorg_depth
                    ),
                );
            }
            return Ok(RollbackReport {
                height,
                depth,
                rolled_back: Vec::new(),
                deferred: Vec::new(),
                unrecoverable: true,
            });
        }

        let note = format!("reorg at block {height}");
        for id in &affected {
            self.transition(*id, OrderStatus::RolledBack, Some(height), Some(note.clone()), |o| {
                o.reset_for_rollback()
            })
            .await?;
        }

        let release_at = self.policy.restabilised_at(height);
        let plan = AwaitPlan::UntilHeight { height: release_at };
        let mut deferred = Vec::new();
        for order in self.store.orders_by_status(&[OrderStatus::Pending]) {
            if !order.depends_on.iter().any(|d| affected.contains(d)) {
                continue;
            }
            self.store.update_order(order.id(), &mut |o| {
                o.await_plan = Some(plan);
                o.annotate(Some(height), format!("deferred until block {release_at}"));
                Ok(())
            })?;
            deferred.push(order.id());
        }

        self.store.remove_block_hashes_from(height);
        self.store.set_cursor(height.saturating_sub(1));
        Metrics::rollback(self.chain.as_str(), depth);
        self.journal(JournalEntry::Rollback {
            at: Utc::now(),
            height,
            orders: affected.clone(),
        });
        warn!(
            chain = %self.chain,
            height,
            depth,
            rolled_back = affected.len(),
            deferred = deferred.len(),
            "Reorg rolled back"
        );
        Ok(RollbackReport {
            height,
            depth,
            rolled_back: affected,
            deferred,
            unrecoverable: false,
        })
    }

    /// Clear await plans satisfied at `bn`. Returns the released orders.
    pub fn release_deferred(&self, bn: BlockNumber) -> ReconcileResult<Vec<OrderId>> {
        let mut released = Vec::new();
        let mut waiting = 0usize;
        for order in self.store.orders_by_status(&[OrderStatus::Pending]) {
            let Some(plan) = order.await_plan else {
                continue;
            };
            if !plan_satisfied(&plan, bn, self.store.as_ref()) {
                waiting += 1;
                continue;
            }
            self.store.update_order(order.id(), &mut |o| {
                o.await_plan = None;
                o.annotate(Some(bn), "await plan released");
                Ok(())
            })?;
            released.push(order.id());
        }
        Metrics::deferred_plans(self.chain.as_str(), waiting);
        if !released.is_empty() {
            info!(chain = %self.chain, bn, released = released.len(), "Deferred orders released");
        }
        Ok(released)
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    /// Value of outgoing orders from `address` whose transaction is in flight.
    pub fn in_flight_value(&self, coin_name: &str, address: &str) -> DisplayAmount {
        self.store
            .orders_by_status(&[
                OrderStatus::Broadcasting,
                OrderStatus::Seen,
                OrderStatus::RolledBack,
            ])
            .into_iter()
            .filter(|o| o.kind.is_outgoing() && o.coin_name == coin_name && o.order.from == address)
            .map(|o| o.order.value)
            .sum()
    }
}
