//! End-to-end chain lifecycle against the simulated adapter.
//!
//! Drives whole closer rounds through `Application`:
//! - deposit detection, confirmation and sweep to the hot wallet
//! - host withdrawals through the exported method surface
//! - reorg rollback
//! - restart from the persisted snapshot

use std::sync::Arc;

use custody_agent::{AppConfig, AppError, Application, ChainConfig, ChainRuntime};
use custody_chain::SimulatedChain;
use custody_core::{
    BizMode, DisplayAmount, OrderId, OrderKind, OrderStatus, RecordClass, SystemAddressKind,
};
use custody_store::LedgerStore;
use rust_decimal_macros::dec;
use serde_json::json;
use tempfile::TempDir;

fn config(dir: &TempDir) -> AppConfig {
    let mut chain = ChainConfig::new("sim", "sim", 8);
    chain.round_interval_ms = 1;
    chain
        .cold_addresses
        .insert("sim".to_string(), "simcold".to_string());
    AppConfig {
        data_dir: dir.path().to_string_lossy().into_owned(),
        chains: vec![chain],
        ..AppConfig::default()
    }
}

fn sim(runtime: &ChainRuntime) -> Arc<SimulatedChain> {
    runtime.sim.clone().expect("simulated chain")
}

fn amount(v: rust_decimal::Decimal) -> DisplayAmount {
    DisplayAmount::new(v)
}

#[tokio::test]
async fn test_deposit_is_confirmed_and_swept() {
    let dir = tempfile::tempdir().unwrap();
    let mut app = Application::simulated(config(&dir)).await.unwrap();
    let runtime = app.chain_mut("sim").unwrap();
    let chain = sim(runtime);

    let deposit_addr = runtime
        .client
        .create_address("https://host/cb", "sim", "app1", BizMode::Deposit)
        .await
        .unwrap()
        .address
        .address;
    let hot = runtime
        .client
        .get_system_address("sim", SystemAddressKind::Hot)
        .await
        .unwrap();

    chain.submit_external("sim", "customer1", &deposit_addr, amount(dec!(2.5)));
    chain.mine();
    let first = runtime.runner.run_round().await.unwrap();
    assert_eq!(first.orders_touched, 1);
    let deposit = runtime
        .store
        .all_orders()
        .into_iter()
        .find(|o| o.kind == OrderKind::Deposit)
        .unwrap();
    assert_eq!(deposit.class, Some(RecordClass::Normal));
    assert_eq!(deposit.status, OrderStatus::Seen);

    chain.mine_blocks(6);
    let second = runtime.runner.run_round().await.unwrap();
    assert_eq!(second.sweeps.len(), 1);
    assert_eq!(
        runtime.store.order(deposit.id()).unwrap().status,
        OrderStatus::Confirmed
    );

    let sweep_id = second.sweeps[0];
    let sweep = runtime.store.order(sweep_id).unwrap();
    assert_eq!(sweep.kind, OrderKind::SweepToHot);
    assert_eq!(sweep.order.to, hot);

    chain.mine();
    runtime.runner.run_round().await.unwrap();
    chain.mine_blocks(6);
    runtime.runner.run_round().await.unwrap();
    assert_eq!(
        runtime.store.order(sweep_id).unwrap().status,
        OrderStatus::Confirmed
    );

    let status = runtime.client.get_wallet_status("sim", &hot).await.unwrap();
    assert_eq!(status.balance, amount(dec!(2.5)));
    assert_eq!(status.balance_unavailable, DisplayAmount::ZERO);
}

#[tokio::test]
async fn test_host_withdrawal_through_invoke() {
    let dir = tempfile::tempdir().unwrap();
    let mut app = Application::simulated(config(&dir)).await.unwrap();
    let runtime = app.chain_mut("sim").unwrap();
    let chain = sim(runtime);

    let created = runtime
        .client
        .invoke(
            "withdraw",
            json!({ "coinName": "sim", "to": "customer2", "value": "0.75", "memo": "w-1" }),
        )
        .await
        .unwrap();
    let id: OrderId = serde_json::from_value(created["order"]["id"].clone()).unwrap();

    let round = runtime.runner.run_round().await.unwrap();
    assert_eq!(round.settled.len(), 1);
    assert_eq!(round.settled[0].1.submitted, vec![id]);
    assert_eq!(chain.broadcast_count(), 1);

    chain.mine();
    runtime.runner.run_round().await.unwrap();
    let tip = chain.mine_blocks(6);
    runtime.runner.run_round().await.unwrap();

    let order = runtime.client.get_order(id).unwrap();
    assert_eq!(order.status, OrderStatus::Confirmed);
    let tx = runtime
        .client
        .get_tx_data_by_order(id, tip)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Some(tx.hash), order.txid);

    assert!(runtime
        .client
        .invoke("rotateSystemAddress", json!({}))
        .await
        .is_err());
}

#[tokio::test]
async fn test_reorg_rolls_back_unconfirmed_deposit() {
    let dir = tempfile::tempdir().unwrap();
    let mut app = Application::simulated(config(&dir)).await.unwrap();
    let runtime = app.chain_mut("sim").unwrap();
    let chain = sim(runtime);

    let deposit_addr = runtime
        .client
        .create_address("cb", "sim", "app1", BizMode::Deposit)
        .await
        .unwrap()
        .address
        .address;
    chain.submit_external("sim", "customer1", &deposit_addr, amount(dec!(1)));
    let bn = chain.mine();
    chain.mine_blocks(2);
    runtime.runner.run_round().await.unwrap();

    // the deposit block is orphaned and its transaction dropped
    chain.reorg(bn, false);
    chain.mine_blocks(4);
    let round = runtime.runner.run_round().await.unwrap();
    let rollback = round.rollback.unwrap();
    assert_eq!(rollback.height, bn);
    assert!(!rollback.unrecoverable);

    let deposit = runtime
        .store
        .all_orders()
        .into_iter()
        .find(|o| o.kind == OrderKind::Deposit)
        .unwrap();
    assert_eq!(deposit.status, OrderStatus::RolledBack);
    assert!(round.sweeps.is_empty());
}

#[tokio::test]
async fn test_restart_resumes_from_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let deposit_addr;
    {
        let mut app = Application::simulated(config(&dir)).await.unwrap();
        let runtime = app.chain_mut("sim").unwrap();
        let chain = sim(runtime);
        deposit_addr = runtime
            .client
            .create_address("cb", "sim", "app1", BizMode::Deposit)
            .await
            .unwrap()
            .address
            .address;
        chain.submit_external("sim", "customer1", &deposit_addr, amount(dec!(3)));
        chain.mine();
        runtime.runner.run_round().await.unwrap();
        runtime.runner.run_round().await.unwrap();
        assert_eq!(runtime.runner.task_round(), 2);
        assert!(runtime.snapshot_path().exists());
    }

    let app = Application::simulated(config(&dir)).await.unwrap();
    let runtime = app.chain("sim").unwrap();
    assert_eq!(runtime.runner.task_round(), 2);
    assert_eq!(runtime.store.cursor(), Some(1));
    assert_eq!(runtime.store.all_orders().len(), 1);
    assert!(runtime
        .client
        .registry()
        .is_deposit_address("sim", &deposit_addr));
}

#[tokio::test]
async fn test_run_stops_after_max_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(&dir);
    cfg.max_rounds = Some(2);
    let app = Application::simulated(cfg).await.unwrap();
    let snapshot = app.chain("sim").unwrap().snapshot_path().clone();

    app.run().await.unwrap();

    assert!(snapshot.exists());
    let metrics = std::fs::read_to_string(dir.path().join("metrics.prom")).unwrap();
    assert!(metrics.contains("custody_"));
}

#[tokio::test]
async fn test_run_reports_failed_chain_task() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(&dir);
    cfg.max_rounds = Some(1);
    let app = Application::simulated(cfg).await.unwrap();

    // a non-empty directory where the final snapshot goes makes the save fail
    let snapshot = app.chain("sim").unwrap().snapshot_path().clone();
    std::fs::create_dir_all(snapshot.join("blocker")).unwrap();

    let err = app.run().await.unwrap_err();
    assert!(matches!(
        err,
        AppError::ChainTasksFailed {
            failed: 1,
            total: 1
        }
    ));
    assert!(dir.path().join("metrics.prom").exists());
}
