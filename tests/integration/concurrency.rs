//! Contention: concurrent accepts and scheduled agents.

use std::time::Duration;
use tokio_test::assert_ok;

use tradefloor::ledger::Ledger;
use tradefloor::types::{OrderStatus, Side};

use crate::fixtures::{TestMarket, STARTING_CASH};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_accepts_have_one_winner() {
    let market = TestMarket::new().await;
    let rival = market.add_agent("rival", STARTING_CASH).await;
    let order_id = market
        .lifecycle
        .submit(market.seller, market.instrument, Side::Sell, 200, 50)
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        market.lifecycle.accept(order_id, market.buyer),
        market.lifecycle.accept(order_id, rival),
    );

    let wins = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(wins, 1, "exactly one accept must win: {a:?} / {b:?}");
    for result in [&a, &b] {
        if let Err(e) = result {
            assert!(!e.is_ledger_failure(), "loser saw a ledger failure: {e}");
        }
    }

    assert_eq!(market.ledger.trade_count_for_order(order_id).await.unwrap(), 1);
    let order = market.ledger.order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Filled);

    // Cash moved exactly once.
    let buyer = market.ledger.agent(market.buyer).await.unwrap().unwrap();
    let rival = market.ledger.agent(rival).await.unwrap().unwrap();
    assert_eq!(
        buyer.balance + rival.balance,
        2 * STARTING_CASH - 10_000 - 15
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_partial_accepts_never_overfill() {
    let market = TestMarket::new().await;
    let order_id = market
        .lifecycle
        .submit(market.seller, market.instrument, Side::Sell, 100, 30)
        .await
        .unwrap();

    let mut buyers = Vec::new();
    for i in 0..6 {
        buyers.push(market.add_agent(&format!("buyer-{i}"), STARTING_CASH).await);
    }

    let attempts = buyers
        .iter()
        .map(|buyer| market.lifecycle.accept_quantity(order_id, *buyer, 10));
    let results = futures::future::join_all(attempts).await;

    let filled: i64 = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|s| s.trade.quantity)
        .sum();
    assert_eq!(filled, 30);

    let order = market.ledger.order(order_id).await.unwrap().unwrap();
    assert_eq!(order.quantity_filled, 30);
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(market.ledger.trade_count_for_order(order_id).await.unwrap(), 3);
}

#[tokio::test]
async fn test_scheduler_start_stop_lifecycle() {
    let market = TestMarket::new().await;
    let scheduler = market.scheduler(Duration::ZERO);

    assert!(scheduler.start(market.buyer, Duration::from_millis(20)).await);
    assert!(!scheduler.start(market.buyer, Duration::from_millis(20)).await);
    assert!(scheduler.start(market.seller, Duration::from_millis(20)).await);
    assert_eq!(scheduler.running_agents().await.len(), 2);

    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(scheduler.stop(market.buyer).await);
    assert!(!scheduler.stop(market.buyer).await);
    assert!(!scheduler.is_running(market.buyer).await);

    scheduler.stop_all().await;
    assert!(scheduler.running_agents().await.is_empty());
}

#[tokio::test]
async fn test_tick_now_without_history_is_quiet() {
    let market = TestMarket::new().await;
    let scheduler = market.scheduler(Duration::ZERO);

    // Momentum needs candles; with none loaded the tick places nothing.
    let report = assert_ok!(scheduler.tick_now(market.buyer).await);
    assert_eq!(report.strategy, "momentum");
    assert_eq!(report.placed(), 0);
    assert_eq!(report.failures(), 0);
}
