//! Order lifecycle scenarios driven through `OrderLifecycleManager`.

use chrono::{Duration, Utc};
use tokio_test::{assert_err, assert_ok};

use tradefloor::ledger::Ledger;
use tradefloor::types::{ExchangeError, Order, OrderId, OrderStatus, Side};

use crate::fixtures::{TestMarket, SELLER_AVERAGE, SELLER_SHARES, STARTING_CASH};

#[tokio::test]
async fn test_accept_sell_order_settles_both_sides() {
    let market = TestMarket::new().await;
    let order_id = assert_ok!(
        market
            .lifecycle
            .submit(market.seller, market.instrument, Side::Sell, 200, 50)
            .await
    );

    let summary = assert_ok!(market.lifecycle.accept(order_id, market.buyer).await);
    assert_eq!(summary.trade.quantity, 50);
    assert_eq!(summary.trade.price, 200);
    assert_eq!(summary.trade.fee, 15);
    assert_eq!(summary.order_status, OrderStatus::Filled);
    assert_eq!(summary.remaining, 0);

    let buyer = market.ledger.agent(market.buyer).await.unwrap().unwrap();
    let seller = market.ledger.agent(market.seller).await.unwrap().unwrap();
    assert_eq!(buyer.balance, STARTING_CASH - 10_000 - 15);
    assert_eq!(seller.balance, STARTING_CASH + 10_000 - 15);

    let bought = market
        .ledger
        .holding(market.buyer, market.instrument)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bought.shares, 50);
    assert_eq!(bought.average_price, 200);

    let kept = market
        .ledger
        .holding(market.seller, market.instrument)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kept.shares, SELLER_SHARES - 50);
    assert_eq!(kept.average_price, SELLER_AVERAGE);
}

#[tokio::test]
async fn test_double_accept_is_rejected_without_second_trade() {
    let market = TestMarket::new().await;
    let order_id = market
        .lifecycle
        .submit(market.seller, market.instrument, Side::Sell, 200, 50)
        .await
        .unwrap();

    assert_ok!(market.lifecycle.accept(order_id, market.buyer).await);
    let err = assert_err!(market.lifecycle.accept(order_id, market.buyer).await);
    assert!(err.is_race_lost(), "expected NotAcceptable, got {err}");
    assert_eq!(market.ledger.trade_count_for_order(order_id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_oversized_order_never_reaches_settlement() {
    let market = TestMarket::new().await;
    let err = assert_err!(
        market
            .lifecycle
            .submit(market.seller, market.instrument, Side::Sell, 5_000_000_000, 5_000_000_000)
            .await
    );
    assert!(matches!(err, ExchangeError::Validation(_)), "got {err}");

    // Written straight to the ledger, it is still refused without side effects.
    let order = Order {
        id: OrderId::new(),
        agent_id: market.seller,
        instrument_id: market.instrument,
        side: Side::Sell,
        price: 5_000_000_000,
        quantity: 5_000_000_000,
        quantity_filled: 0,
        status: OrderStatus::Active,
        created_at: Utc::now(),
        expires_at: None,
    };
    market.ledger.insert_order(&order).await.unwrap();
    let err = assert_err!(market.lifecycle.accept(order.id, market.buyer).await);
    assert!(matches!(err, ExchangeError::Validation(_)), "got {err}");

    let buyer = market.ledger.agent(market.buyer).await.unwrap().unwrap();
    assert_eq!(buyer.balance, STARTING_CASH);
    assert_eq!(market.ledger.trade_count_for_order(order.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_partial_fills_then_cancel_remainder() {
    let market = TestMarket::new().await;
    let order_id = market
        .lifecycle
        .submit(market.seller, market.instrument, Side::Sell, 200, 40)
        .await
        .unwrap();

    let first = assert_ok!(
        market
            .lifecycle
            .accept_quantity(order_id, market.buyer, 10)
            .await
    );
    assert_eq!(first.order_status, OrderStatus::PartiallyFilled);
    assert_eq!(first.remaining, 30);

    let cancelled = assert_ok!(market.lifecycle.cancel(order_id, market.seller).await);
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.quantity_filled, 10);

    let err = assert_err!(market.lifecycle.accept(order_id, market.buyer).await);
    assert!(!err.is_ledger_failure());
}

#[tokio::test]
async fn test_only_owner_may_cancel() {
    let market = TestMarket::new().await;
    let order_id = market
        .lifecycle
        .submit(market.buyer, market.instrument, Side::Buy, 180, 5)
        .await
        .unwrap();

    let err = assert_err!(market.lifecycle.cancel(order_id, market.seller).await);
    assert!(matches!(err, ExchangeError::Forbidden { .. }));

    let order = market.ledger.order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Active);
}

#[tokio::test]
async fn test_accept_buy_order_requires_acceptor_shares() {
    let market = TestMarket::new().await;
    let broke = market.add_agent("empty-handed", STARTING_CASH).await;
    let order_id = market
        .lifecycle
        .submit(market.buyer, market.instrument, Side::Buy, 210, 10)
        .await
        .unwrap();

    let err = assert_err!(market.lifecycle.accept(order_id, broke).await);
    assert!(matches!(err, ExchangeError::InsufficientShares { .. }));

    // The seller does hold shares and can take it.
    let summary = assert_ok!(market.lifecycle.accept(order_id, market.seller).await);
    assert_eq!(summary.trade.buyer_id, market.buyer);
    assert_eq!(summary.trade.seller_id, market.seller);
}

#[tokio::test]
async fn test_expired_orders_are_swept_and_unacceptable() {
    let market = TestMarket::new().await;
    let order_id = market
        .lifecycle
        .submit_with_expiry(
            market.seller,
            market.instrument,
            Side::Sell,
            200,
            10,
            Some(Utc::now() + Duration::milliseconds(50)),
        )
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(120)).await;

    let err = assert_err!(market.lifecycle.accept(order_id, market.buyer).await);
    assert!(!err.is_ledger_failure());

    let swept = assert_ok!(market.lifecycle.expire_due(Utc::now()).await);
    assert_eq!(swept, 1);
    let order = market.ledger.order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Expired);
}

#[tokio::test]
async fn test_fee_comes_from_exchange() {
    let market = TestMarket::new().await;
    assert_eq!(market.exchange.fee_percent.to_string(), "0.15");

    let order_id = market
        .lifecycle
        .submit(market.seller, market.instrument, Side::Sell, 1000, 1)
        .await
        .unwrap();
    // 1000 * 1 * 0.15 % = 1.5 cents, rounded half away from zero.
    let summary = market.lifecycle.accept(order_id, market.buyer).await.unwrap();
    assert_eq!(summary.trade.fee, 2);
}
