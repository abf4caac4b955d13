//! Order lifecycle: submit, cancel and accept against the ledger.
//!
//! Pre-checks here are advisory and give precise errors for the common
//! cases. The ledger's accept is the only serialization point; its result
//! is returned unchanged and never retried.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ledger::{Ledger, LedgerResult};
use crate::types::{
    checked_notional, format_cents, trade_fee, AcceptRequest, AgentId, Cents, ExchangeError, InstrumentId, Order,
    OrderId, OrderStatus, Side, TradeSummary,
};

pub struct OrderLifecycleManager {
    ledger: Arc<dyn Ledger>,
}

impl OrderLifecycleManager {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Place a resting order that never expires.
    pub async fn submit(
        &self,
        agent: AgentId,
        instrument: InstrumentId,
        side: Side,
        price: Cents,
        quantity: i64,
    ) -> LedgerResult<OrderId> {
        self.submit_with_expiry(agent, instrument, side, price, quantity, None)
            .await
    }

    /// Place a resting order, optionally expiring at `expires_at`.
    pub async fn submit_with_expiry(
        &self,
        agent: AgentId,
        instrument: InstrumentId,
        side: Side,
        price: Cents,
        quantity: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> LedgerResult<OrderId> {
        if quantity <= 0 {
            return Err(ExchangeError::Validation(format!(
                "quantity must be positive, got {quantity}"
            )));
        }
        if price <= 0 {
            return Err(ExchangeError::Validation(format!(
                "price must be positive, got {price}"
            )));
        }
        if checked_notional(price, quantity).is_none() {
            return Err(ExchangeError::Validation(format!(
                "order value {quantity} x {price} cents is too large"
            )));
        }

        let now = Utc::now();
        if expires_at.is_some_and(|at| at <= now) {
            return Err(ExchangeError::Validation(
                "expiry must be in the future".to_string(),
            ));
        }

        let order = Order {
            id: OrderId::new(),
            agent_id: agent,
            instrument_id: instrument,
            side,
            price,
            quantity,
            quantity_filled: 0,
            status: OrderStatus::Active,
            created_at: now,
            expires_at,
        };
        self.ledger.insert_order(&order).await?;

        info!(
            order_id = %order.id,
            agent = %agent,
            instrument = %instrument,
            side = %side,
            quantity,
            price = format_cents(price),
            "Order submitted"
        );
        Ok(order.id)
    }

    /// Cancel an open order on behalf of its owner.
    pub async fn cancel(&self, order_id: OrderId, requester: AgentId) -> LedgerResult<Order> {
        let order = self
            .ledger
            .order(order_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound(format!("order {order_id}")))?;

        if order.agent_id != requester {
            return Err(ExchangeError::Forbidden {
                order_id,
                requester,
            });
        }
        if order.status.is_terminal() {
            return Err(ExchangeError::AlreadyTerminal {
                order_id,
                status: order.status,
            });
        }

        let cancelled = self.ledger.cancel_order(order_id).await?;
        info!(order_id = %order_id, agent = %requester, "Order cancelled");
        Ok(cancelled)
    }

    /// Accept the full remaining quantity of a counterparty's order.
    pub async fn accept(&self, order_id: OrderId, acceptor: AgentId) -> LedgerResult<TradeSummary> {
        self.accept_inner(order_id, acceptor, None).await
    }

    /// Accept part of a counterparty's order; the rest stays acceptable.
    pub async fn accept_quantity(
        &self,
        order_id: OrderId,
        acceptor: AgentId,
        quantity: i64,
    ) -> LedgerResult<TradeSummary> {
        self.accept_inner(order_id, acceptor, Some(quantity)).await
    }

    async fn accept_inner(
        &self,
        order_id: OrderId,
        acceptor: AgentId,
        quantity: Option<i64>,
    ) -> LedgerResult<TradeSummary> {
        let order = self
            .ledger
            .order(order_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound(format!("order {order_id}")))?;

        let now = Utc::now();
        if !order.is_acceptable_at(now) {
            let reason = if order.is_expired_at(now) && order.status.is_open() {
                "order has expired".to_string()
            } else {
                format!("order is {} with {} remaining", order.status, order.remaining())
            };
            return Err(ExchangeError::NotAcceptable { order_id, reason });
        }

        if order.agent_id == acceptor {
            return Err(ExchangeError::SelfTrade {
                order_id,
                agent_id: acceptor,
            });
        }

        let remaining = order.remaining();
        let quantity = quantity.unwrap_or(remaining);
        if quantity <= 0 {
            return Err(ExchangeError::Validation(format!(
                "accept quantity must be positive, got {quantity}"
            )));
        }
        if quantity > remaining {
            return Err(ExchangeError::NotAcceptable {
                order_id,
                reason: format!("requested {quantity} but only {remaining} remaining"),
            });
        }

        // Accepting a buy order means the acceptor sells.
        if order.side == Side::Buy {
            let held = self
                .ledger
                .holding(acceptor, order.instrument_id)
                .await?
                .map(|h| h.shares)
                .unwrap_or(0);
            if held < quantity {
                return Err(ExchangeError::InsufficientShares {
                    needed: quantity,
                    held,
                });
            }
        }

        let instrument = self
            .ledger
            .instrument(order.instrument_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound(format!("instrument {}", order.instrument_id)))?;
        let exchange = self
            .ledger
            .exchange(instrument.exchange_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound(format!("exchange {}", instrument.exchange_id)))?;
        let fee = trade_fee(order.price, quantity, exchange.fee_percent).ok_or_else(|| {
            ExchangeError::Validation(format!(
                "trade value {quantity} x {} cents is too large",
                order.price
            ))
        })?;

        debug!(
            order_id = %order_id,
            acceptor = %acceptor,
            quantity,
            fee,
            "Submitting accept to ledger"
        );

        let outcome = self
            .ledger
            .accept_order(AcceptRequest {
                acceptor,
                order_id,
                quantity,
                fee,
            })
            .await
            .map_err(|e| {
                if e.is_race_lost() {
                    debug!(order_id = %order_id, acceptor = %acceptor, error = %e, "Accept lost race");
                } else {
                    warn!(order_id = %order_id, acceptor = %acceptor, error = %e, "Accept failed");
                }
                e
            })?;

        info!(
            trade_id = %outcome.trade.id,
            order_id = %order_id,
            acceptor = %acceptor,
            quantity,
            price = format_cents(order.price),
            fee = format_cents(fee),
            status = %outcome.order.status,
            "Order accepted"
        );
        Ok(outcome.into())
    }

    /// Expire every open order whose deadline has passed.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> LedgerResult<u64> {
        self.ledger.expire_orders(now).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
