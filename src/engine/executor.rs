//! Intent executor.
//!
//! Turns a tick's `OrderIntent`s into lifecycle calls. A placement accepts
//! at most one crossing counter-order through `accept_quantity`, the best
//! priced one it can win; whatever is left rests on the book as a new order.

use chrono::Utc;
use serde::Serialize;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::lifecycle::OrderLifecycleManager;
use crate::ledger::LedgerResult;
use crate::types::{
    format_cents, AgentId, Cents, ExchangeError, InstrumentId, Order, OrderFilter, OrderId,
    OrderIntent, Side, TradeSummary,
};

// ---------------------------------------------------------------------------
// Execution result
// ---------------------------------------------------------------------------

/// What happened to one batch of intents.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub placed: Vec<OrderId>,
    pub trades: Vec<TradeSummary>,
    pub cancelled: Vec<OrderId>,
    /// Cancels that found the order already terminal.
    pub already_terminal: u32,
    /// Accepts that lost the order to another agent.
    pub races_lost: u32,
    pub failures: Vec<FailedIntent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedIntent {
    pub intent: OrderIntent,
    pub kind: &'static str,
    pub reason: String,
}

impl ExecutionReport {
    fn fail(&mut self, intent: &OrderIntent, err: &ExchangeError) {
        warn!(intent = %intent, error = %err, "Intent failed");
        self.failures.push(FailedIntent {
            intent: intent.clone(),
            kind: err.kind(),
            reason: err.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct IntentExecutor {
    lifecycle: Arc<OrderLifecycleManager>,
    order_ttl: Option<chrono::Duration>,
}

impl IntentExecutor {
    pub fn new(lifecycle: Arc<OrderLifecycleManager>, order_ttl: Option<chrono::Duration>) -> Self {
        Self {
            lifecycle,
            order_ttl,
        }
    }

    /// Execute intents in order on behalf of `agent`.
    ///
    /// A ledger failure aborts the batch and is returned; every other error
    /// is recorded in the report and execution moves on.
    pub async fn execute(
        &self,
        agent: AgentId,
        intents: &[OrderIntent],
    ) -> LedgerResult<ExecutionReport> {
        let mut report = ExecutionReport::default();

        for intent in intents {
            match *intent {
                OrderIntent::Cancel { order_id } => {
                    self.cancel(agent, intent, order_id, &mut report).await?;
                }
                OrderIntent::PlaceBuy {
                    instrument_id,
                    price,
                    quantity,
                } => {
                    self.place(agent, intent, instrument_id, Side::Buy, price, quantity, &mut report)
                        .await?;
                }
                OrderIntent::PlaceSell {
                    instrument_id,
                    price,
                    quantity,
                } => {
                    self.place(agent, intent, instrument_id, Side::Sell, price, quantity, &mut report)
                        .await?;
                }
            }
        }

        Ok(report)
    }

    async fn cancel(
        &self,
        agent: AgentId,
        intent: &OrderIntent,
        order_id: OrderId,
        report: &mut ExecutionReport,
    ) -> LedgerResult<()> {
        match self.lifecycle.cancel(order_id, agent).await {
            Ok(_) => report.cancelled.push(order_id),
            Err(ExchangeError::AlreadyTerminal { status, .. }) => {
                debug!(order_id = %order_id, status = %status, "Cancel skipped, order already terminal");
                report.already_terminal += 1;
            }
            Err(e) if e.is_ledger_failure() => return Err(e),
            Err(e) => report.fail(intent, &e),
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn place(
        &self,
        agent: AgentId,
        intent: &OrderIntent,
        instrument: InstrumentId,
        side: Side,
        limit: Cents,
        quantity: i64,
        report: &mut ExecutionReport,
    ) -> LedgerResult<()> {
        let book = match self
            .lifecycle
            .ledger()
            .open_orders(&OrderFilter {
                instrument_id: Some(instrument),
                side: Some(side.opposite()),
                exclude_agent: Some(agent),
            })
            .await
        {
            Ok(book) => book,
            Err(e) if e.is_ledger_failure() => return Err(e),
            Err(e) => {
                report.fail(intent, &e);
                return Ok(());
            }
        };

        // One counter-order per intent; later candidates are only tried
        // when an earlier one could not be taken.
        let mut wanted = quantity;
        for candidate in crossing_orders(book, side, limit) {
            let take = candidate.remaining().min(wanted);

            match self.lifecycle.accept_quantity(candidate.id, agent, take).await {
                Ok(summary) => {
                    wanted -= summary.trade.quantity;
                    report.trades.push(summary);
                    break;
                }
                Err(e) if e.is_race_lost() => {
                    debug!(order_id = %candidate.id, agent = %agent, "Lost race, trying next order");
                    report.races_lost += 1;
                }
                Err(e) if e.is_ledger_failure() => return Err(e),
                Err(e) if is_own_shortfall(side, &e) => {
                    // No other counter-order can fix our own cash or shares.
                    report.fail(intent, &e);
                    return Ok(());
                }
                Err(e) => {
                    debug!(order_id = %candidate.id, error = %e, "Counter-order skipped");
                }
            }
        }

        if wanted == 0 {
            return Ok(());
        }

        let expires_at = self
            .order_ttl
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        match self
            .lifecycle
            .submit_with_expiry(agent, instrument, side, limit, wanted, expires_at)
            .await
        {
            Ok(order_id) => {
                info!(
                    order_id = %order_id,
                    agent = %agent,
                    side = %side,
                    quantity = wanted,
                    price = format_cents(limit),
                    "Resting order placed"
                );
                report.placed.push(order_id);
            }
            Err(e) if e.is_ledger_failure() => return Err(e),
            Err(e) => report.fail(intent, &e),
        }
        Ok(())
    }
}

/// Counter-orders that trade at `limit` or better, best price then oldest.
fn crossing_orders(book: Vec<Order>, side: Side, limit: Cents) -> Vec<Order> {
    let mut crossing: Vec<Order> = book
        .into_iter()
        .filter(|o| o.remaining() > 0)
        .filter(|o| match side {
            Side::Buy => o.side == Side::Sell && o.price <= limit,
            Side::Sell => o.side == Side::Buy && o.price >= limit,
        })
        .collect();

    match side {
        Side::Buy => crossing.sort_by_key(|o| (o.price, o.created_at)),
        Side::Sell => crossing.sort_by_key(|o| (Reverse(o.price), o.created_at)),
    }
    crossing
}

/// Whether an accept failed because of the acceptor's own cash or shares.
fn is_own_shortfall(side: Side, err: &ExchangeError) -> bool {
    matches!(
        (side, err),
        (Side::Buy, ExchangeError::InsufficientFunds { .. })
            | (Side::Sell, ExchangeError::InsufficientShares { .. })
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
