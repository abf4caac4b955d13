//! Pre-trade risk limits.
//!
//! Buys are trimmed to the agent's per-trade cash budget and to its cap on
//! an instrument's shares outstanding. Sells and cancels pass through.

use rust_decimal::prelude::*;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::InstrumentView;
use crate::types::{checked_notional, trade_fee, Agent, Cents, InstrumentId, OrderIntent};

/// Why a buy was cut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimReason {
    /// `price × quantity` plus fee exceeded `balance × max_risk_per_trade`.
    CashBudget,
    /// The position would exceed `total_shares × max_position_fraction`.
    PositionCap,
}

/// Per-agent risk limits applied to a tick's intents.
#[derive(Debug, Clone)]
pub struct RiskGuard {
    pub balance: Cents,
    pub max_risk_per_trade: Decimal,
    pub max_position_fraction: Decimal,
}

impl RiskGuard {
    pub fn for_agent(agent: &Agent) -> Self {
        Self {
            balance: agent.balance,
            max_risk_per_trade: agent.max_risk_per_trade,
            max_position_fraction: agent.max_position_fraction,
        }
    }

    /// Largest quantity whose cost at `price`, fee included, fits the
    /// per-trade budget.
    pub fn cash_limit(&self, price: Cents, fee_percent: Decimal) -> i64 {
        if price <= 0 || self.balance <= 0 {
            return 0;
        }
        let budget = Decimal::from(self.balance) * self.max_risk_per_trade;
        let unit_cost = Decimal::from(price) * (Decimal::ONE + fee_percent / Decimal::ONE_HUNDRED);
        let mut quantity = (budget / unit_cost).floor().to_i64().unwrap_or(0).max(0);

        // The rounded fee can sit half a cent above the exact one.
        while quantity > 0 && !fits_budget(price, quantity, fee_percent, budget) {
            quantity -= 1;
        }
        quantity
    }

    /// Most shares of an instrument the agent may hold.
    pub fn position_limit(&self, total_shares: i64) -> i64 {
        (Decimal::from(total_shares) * self.max_position_fraction)
            .floor()
            .to_i64()
            .unwrap_or(0)
            .max(0)
    }

    /// Trim buys in order; buys trimmed to zero are dropped.
    ///
    /// Earlier buys of the same instrument count toward the position cap of
    /// later ones.
    pub fn review(&self, intents: Vec<OrderIntent>, views: &[InstrumentView]) -> Vec<OrderIntent> {
        let by_id: HashMap<InstrumentId, &InstrumentView> =
            views.iter().map(|v| (v.instrument.id, v)).collect();
        let mut planned: HashMap<InstrumentId, i64> = HashMap::new();
        let mut approved = Vec::with_capacity(intents.len());

        for intent in intents {
            let OrderIntent::PlaceBuy {
                instrument_id,
                price,
                quantity,
            } = intent
            else {
                approved.push(intent);
                continue;
            };

            let Some(view) = by_id.get(&instrument_id) else {
                warn!(instrument = %instrument_id, "Buy for unknown instrument dropped");
                continue;
            };

            let already = view.held() + planned.get(&instrument_id).copied().unwrap_or(0);
            let room = (self.position_limit(view.instrument.total_shares) - already).max(0);
            let affordable = self.cash_limit(price, view.fee_percent);

            let allowed = quantity.min(room).min(affordable);
            if allowed < quantity {
                let reason = if room < affordable {
                    TrimReason::PositionCap
                } else {
                    TrimReason::CashBudget
                };
                debug!(
                    instrument = %instrument_id,
                    wanted = quantity,
                    allowed,
                    reason = ?reason,
                    "Buy trimmed by risk limits"
                );
            }
            if allowed <= 0 {
                continue;
            }

            *planned.entry(instrument_id).or_insert(0) += allowed;
            approved.push(OrderIntent::buy(instrument_id, price, allowed));
        }

        approved
    }
}

fn fits_budget(price: Cents, quantity: i64, fee_percent: Decimal, budget: Decimal) -> bool {
    let cost = checked_notional(price, quantity)
        .zip(trade_fee(price, quantity, fee_percent))
        .and_then(|(notional, fee)| notional.checked_add(fee));
    cost.is_some_and(|cost| Decimal::from(cost) <= budget)
}
