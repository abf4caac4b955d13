//! Shared types for the TRADEFLOOR exchange.
//!
//! These types form the data model used across all modules. Money is kept
//! in integer cents everywhere; percentages and risk fractions are
//! `Decimal` so that fee and price arithmetic rounds exactly once.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::RoundingStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

/// An amount of money or a price, in cents.
pub type Cents = i64;

/// Multiply a price by `factor` and round to whole cents, half away from zero.
pub fn adjust_price(price: Cents, factor: Decimal) -> Cents {
    round_cents(Decimal::from(price) * factor)
}

/// `price × quantity`, or `None` if it doesn't fit in cents.
pub fn checked_notional(price: Cents, quantity: i64) -> Option<Cents> {
    price.checked_mul(quantity)
}

/// Exchange fee for a trade: `round(price × quantity × percent / 100)`.
///
/// `None` when the trade value is too large to price.
pub fn trade_fee(price: Cents, quantity: i64, fee_percent: Decimal) -> Option<Cents> {
    let gross = Decimal::from(checked_notional(price, quantity)?).checked_mul(fee_percent)?;
    Some(round_cents(gross / Decimal::ONE_HUNDRED))
}

fn round_cents(value: Decimal) -> Cents {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(if value.is_sign_negative() { i64::MIN } else { i64::MAX })
}

/// Render cents as dollars for log lines, e.g. `$12.05`.
pub fn format_cents(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}${}.{:02}", abs / 100, abs % 100)
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(pub Uuid);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl TradeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TradeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instrument-{}", self.0)
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exchange-{}", self.0)
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side a counterparty takes.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            _ => Err(ExchangeError::Ledger(format!("Unknown order side: {s}"))),
        }
    }
}

/// Order lifecycle status.
///
/// `Pending → Active → {PartiallyFilled → Filled | Filled} | Cancelled | Expired`.
/// Filled, Cancelled and Expired are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Active,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
}

impl OrderStatus {
    /// Statuses in which an order can still be accepted or cancelled.
    pub const OPEN: &'static [OrderStatus] = &[
        OrderStatus::Pending,
        OrderStatus::Active,
        OrderStatus::PartiallyFilled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// Status implied by fill progress alone.
    pub fn from_fill(quantity_filled: i64, quantity: i64) -> Self {
        if quantity_filled >= quantity {
            OrderStatus::Filled
        } else if quantity_filled > 0 {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Active
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::Active => "Active",
            OrderStatus::PartiallyFilled => "PartiallyFilled",
            OrderStatus::Filled => "Filled",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Expired => "Expired",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(OrderStatus::Pending),
            "Active" => Ok(OrderStatus::Active),
            "PartiallyFilled" => Ok(OrderStatus::PartiallyFilled),
            "Filled" => Ok(OrderStatus::Filled),
            "Cancelled" => Ok(OrderStatus::Cancelled),
            "Expired" => Ok(OrderStatus::Expired),
            _ => Err(ExchangeError::Ledger(format!("Unknown order status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

/// A venue; every instrument is listed on exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub id: ExchangeId,
    pub name: String,
    /// Fee charged per trade, in percent of notional (0.15 = 0.15 %).
    pub fee_percent: Decimal,
}

/// A tradable company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub exchange_id: ExchangeId,
    pub ticker: String,
    pub name: String,
    pub total_shares: i64,
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.ticker, self.name)
    }
}

// ---------------------------------------------------------------------------
// Agents & holdings
// ---------------------------------------------------------------------------

/// An autonomous trading bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    /// Strategy key, resolved by `Strategy::from_key`.
    pub strategy: String,
    pub balance: Cents,
    /// Fraction of the cash balance a single buy may commit.
    pub max_risk_per_trade: Decimal,
    /// Fraction of an instrument's shares outstanding the agent may hold.
    pub max_position_fraction: Decimal,
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] balance={} strategy={}",
            self.name,
            self.id,
            format_cents(self.balance),
            self.strategy,
        )
    }
}

/// An agent's position in one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shareholding {
    pub agent_id: AgentId,
    pub instrument_id: InstrumentId,
    pub shares: i64,
    pub average_price: Cents,
}

impl Shareholding {
    /// An empty position (used before the first acquisition).
    pub fn empty(agent_id: AgentId, instrument_id: InstrumentId) -> Self {
        Self {
            agent_id,
            instrument_id,
            shares: 0,
            average_price: 0,
        }
    }

    /// Cost basis of the position; `None` on overflow.
    pub fn cost_basis(&self) -> Option<Cents> {
        checked_notional(self.average_price, self.shares)
    }

    /// Weighted average price after acquiring `quantity` more at `price`.
    ///
    /// `None` when the resulting position or its cost overflows.
    pub fn average_after_buy(&self, quantity: i64, price: Cents) -> Option<Cents> {
        let total = self.shares.checked_add(quantity)?;
        if total <= 0 {
            return Some(0);
        }
        let cost = Decimal::from(self.cost_basis()?)
            .checked_add(Decimal::from(checked_notional(price, quantity)?))?;
        Some(round_cents(cost / Decimal::from(total)))
    }
}

// ---------------------------------------------------------------------------
// Orders & trades
// ---------------------------------------------------------------------------

/// A standing offer to buy or sell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub agent_id: AgentId,
    pub instrument_id: InstrumentId,
    pub side: Side,
    pub price: Cents,
    pub quantity: i64,
    pub quantity_filled: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}/{} @ {} [{}] ({})",
            self.side,
            self.instrument_id,
            self.quantity_filled,
            self.quantity,
            format_cents(self.price),
            self.status,
            self.id,
        )
    }
}

impl Order {
    /// Quantity still available to a counterparty.
    pub fn remaining(&self) -> i64 {
        self.quantity - self.quantity_filled
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether a counterparty may accept this order at `now`.
    pub fn is_acceptable_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && self.remaining() > 0 && !self.is_expired_at(now)
    }

    /// Age of the order at `now`.
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Filter for open counter-orders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderFilter {
    pub instrument_id: Option<InstrumentId>,
    pub side: Option<Side>,
    /// Leave out orders owned by this agent.
    pub exclude_agent: Option<AgentId>,
}

/// Arguments to the Ledger's atomic accept primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptRequest {
    pub acceptor: AgentId,
    pub order_id: OrderId,
    pub quantity: i64,
    pub fee: Cents,
}

/// Immutable record of one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub buyer_id: AgentId,
    pub seller_id: AgentId,
    pub instrument_id: InstrumentId,
    pub price: Cents,
    pub quantity: i64,
    pub fee: Cents,
    pub executed_at: DateTime<Utc>,
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} x{} @ {} {} -> {} (fee: {}) [{}]",
            self.instrument_id,
            self.quantity,
            format_cents(self.price),
            self.seller_id,
            self.buyer_id,
            format_cents(self.fee),
            self.id,
        )
    }
}

impl Trade {
    pub fn notional(&self) -> Option<Cents> {
        checked_notional(self.price, self.quantity)
    }
}

/// Ledger result of a successful accept: the trade and the order after it.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptOutcome {
    pub trade: Trade,
    pub order: Order,
}

/// What `accept` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeSummary {
    pub trade: Trade,
    pub order_status: OrderStatus,
    pub remaining: i64,
}

impl From<AcceptOutcome> for TradeSummary {
    fn from(outcome: AcceptOutcome) -> Self {
        Self {
            order_status: outcome.order.status,
            remaining: outcome.order.remaining(),
            trade: outcome.trade,
        }
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument_id: InstrumentId,
    /// Bar period label, e.g. `1m` or `1d`.
    pub period: String,
    pub open: Cents,
    pub high: Cents,
    pub low: Cents,
    pub close: Cents,
    pub volume: i64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

/// What a strategy wants done this tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OrderIntent {
    PlaceBuy {
        instrument_id: InstrumentId,
        price: Cents,
        quantity: i64,
    },
    PlaceSell {
        instrument_id: InstrumentId,
        price: Cents,
        quantity: i64,
    },
    Cancel {
        order_id: OrderId,
    },
}

impl OrderIntent {
    pub fn buy(instrument_id: InstrumentId, price: Cents, quantity: i64) -> Self {
        OrderIntent::PlaceBuy {
            instrument_id,
            price,
            quantity,
        }
    }

    pub fn sell(instrument_id: InstrumentId, price: Cents, quantity: i64) -> Self {
        OrderIntent::PlaceSell {
            instrument_id,
            price,
            quantity,
        }
    }

    /// Side of a placement intent (`None` for cancels).
    pub fn side(&self) -> Option<Side> {
        match self {
            OrderIntent::PlaceBuy { .. } => Some(Side::Buy),
            OrderIntent::PlaceSell { .. } => Some(Side::Sell),
            OrderIntent::Cancel { .. } => None,
        }
    }
}

impl fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderIntent::PlaceBuy {
                instrument_id,
                price,
                quantity,
            } => write!(f, "BUY {instrument_id} x{quantity} @ {}", format_cents(*price)),
            OrderIntent::PlaceSell {
                instrument_id,
                price,
                quantity,
            } => write!(f, "SELL {instrument_id} x{quantity} @ {}", format_cents(*price)),
            OrderIntent::Cancel { order_id } => write!(f, "CANCEL {order_id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain errors for every order and ledger operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExchangeError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Agent {requester} may not modify order {order_id}")]
    Forbidden { order_id: OrderId, requester: AgentId },

    #[error("Order {order_id} is already {status}")]
    AlreadyTerminal { order_id: OrderId, status: OrderStatus },

    #[error("Order {order_id} is not acceptable: {reason}")]
    NotAcceptable { order_id: OrderId, reason: String },

    #[error("Agent {agent_id} cannot accept its own order {order_id}")]
    SelfTrade { order_id: OrderId, agent_id: AgentId },

    #[error("Insufficient shares: need {needed}, hold {held}")]
    InsufficientShares { needed: i64, held: i64 },

    #[error("Insufficient funds: need {needed} cents, have {available} cents")]
    InsufficientFunds { needed: Cents, available: Cents },

    #[error("Ledger failure: {0}")]
    Ledger(String),
}

impl ExchangeError {
    /// A counterparty got there first; a normal outcome under contention.
    pub fn is_race_lost(&self) -> bool {
        matches!(self, ExchangeError::NotAcceptable { .. })
    }

    /// Transport or transaction failure at the persistence boundary.
    pub fn is_ledger_failure(&self) -> bool {
        matches!(self, ExchangeError::Ledger(_))
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeError::Validation(_) => "validation",
            ExchangeError::NotFound(_) => "not_found",
            ExchangeError::Forbidden { .. } => "forbidden",
            ExchangeError::AlreadyTerminal { .. } => "already_terminal",
            ExchangeError::NotAcceptable { .. } => "not_acceptable",
            ExchangeError::SelfTrade { .. } => "self_trade",
            ExchangeError::InsufficientShares { .. } => "insufficient_shares",
            ExchangeError::InsufficientFunds { .. } => "insufficient_funds",
            ExchangeError::Ledger(_) => "ledger_failure",
        }
    }
}

impl From<sqlx::Error> for ExchangeError {
    fn from(err: sqlx::Error) -> Self {
        ExchangeError::Ledger(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
