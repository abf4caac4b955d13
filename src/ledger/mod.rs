//! The durable store behind the exchange.
//!
//! Defines the `Ledger` trait (orders, trades, holdings, balances) and the
//! read-only `MarketView` trait (candles and last prices), plus the SQLite
//! implementation of both.
//!
//! The Ledger is the only writer of shared state. Agents read snapshots
//! through it and funnel every mutation through `insert_order`,
//! `cancel_order`, `accept_order` and `expire_orders`.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    AcceptOutcome, AcceptRequest, Agent, AgentId, Candle, Cents, Exchange, ExchangeError,
    ExchangeId, Instrument, InstrumentId, Order, OrderFilter, OrderId, Shareholding, Trade,
};

pub use sqlite::SqliteLedger;

pub type LedgerResult<T> = Result<T, ExchangeError>;

/// Abstraction over the order book, trade, holding and balance store.
///
/// `accept_order` must be atomic and serializable with respect to every
/// other `accept_order` on the same order: when two callers race for the
/// same remaining quantity exactly one succeeds, the other gets
/// `ExchangeError::NotAcceptable` and nothing is written on its behalf.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Fetch an agent by id.
    async fn agent(&self, id: AgentId) -> LedgerResult<Option<Agent>>;

    /// All agents, ordered by id.
    async fn agents(&self) -> LedgerResult<Vec<Agent>>;

    /// Fetch an instrument by id.
    async fn instrument(&self, id: InstrumentId) -> LedgerResult<Option<Instrument>>;

    /// All instruments, ordered by id.
    async fn instruments(&self) -> LedgerResult<Vec<Instrument>>;

    /// Fetch an exchange by id.
    async fn exchange(&self, id: ExchangeId) -> LedgerResult<Option<Exchange>>;

    /// Every non-empty position the agent holds.
    async fn holdings(&self, agent: AgentId) -> LedgerResult<Vec<Shareholding>>;

    /// The agent's position in one instrument, if it was ever created.
    async fn holding(
        &self,
        agent: AgentId,
        instrument: InstrumentId,
    ) -> LedgerResult<Option<Shareholding>>;

    /// Fetch an order by id.
    async fn order(&self, id: OrderId) -> LedgerResult<Option<Order>>;

    /// The agent's open orders, oldest first.
    async fn active_orders(&self, agent: AgentId) -> LedgerResult<Vec<Order>>;

    /// Open orders matching `filter`, oldest first.
    async fn open_orders(&self, filter: &OrderFilter) -> LedgerResult<Vec<Order>>;

    /// Most recent trades, newest first.
    async fn recent_trades(&self, limit: u32) -> LedgerResult<Vec<Trade>>;

    /// Persist a freshly created order.
    async fn insert_order(&self, order: &Order) -> LedgerResult<()>;

    /// Move an open order to `Cancelled`.
    ///
    /// Fails with `AlreadyTerminal` when the order reached a terminal
    /// status before the write landed.
    async fn cancel_order(&self, id: OrderId) -> LedgerResult<Order>;

    /// The atomic accept primitive.
    ///
    /// All-or-nothing: one trade row, the order's fill progress and status,
    /// both parties' holdings and both parties' balances.
    async fn accept_order(&self, request: AcceptRequest) -> LedgerResult<AcceptOutcome>;

    /// Move every open order whose expiry is at or before `now` to `Expired`.
    async fn expire_orders(&self, now: DateTime<Utc>) -> LedgerResult<u64>;
}

/// Read-only market data consumed by strategies.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketView: Send + Sync {
    /// Up to `limit` most recent candles, newest first.
    async fn recent_candles(
        &self,
        instrument: InstrumentId,
        limit: u32,
    ) -> LedgerResult<Vec<Candle>>;

    /// Last traded price, falling back to the latest candle close.
    async fn latest_price(&self, instrument: InstrumentId) -> LedgerResult<Option<Cents>>;
}
