//! SQLite-backed ledger.
//!
//! Every mutation runs as a single statement or a single transaction. The
//! accept primitive opens its transaction with a guarded
//! `UPDATE … RETURNING`, so the write lock is taken before anything is read
//! and a caller that lost the race for the remaining quantity sees zero
//! affected rows instead of a stale snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Ledger, LedgerResult, MarketView};
use crate::types::{
    checked_notional, AcceptOutcome, AcceptRequest, Agent, AgentId, Candle, Cents, Exchange, ExchangeError,
    ExchangeId, Instrument, InstrumentId, Order, OrderFilter, OrderId, OrderStatus,
    Shareholding, Side, Trade, TradeId,
};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS exchanges (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        TEXT NOT NULL,
        fee_percent TEXT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS instruments (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        exchange_id  INTEGER NOT NULL REFERENCES exchanges(id),
        ticker       TEXT NOT NULL UNIQUE,
        name         TEXT NOT NULL,
        total_shares INTEGER NOT NULL CHECK (total_shares >= 0)
    )",
    r"CREATE TABLE IF NOT EXISTS agents (
        id                    INTEGER PRIMARY KEY AUTOINCREMENT,
        name                  TEXT NOT NULL,
        strategy              TEXT NOT NULL,
        balance               INTEGER NOT NULL,
        max_risk_per_trade    TEXT NOT NULL,
        max_position_fraction TEXT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS shareholdings (
        agent_id      INTEGER NOT NULL REFERENCES agents(id),
        instrument_id INTEGER NOT NULL REFERENCES instruments(id),
        shares        INTEGER NOT NULL CHECK (shares >= 0),
        average_price INTEGER NOT NULL,
        PRIMARY KEY (agent_id, instrument_id)
    )",
    r"CREATE TABLE IF NOT EXISTS orders (
        id              TEXT PRIMARY KEY,
        agent_id        INTEGER NOT NULL REFERENCES agents(id),
        instrument_id   INTEGER NOT NULL REFERENCES instruments(id),
        side            TEXT NOT NULL CHECK (side IN ('Buy', 'Sell')),
        price           INTEGER NOT NULL CHECK (price > 0),
        quantity        INTEGER NOT NULL CHECK (quantity > 0),
        quantity_filled INTEGER NOT NULL DEFAULT 0
                        CHECK (quantity_filled >= 0 AND quantity_filled <= quantity),
        status          TEXT NOT NULL,
        created_at      TEXT NOT NULL,
        expires_at      TEXT
    )",
    r"CREATE INDEX IF NOT EXISTS idx_orders_book
        ON orders (instrument_id, side, status)",
    r"CREATE INDEX IF NOT EXISTS idx_orders_agent
        ON orders (agent_id, status)",
    r"CREATE TABLE IF NOT EXISTS trades (
        id            TEXT PRIMARY KEY,
        buy_order_id  TEXT NOT NULL REFERENCES orders(id),
        sell_order_id TEXT NOT NULL REFERENCES orders(id),
        buyer_id      INTEGER NOT NULL REFERENCES agents(id),
        seller_id     INTEGER NOT NULL REFERENCES agents(id),
        instrument_id INTEGER NOT NULL REFERENCES instruments(id),
        price         INTEGER NOT NULL,
        quantity      INTEGER NOT NULL CHECK (quantity > 0),
        fee           INTEGER NOT NULL,
        executed_at   TEXT NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_trades_instrument
        ON trades (instrument_id, executed_at)",
    r"CREATE TABLE IF NOT EXISTS price_history (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        instrument_id INTEGER NOT NULL REFERENCES instruments(id),
        period        TEXT NOT NULL,
        open          INTEGER NOT NULL,
        high          INTEGER NOT NULL,
        low           INTEGER NOT NULL,
        close         INTEGER NOT NULL,
        volume        INTEGER NOT NULL,
        timestamp     TEXT NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_price_history_instrument
        ON price_history (instrument_id, timestamp)",
];

const OPEN_STATUSES: &str = "('Pending', 'Active', 'PartiallyFilled')";

const ORDER_COLUMNS: &str =
    "id, agent_id, instrument_id, side, price, quantity, quantity_filled, status, created_at, expires_at";

// ---------------------------------------------------------------------------
// Bootstrap records
// ---------------------------------------------------------------------------

/// Fields needed to register a new agent.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub name: String,
    pub strategy: String,
    pub balance: Cents,
    pub max_risk_per_trade: Decimal,
    pub max_position_fraction: Decimal,
}

impl NewAgent {
    /// An agent with no risk limits beyond its cash.
    pub fn new(name: &str, strategy: &str, balance: Cents) -> Self {
        Self {
            name: name.to_string(),
            strategy: strategy.to_string(),
            balance,
            max_risk_per_trade: Decimal::ONE,
            max_position_fraction: Decimal::ONE,
        }
    }

    pub fn with_risk(mut self, max_risk_per_trade: Decimal, max_position_fraction: Decimal) -> Self {
        self.max_risk_per_trade = max_risk_per_trade;
        self.max_position_fraction = max_position_fraction;
        self
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (creating if missing) a file-backed ledger and apply the schema.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!(database_url, max_connections, "SQLite ledger connected");

        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// A private in-memory ledger.
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool
    /// is pinned to a single connection that never expires.
    pub async fn in_memory() -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// Create tables and indexes if they don't exist yet.
    pub async fn migrate(&self) -> LedgerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!(statements = SCHEMA.len(), "Ledger schema applied");
        Ok(())
    }

    // -- administrative inserts ---------------------------------------------

    pub async fn create_exchange(&self, name: &str, fee_percent: Decimal) -> LedgerResult<Exchange> {
        let result = sqlx::query("INSERT INTO exchanges (name, fee_percent) VALUES (?, ?)")
            .bind(name)
            .bind(fee_percent.to_string())
            .execute(&self.pool)
            .await?;

        Ok(Exchange {
            id: ExchangeId(result.last_insert_rowid()),
            name: name.to_string(),
            fee_percent,
        })
    }

    pub async fn create_instrument(
        &self,
        exchange_id: ExchangeId,
        ticker: &str,
        name: &str,
        total_shares: i64,
    ) -> LedgerResult<Instrument> {
        let result = sqlx::query(
            "INSERT INTO instruments (exchange_id, ticker, name, total_shares) VALUES (?, ?, ?, ?)",
        )
        .bind(exchange_id.0)
        .bind(ticker)
        .bind(name)
        .bind(total_shares)
        .execute(&self.pool)
        .await?;

        Ok(Instrument {
            id: InstrumentId(result.last_insert_rowid()),
            exchange_id,
            ticker: ticker.to_string(),
            name: name.to_string(),
            total_shares,
        })
    }

    pub async fn create_agent(&self, agent: NewAgent) -> LedgerResult<Agent> {
        let result = sqlx::query(
            "INSERT INTO agents (name, strategy, balance, max_risk_per_trade, max_position_fraction)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&agent.name)
        .bind(&agent.strategy)
        .bind(agent.balance)
        .bind(agent.max_risk_per_trade.to_string())
        .bind(agent.max_position_fraction.to_string())
        .execute(&self.pool)
        .await?;

        Ok(Agent {
            id: AgentId(result.last_insert_rowid()),
            name: agent.name,
            strategy: agent.strategy,
            balance: agent.balance,
            max_risk_per_trade: agent.max_risk_per_trade,
            max_position_fraction: agent.max_position_fraction,
        })
    }

    /// Overwrite a position (seeding only; trades go through `accept_order`).
    pub async fn set_holding(
        &self,
        agent: AgentId,
        instrument: InstrumentId,
        shares: i64,
        average_price: Cents,
    ) -> LedgerResult<()> {
        if shares < 0 {
            return Err(ExchangeError::Validation(format!(
                "shares must be >= 0, got {shares}"
            )));
        }
        sqlx::query(
            "INSERT INTO shareholdings (agent_id, instrument_id, shares, average_price)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (agent_id, instrument_id)
             DO UPDATE SET shares = excluded.shares, average_price = excluded.average_price",
        )
        .bind(agent.0)
        .bind(instrument.0)
        .bind(shares)
        .bind(average_price)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append one bar to the price history.
    pub async fn append_candle(&self, candle: &Candle) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO price_history (instrument_id, period, open, high, low, close, volume, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(candle.instrument_id.0)
        .bind(&candle.period)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .bind(candle.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of trades recorded against an order, on either side.
    pub async fn trade_count_for_order(&self, id: OrderId) -> LedgerResult<i64> {
        let key = id.to_string();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM trades WHERE buy_order_id = ? OR sell_order_id = ?",
        )
        .bind(&key)
        .bind(&key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // -- accept internals ---------------------------------------------------

    /// Explain why the guarded fill touched no row.
    async fn diagnose_rejected_accept(
        tx: &mut Transaction<'_, Sqlite>,
        request: &AcceptRequest,
        now: DateTime<Utc>,
    ) -> LedgerResult<ExchangeError> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?"))
            .bind(request.order_id.to_string())
            .fetch_optional(&mut **tx)
            .await?;

        let Some(row) = row else {
            return Ok(ExchangeError::NotFound(format!("order {}", request.order_id)));
        };
        let order = order_from_row(&row)?;

        if order.agent_id == request.acceptor {
            return Ok(ExchangeError::SelfTrade {
                order_id: order.id,
                agent_id: request.acceptor,
            });
        }

        let reason = if order.status.is_terminal() {
            format!("order is {}", order.status)
        } else if order.is_expired_at(now) {
            "order has expired".to_string()
        } else {
            format!(
                "remaining quantity {} is below requested {}",
                order.remaining(),
                request.quantity
            )
        };

        Ok(ExchangeError::NotAcceptable {
            order_id: order.id,
            reason,
        })
    }
}

fn oversized(price: Cents, quantity: i64) -> ExchangeError {
    ExchangeError::Validation(format!(
        "trade value {quantity} x {price} cents is too large"
    ))
}

async fn rollback_with<T>(
    tx: Transaction<'_, Sqlite>,
    err: ExchangeError,
) -> LedgerResult<T> {
    tx.rollback().await?;
    Err(err)
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn parse_uuid(raw: &str) -> LedgerResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| ExchangeError::Ledger(format!("Bad id {raw:?}: {e}")))
}

fn parse_decimal(raw: &str) -> LedgerResult<Decimal> {
    Decimal::from_str(raw).map_err(|e| ExchangeError::Ledger(format!("Bad decimal {raw:?}: {e}")))
}

fn order_from_row(row: &SqliteRow) -> LedgerResult<Order> {
    Ok(Order {
        id: OrderId(parse_uuid(&row.try_get::<String, _>("id")?)?),
        agent_id: AgentId(row.try_get("agent_id")?),
        instrument_id: InstrumentId(row.try_get("instrument_id")?),
        side: row.try_get::<String, _>("side")?.parse()?,
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        quantity_filled: row.try_get("quantity_filled")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn agent_from_row(row: &SqliteRow) -> LedgerResult<Agent> {
    Ok(Agent {
        id: AgentId(row.try_get("id")?),
        name: row.try_get("name")?,
        strategy: row.try_get("strategy")?,
        balance: row.try_get("balance")?,
        max_risk_per_trade: parse_decimal(&row.try_get::<String, _>("max_risk_per_trade")?)?,
        max_position_fraction: parse_decimal(&row.try_get::<String, _>("max_position_fraction")?)?,
    })
}

fn instrument_from_row(row: &SqliteRow) -> LedgerResult<Instrument> {
    Ok(Instrument {
        id: InstrumentId(row.try_get("id")?),
        exchange_id: ExchangeId(row.try_get("exchange_id")?),
        ticker: row.try_get("ticker")?,
        name: row.try_get("name")?,
        total_shares: row.try_get("total_shares")?,
    })
}

fn holding_from_row(row: &SqliteRow) -> LedgerResult<Shareholding> {
    Ok(Shareholding {
        agent_id: AgentId(row.try_get("agent_id")?),
        instrument_id: InstrumentId(row.try_get("instrument_id")?),
        shares: row.try_get("shares")?,
        average_price: row.try_get("average_price")?,
    })
}

fn trade_from_row(row: &SqliteRow) -> LedgerResult<Trade> {
    Ok(Trade {
        id: TradeId(parse_uuid(&row.try_get::<String, _>("id")?)?),
        buy_order_id: OrderId(parse_uuid(&row.try_get::<String, _>("buy_order_id")?)?),
        sell_order_id: OrderId(parse_uuid(&row.try_get::<String, _>("sell_order_id")?)?),
        buyer_id: AgentId(row.try_get("buyer_id")?),
        seller_id: AgentId(row.try_get("seller_id")?),
        instrument_id: InstrumentId(row.try_get("instrument_id")?),
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        fee: row.try_get("fee")?,
        executed_at: row.try_get("executed_at")?,
    })
}

fn candle_from_row(row: &SqliteRow) -> LedgerResult<Candle> {
    Ok(Candle {
        instrument_id: InstrumentId(row.try_get("instrument_id")?),
        period: row.try_get("period")?,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        volume: row.try_get("volume")?,
        timestamp: row.try_get("timestamp")?,
    })
}

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl Ledger for SqliteLedger {
    async fn agent(&self, id: AgentId) -> LedgerResult<Option<Agent>> {
        sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(agent_from_row)
            .transpose()
    }

    async fn agents(&self) -> LedgerResult<Vec<Agent>> {
        sqlx::query("SELECT * FROM agents ORDER BY id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(agent_from_row)
            .collect()
    }

    async fn instrument(&self, id: InstrumentId) -> LedgerResult<Option<Instrument>> {
        sqlx::query("SELECT * FROM instruments WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(instrument_from_row)
            .transpose()
    }

    async fn instruments(&self) -> LedgerResult<Vec<Instrument>> {
        sqlx::query("SELECT * FROM instruments ORDER BY id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(instrument_from_row)
            .collect()
    }

    async fn exchange(&self, id: ExchangeId) -> LedgerResult<Option<Exchange>> {
        let row = sqlx::query("SELECT id, name, fee_percent FROM exchanges WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Exchange {
                id: ExchangeId(row.try_get("id")?),
                name: row.try_get("name")?,
                fee_percent: parse_decimal(&row.try_get::<String, _>("fee_percent")?)?,
            })),
            None => Ok(None),
        }
    }

    async fn holdings(&self, agent: AgentId) -> LedgerResult<Vec<Shareholding>> {
        sqlx::query(
            "SELECT * FROM shareholdings WHERE agent_id = ? AND shares > 0 ORDER BY instrument_id",
        )
        .bind(agent.0)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(holding_from_row)
        .collect()
    }

    async fn holding(
        &self,
        agent: AgentId,
        instrument: InstrumentId,
    ) -> LedgerResult<Option<Shareholding>> {
        sqlx::query("SELECT * FROM shareholdings WHERE agent_id = ? AND instrument_id = ?")
            .bind(agent.0)
            .bind(instrument.0)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(holding_from_row)
            .transpose()
    }

    async fn order(&self, id: OrderId) -> LedgerResult<Option<Order>> {
        sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(order_from_row)
            .transpose()
    }

    async fn active_orders(&self, agent: AgentId) -> LedgerResult<Vec<Order>> {
        sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE agent_id = ? AND status IN {OPEN_STATUSES}
             ORDER BY created_at"
        ))
        .bind(agent.0)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(order_from_row)
        .collect()
    }

    async fn open_orders(&self, filter: &OrderFilter) -> LedgerResult<Vec<Order>> {
        let instrument = filter.instrument_id.map(|i| i.0);
        let side = filter.side.map(|s| s.as_str());
        let exclude = filter.exclude_agent.map(|a| a.0);

        sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE status IN {OPEN_STATUSES}
               AND quantity_filled < quantity
               AND (expires_at IS NULL OR expires_at > ?)
               AND (? IS NULL OR instrument_id = ?)
               AND (? IS NULL OR side = ?)
               AND (? IS NULL OR agent_id <> ?)
             ORDER BY created_at"
        ))
        .bind(Utc::now())
        .bind(instrument)
        .bind(instrument)
        .bind(side)
        .bind(side)
        .bind(exclude)
        .bind(exclude)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(order_from_row)
        .collect()
    }

    async fn recent_trades(&self, limit: u32) -> LedgerResult<Vec<Trade>> {
        sqlx::query("SELECT * FROM trades ORDER BY executed_at DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(trade_from_row)
            .collect()
    }

    async fn insert_order(&self, order: &Order) -> LedgerResult<()> {
        sqlx::query(&format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(order.id.to_string())
        .bind(order.agent_id.0)
        .bind(order.instrument_id.0)
        .bind(order.side.as_str())
        .bind(order.price)
        .bind(order.quantity)
        .bind(order.quantity_filled)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .bind(order.expires_at)
        .execute(&self.pool)
        .await?;

        debug!(order_id = %order.id, agent = %order.agent_id, "Order inserted");
        Ok(())
    }

    async fn cancel_order(&self, id: OrderId) -> LedgerResult<Order> {
        let row = sqlx::query(&format!(
            "UPDATE orders SET status = 'Cancelled'
             WHERE id = ? AND status IN {OPEN_STATUSES}
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return order_from_row(&row);
        }

        match self.order(id).await? {
            Some(order) => Err(ExchangeError::AlreadyTerminal {
                order_id: id,
                status: order.status,
            }),
            None => Err(ExchangeError::NotFound(format!("order {id}"))),
        }
    }

    async fn accept_order(&self, request: AcceptRequest) -> LedgerResult<AcceptOutcome> {
        if request.quantity <= 0 {
            return Err(ExchangeError::Validation(format!(
                "trade quantity must be positive, got {}",
                request.quantity
            )));
        }
        if request.fee < 0 {
            return Err(ExchangeError::Validation(format!(
                "fee must be non-negative, got {}",
                request.fee
            )));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Fill first: this statement is the serialization point.
        let filled = sqlx::query(&format!(
            "UPDATE orders
             SET quantity_filled = quantity_filled + ?,
                 status = CASE WHEN quantity_filled + ? >= quantity
                               THEN 'Filled' ELSE 'PartiallyFilled' END
             WHERE id = ?
               AND agent_id <> ?
               AND status IN {OPEN_STATUSES}
               AND quantity - quantity_filled >= ?
               AND (expires_at IS NULL OR expires_at > ?)
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(request.quantity)
        .bind(request.quantity)
        .bind(request.order_id.to_string())
        .bind(request.acceptor.0)
        .bind(request.quantity)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let order = match filled {
            Some(row) => order_from_row(&row)?,
            None => {
                let err = Self::diagnose_rejected_accept(&mut tx, &request, now).await?;
                return rollback_with(tx, err).await;
            }
        };

        let (buyer, seller) = match order.side {
            Side::Sell => (request.acceptor, order.agent_id),
            Side::Buy => (order.agent_id, request.acceptor),
        };
        let quantity = request.quantity;
        let Some(notional) = checked_notional(order.price, quantity) else {
            return rollback_with(tx, oversized(order.price, quantity)).await;
        };

        // Seller must hold the shares at commit time.
        let seller_shares: i64 = sqlx::query_scalar(
            "SELECT shares FROM shareholdings WHERE agent_id = ? AND instrument_id = ?",
        )
        .bind(seller.0)
        .bind(order.instrument_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(0);

        if seller_shares < quantity {
            return rollback_with(
                tx,
                ExchangeError::InsufficientShares {
                    needed: quantity,
                    held: seller_shares,
                },
            )
            .await;
        }

        // Buyer pays notional plus fee.
        let buyer_balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM agents WHERE id = ?")
                .bind(buyer.0)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(buyer_balance) = buyer_balance else {
            return rollback_with(tx, ExchangeError::NotFound(format!("agent {}", buyer.0))).await;
        };

        let Some(cost) = notional.checked_add(request.fee) else {
            return rollback_with(tx, oversized(order.price, quantity)).await;
        };
        if buyer_balance < cost {
            return rollback_with(
                tx,
                ExchangeError::InsufficientFunds {
                    needed: cost,
                    available: buyer_balance,
                },
            )
            .await;
        }

        sqlx::query("UPDATE agents SET balance = balance - ? WHERE id = ?")
            .bind(cost)
            .bind(buyer.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE agents SET balance = balance + ? WHERE id = ?")
            .bind(notional - request.fee)
            .bind(seller.0)
            .execute(&mut *tx)
            .await?;

        // Shares move from seller to buyer.
        sqlx::query(
            "UPDATE shareholdings
             SET shares = shares - ?,
                 average_price = CASE WHEN shares - ? = 0 THEN 0 ELSE average_price END
             WHERE agent_id = ? AND instrument_id = ?",
        )
        .bind(quantity)
        .bind(quantity)
        .bind(seller.0)
        .bind(order.instrument_id.0)
        .execute(&mut *tx)
        .await?;

        let buyer_holding = sqlx::query(
            "SELECT * FROM shareholdings WHERE agent_id = ? AND instrument_id = ?",
        )
        .bind(buyer.0)
        .bind(order.instrument_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(holding_from_row)
        .transpose()?
        .unwrap_or_else(|| Shareholding::empty(buyer, order.instrument_id));

        let (Some(shares_after), Some(average_after)) = (
            buyer_holding.shares.checked_add(quantity),
            buyer_holding.average_after_buy(quantity, order.price),
        ) else {
            return rollback_with(tx, oversized(order.price, quantity)).await;
        };

        sqlx::query(
            "INSERT INTO shareholdings (agent_id, instrument_id, shares, average_price)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (agent_id, instrument_id)
             DO UPDATE SET shares = excluded.shares, average_price = excluded.average_price",
        )
        .bind(buyer.0)
        .bind(order.instrument_id.0)
        .bind(shares_after)
        .bind(average_after)
        .execute(&mut *tx)
        .await?;

        // The acceptor's side is recorded as an already-filled order.
        let counter = Order {
            id: OrderId::new(),
            agent_id: request.acceptor,
            instrument_id: order.instrument_id,
            side: order.side.opposite(),
            price: order.price,
            quantity,
            quantity_filled: quantity,
            status: OrderStatus::Filled,
            created_at: now,
            expires_at: None,
        };
        sqlx::query(&format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(counter.id.to_string())
        .bind(counter.agent_id.0)
        .bind(counter.instrument_id.0)
        .bind(counter.side.as_str())
        .bind(counter.price)
        .bind(counter.quantity)
        .bind(counter.quantity_filled)
        .bind(counter.status.as_str())
        .bind(counter.created_at)
        .bind(counter.expires_at)
        .execute(&mut *tx)
        .await?;

        let (buy_order_id, sell_order_id) = match order.side {
            Side::Sell => (counter.id, order.id),
            Side::Buy => (order.id, counter.id),
        };
        let trade = Trade {
            id: TradeId::new(),
            buy_order_id,
            sell_order_id,
            buyer_id: buyer,
            seller_id: seller,
            instrument_id: order.instrument_id,
            price: order.price,
            quantity,
            fee: request.fee,
            executed_at: now,
        };
        sqlx::query(
            "INSERT INTO trades (id, buy_order_id, sell_order_id, buyer_id, seller_id,
                                 instrument_id, price, quantity, fee, executed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(trade.id.to_string())
        .bind(trade.buy_order_id.to_string())
        .bind(trade.sell_order_id.to_string())
        .bind(trade.buyer_id.0)
        .bind(trade.seller_id.0)
        .bind(trade.instrument_id.0)
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(trade.fee)
        .bind(trade.executed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            trade_id = %trade.id,
            order_id = %order.id,
            buyer = %buyer,
            seller = %seller,
            quantity,
            price = order.price,
            fee = request.fee,
            status = %order.status,
            "Trade committed"
        );

        Ok(AcceptOutcome { trade, order })
    }

    async fn expire_orders(&self, now: DateTime<Utc>) -> LedgerResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE orders SET status = 'Expired'
             WHERE status IN {OPEN_STATUSES}
               AND expires_at IS NOT NULL
               AND expires_at <= ?"
        ))
        .bind(now)
        .execute(&self.pool)
        .await?;

        let expired = result.rows_affected();
        if expired > 0 {
            info!(expired, "Expired stale orders");
        }
        Ok(expired)
    }
}

#[async_trait]
impl MarketView for SqliteLedger {
    async fn recent_candles(
        &self,
        instrument: InstrumentId,
        limit: u32,
    ) -> LedgerResult<Vec<Candle>> {
        sqlx::query(
            "SELECT * FROM price_history WHERE instrument_id = ?
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(instrument.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(candle_from_row)
        .collect()
    }

    async fn latest_price(&self, instrument: InstrumentId) -> LedgerResult<Option<Cents>> {
        let traded: Option<i64> = sqlx::query_scalar(
            "SELECT price FROM trades WHERE instrument_id = ? ORDER BY executed_at DESC LIMIT 1",
        )
        .bind(instrument.0)
        .fetch_optional(&self.pool)
        .await?;

        if traded.is_some() {
            return Ok(traded);
        }

        let close: Option<i64> = sqlx::query_scalar(
            "SELECT close FROM price_history WHERE instrument_id = ?
             ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .bind(instrument.0)
        .fetch_optional(&self.pool)
        .await?;

        if close.is_none() {
            warn!(instrument = %instrument, "No price available");
        }
        Ok(close)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
