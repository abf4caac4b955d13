//! Strategy engine: indicator-driven order decisions.
//!
//! A `Strategy` turns a per-tick snapshot of the market (one
//! `InstrumentView` per listed instrument) into `OrderIntent`s. Decisions
//! are synchronous and side-effect free; the only input besides the views
//! is the random source used by `RandomTrader`.

pub mod dividend;
pub mod indicators;
pub mod mean_reversion;
pub mod momentum;
pub mod random;
pub mod risk;

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::{adjust_price, Cents, Instrument, Order, OrderIntent, Shareholding};
use dividend::Dividend;
use indicators::{relative_strength_index, simple_moving_average, RSI_PERIOD};
use mean_reversion::MeanReversion;
use momentum::Momentum;
use random::RandomTrader;

// ---------------------------------------------------------------------------
// Shared trading constants
// ---------------------------------------------------------------------------

/// Shares per indicator-driven order.
pub const TRADE_LOT: i64 = 10;

/// Indicator strategies stop buying at this position size.
pub const MAX_HOLDING: i64 = 100;

/// Minimum candle history before an indicator strategy acts.
pub const MIN_CANDLES: usize = 14;

/// Buys are placed 1 % above the current price.
pub const BUY_MARKUP: Decimal = dec!(1.01);

/// Sells are placed 1 % below the current price.
pub const SELL_MARKDOWN: Decimal = dec!(0.99);

pub(crate) fn buy_price(price: Cents) -> Cents {
    adjust_price(price, BUY_MARKUP)
}

pub(crate) fn sell_price(price: Cents) -> Cents {
    adjust_price(price, SELL_MARKDOWN)
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// What an agent sees of one instrument during a tick.
#[derive(Debug, Clone)]
pub struct InstrumentView {
    pub instrument: Instrument,
    /// Close prices in cents, most recent first.
    pub closes: Vec<f64>,
    /// The agent's position (empty if it never held any).
    pub holding: Shareholding,
    /// Last traded price; `None` when the instrument never traded.
    pub current_price: Option<Cents>,
    /// Fee percent of the exchange the instrument is listed on.
    pub fee_percent: Decimal,
}

impl InstrumentView {
    pub fn held(&self) -> i64 {
        self.holding.shares
    }
}

/// Indicator readings for one instrument on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrategySignal {
    pub sma_short: Option<f64>,
    pub sma_long: Option<f64>,
    pub rsi: Option<f64>,
}

impl StrategySignal {
    pub const SHORT_PERIOD: usize = 5;
    pub const LONG_PERIOD: usize = 20;

    pub fn compute(closes: &[f64]) -> Self {
        Self {
            sma_short: simple_moving_average(closes, Self::SHORT_PERIOD),
            sma_long: simple_moving_average(closes, Self::LONG_PERIOD),
            rsi: relative_strength_index(closes, RSI_PERIOD),
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy selection
// ---------------------------------------------------------------------------

/// The closed set of trading behaviours an agent can run.
#[derive(Debug, Clone)]
pub enum Strategy {
    Momentum(Momentum),
    MeanReversion(MeanReversion),
    Dividend(Dividend),
    Random(RandomTrader),
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Random(RandomTrader::default())
    }
}

impl Strategy {
    /// Resolve an agent's strategy key. Unknown keys fall back to `Random`.
    pub fn from_key(key: &str) -> Self {
        match key.trim().to_lowercase().as_str() {
            "momentum" => Strategy::Momentum(Momentum),
            "mean_reversion" | "meanreversion" => Strategy::MeanReversion(MeanReversion),
            "dividend" | "buy_and_hold" => Strategy::Dividend(Dividend),
            "random" => Strategy::Random(RandomTrader::default()),
            other => {
                warn!(key = other, "Unknown strategy key, falling back to random");
                Strategy::default()
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Momentum(_) => "momentum",
            Strategy::MeanReversion(_) => "mean_reversion",
            Strategy::Dividend(_) => "dividend",
            Strategy::Random(_) => "random",
        }
    }

    /// Produce this tick's placement intents across every instrument.
    pub fn decide<R: Rng>(&self, views: &[InstrumentView], rng: &mut R) -> Vec<OrderIntent> {
        let intents: Vec<OrderIntent> = match self {
            Strategy::Momentum(s) => views.iter().flat_map(|v| s.decide(v)).collect(),
            Strategy::MeanReversion(s) => views.iter().flat_map(|v| s.decide(v)).collect(),
            Strategy::Dividend(s) => views.iter().flat_map(|v| s.decide(v)).collect(),
            Strategy::Random(s) => s.decide(views, rng),
        };

        debug!(
            strategy = self.name(),
            instruments = views.len(),
            intents = intents.len(),
            "Strategy decided"
        );
        intents
    }
}

/// Cancel intents for the agent's open orders older than `max_age`.
pub fn stale_cancels(
    orders: &[Order],
    now: DateTime<Utc>,
    max_age: Option<chrono::Duration>,
) -> Vec<OrderIntent> {
    let Some(max_age) = max_age else {
        return Vec::new();
    };

    orders
        .iter()
        .filter(|o| o.status.is_open() && o.age_at(now) >= max_age)
        .map(|o| OrderIntent::Cancel { order_id: o.id })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{AgentId, ExchangeId, InstrumentId, OrderId, OrderStatus, Side};
    use chrono::Duration;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    pub(crate) fn make_view(closes: Vec<f64>, held: i64, average: Cents, price: Option<Cents>) -> InstrumentView {
        let instrument = Instrument {
            id: InstrumentId(1),
            exchange_id: ExchangeId(1),
            ticker: "ACME".into(),
            name: "Acme Corp".into(),
            total_shares: 1_000_000,
        };
        InstrumentView {
            holding: Shareholding {
                agent_id: AgentId(1),
                instrument_id: instrument.id,
                shares: held,
                average_price: average,
            },
            instrument,
            closes,
            current_price: price,
            fee_percent: Decimal::ZERO,
        }
    }

    /// 15 alternating closes (RSI 50) on top of 5 much older, lower ones.
    pub(crate) fn uptrend_closes() -> Vec<f64> {
        let mut closes: Vec<f64> = (0..15)
            .map(|i| if i % 2 == 0 { 11_000.0 } else { 10_000.0 })
            .collect();
        closes.extend([5_000.0; 5]);
        closes
    }

    #[test]
    fn test_from_key() {
        assert_eq!(Strategy::from_key("momentum").name(), "momentum");
        assert_eq!(Strategy::from_key("MeanReversion").name(), "mean_reversion");
        assert_eq!(Strategy::from_key("mean_reversion").name(), "mean_reversion");
        assert_eq!(Strategy::from_key("buy_and_hold").name(), "dividend");
        assert_eq!(Strategy::from_key("random").name(), "random");
        assert_eq!(Strategy::from_key("astrology").name(), "random");
    }

    #[test]
    fn test_signal_on_uptrend() {
        let signal = StrategySignal::compute(&uptrend_closes());
        assert_eq!(signal.sma_short, Some(10_600.0));
        assert_eq!(signal.sma_long, Some(9_150.0));
        let rsi = signal.rsi.unwrap();
        assert!((rsi - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_indicator_strategies_scan_every_view() {
        let strategy = Strategy::from_key("dividend");
        let views = vec![
            make_view(vec![], 0, 0, Some(1_000)),
            make_view(vec![], 10, 900, Some(2_000)),
            make_view(vec![], 0, 0, None),
        ];
        let mut rng = StdRng::seed_from_u64(1);
        let intents = strategy.decide(&views, &mut rng);
        assert_eq!(intents.len(), 2);
        assert!(intents.iter().all(|i| i.side() == Some(Side::Buy)));
    }

    #[test]
    fn test_stale_cancels() {
        let now = Utc::now();
        let make = |age_secs: i64, status: OrderStatus| Order {
            id: OrderId::new(),
            agent_id: AgentId(1),
            instrument_id: InstrumentId(1),
            side: Side::Buy,
            price: 100,
            quantity: 1,
            quantity_filled: 0,
            status,
            created_at: now - Duration::seconds(age_secs),
            expires_at: None,
        };
        let old = make(600, OrderStatus::Active);
        let young = make(10, OrderStatus::Active);
        let old_partial = make(900, OrderStatus::PartiallyFilled);
        let orders = vec![old.clone(), young, old_partial.clone()];

        let cancels = stale_cancels(&orders, now, Some(Duration::seconds(300)));
        assert_eq!(
            cancels,
            vec![
                OrderIntent::Cancel { order_id: old.id },
                OrderIntent::Cancel {
                    order_id: old_partial.id
                },
            ]
        );
        assert!(stale_cancels(&orders, now, None).is_empty());
    }
}
