//! Accumulate a core position, trim it once it is well in profit.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::{buy_price, sell_price, InstrumentView, TRADE_LOT};
use crate::types::OrderIntent;

/// Buy until this many shares are held.
pub const TARGET_HOLDING: i64 = 50;

/// Take profit once price exceeds the average cost by this factor.
pub const PROFIT_TRIGGER: Decimal = dec!(1.2);

/// Share of the position sold when taking profit.
pub const TRIM_FRACTION: Decimal = dec!(0.2);

#[derive(Debug, Clone, Copy, Default)]
pub struct Dividend;

impl Dividend {
    pub fn decide(&self, view: &InstrumentView) -> Vec<OrderIntent> {
        let Some(price) = view.current_price else {
            return Vec::new();
        };

        let held = view.held();
        let id = view.instrument.id;

        if held < TARGET_HOLDING {
            return vec![OrderIntent::buy(id, buy_price(price), TRADE_LOT)];
        }

        let trigger = Decimal::from(view.holding.average_price) * PROFIT_TRIGGER;
        if Decimal::from(price) <= trigger {
            return Vec::new();
        }

        let quantity = trim_quantity(held);
        if quantity == 0 {
            return Vec::new();
        }
        vec![OrderIntent::sell(id, sell_price(price), quantity)]
    }
}

fn trim_quantity(held: i64) -> i64 {
    i64::try_from((Decimal::from(held) * TRIM_FRACTION).floor()).unwrap_or(0)
}
