//! Noise trader: one random order per tick.

use rand::Rng;

use super::{buy_price, sell_price, InstrumentView};
use crate::types::OrderIntent;

#[derive(Debug, Clone)]
pub struct RandomTrader {
    pub min_quantity: i64,
    pub max_quantity: i64,
}

impl Default for RandomTrader {
    fn default() -> Self {
        Self {
            min_quantity: 1,
            max_quantity: 10,
        }
    }
}

impl RandomTrader {
    /// Pick one priced instrument and buy or sell a random lot of it.
    ///
    /// A sell is capped at the held quantity; with nothing held the trader
    /// buys instead.
    pub fn decide<R: Rng>(&self, views: &[InstrumentView], rng: &mut R) -> Vec<OrderIntent> {
        let priced: Vec<(&InstrumentView, i64)> = views
            .iter()
            .filter_map(|v| v.current_price.map(|p| (v, p)))
            .collect();
        if priced.is_empty() {
            return Vec::new();
        }

        let (view, price) = priced[rng.random_range(0..priced.len())];
        let quantity = rng.random_range(self.min_quantity..=self.max_quantity);
        let id = view.instrument.id;
        let held = view.held();

        if rng.random_bool(0.5) && held > 0 {
            vec![OrderIntent::sell(id, sell_price(price), quantity.min(held))]
        } else {
            vec![OrderIntent::buy(id, buy_price(price), quantity)]
        }
    }
}
