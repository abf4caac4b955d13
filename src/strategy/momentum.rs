//! Trend following on a short/long SMA crossover, filtered by RSI.

use super::indicators::RSI_OVERBOUGHT;
use super::{
    buy_price, sell_price, InstrumentView, StrategySignal, MAX_HOLDING, MIN_CANDLES, TRADE_LOT,
};
use crate::types::OrderIntent;

/// Buy while the short SMA is above the long SMA and RSI is not
/// overbought; sell when the trend flips or RSI overheats.
#[derive(Debug, Clone, Copy, Default)]
pub struct Momentum;

impl Momentum {
    pub fn decide(&self, view: &InstrumentView) -> Vec<OrderIntent> {
        let Some(price) = view.current_price else {
            return Vec::new();
        };
        if view.closes.len() < MIN_CANDLES {
            return Vec::new();
        }

        let signal = StrategySignal::compute(&view.closes);
        let (Some(short), Some(long), Some(rsi)) = (signal.sma_short, signal.sma_long, signal.rsi)
        else {
            return Vec::new();
        };

        let held = view.held();
        let id = view.instrument.id;

        if short > long && rsi < RSI_OVERBOUGHT && held < MAX_HOLDING {
            vec![OrderIntent::buy(id, buy_price(price), TRADE_LOT)]
        } else if (short < long || rsi > RSI_OVERBOUGHT) && held > 0 {
            vec![OrderIntent::sell(id, sell_price(price), held.min(TRADE_LOT))]
        } else {
            Vec::new()
        }
    }
}
