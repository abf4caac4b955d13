//! Contrarian trading on RSI extremes.

use super::indicators::{relative_strength_index, RSI_OVERBOUGHT, RSI_OVERSOLD, RSI_PERIOD};
use super::{buy_price, sell_price, InstrumentView, MAX_HOLDING, MIN_CANDLES, TRADE_LOT};
use crate::types::OrderIntent;

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanReversion;

impl MeanReversion {
    pub fn decide(&self, view: &InstrumentView) -> Vec<OrderIntent> {
        let Some(price) = view.current_price else {
            return Vec::new();
        };
        if view.closes.len() < MIN_CANDLES {
            return Vec::new();
        }
        let Some(rsi) = relative_strength_index(&view.closes, RSI_PERIOD) else {
            return Vec::new();
        };

        let held = view.held();
        let id = view.instrument.id;

        if rsi < RSI_OVERSOLD && held < MAX_HOLDING {
            vec![OrderIntent::buy(id, buy_price(price), TRADE_LOT)]
        } else if rsi > RSI_OVERBOUGHT && held > 0 {
            vec![OrderIntent::sell(id, sell_price(price), held.min(TRADE_LOT))]
        } else {
            Vec::new()
        }
    }
}
