//! One agent tick: snapshot → decide → trim → execute.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::executor::{ExecutionReport, IntentExecutor};
use super::lifecycle::OrderLifecycleManager;
use crate::config::StrategyConfig;
use crate::ledger::{Ledger, LedgerResult, MarketView};
use crate::strategy::risk::RiskGuard;
use crate::strategy::{stale_cancels, InstrumentView, Strategy};
use crate::types::{AgentId, ExchangeError, ExchangeId, Shareholding};

/// Per-tick knobs taken from the `[strategy]` config section.
#[derive(Debug, Clone)]
pub struct TickConfig {
    pub history_candles: u32,
    pub order_ttl: Option<chrono::Duration>,
    pub stale_after: Option<chrono::Duration>,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            history_candles: 30,
            order_ttl: None,
            stale_after: None,
        }
    }
}

impl From<&StrategyConfig> for TickConfig {
    fn from(cfg: &StrategyConfig) -> Self {
        Self {
            history_candles: cfg.history_candles,
            order_ttl: cfg.order_ttl(),
            stale_after: cfg.stale_after(),
        }
    }
}

/// Outcome of one tick for one agent.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub agent_id: AgentId,
    pub strategy: &'static str,
    pub intents: usize,
    pub execution: ExecutionReport,
}

impl TickReport {
    pub fn placed(&self) -> usize {
        self.execution.placed.len()
    }

    pub fn trades(&self) -> usize {
        self.execution.trades.len()
    }

    pub fn cancelled(&self) -> usize {
        self.execution.cancelled.len()
    }

    pub fn races_lost(&self) -> u32 {
        self.execution.races_lost
    }

    pub fn failures(&self) -> usize {
        self.execution.failures.len()
    }
}

pub struct TickRunner {
    ledger: Arc<dyn Ledger>,
    market: Arc<dyn MarketView>,
    lifecycle: Arc<OrderLifecycleManager>,
    executor: IntentExecutor,
    config: TickConfig,
}

impl TickRunner {
    pub fn new(ledger: Arc<dyn Ledger>, market: Arc<dyn MarketView>, config: TickConfig) -> Self {
        let lifecycle = Arc::new(OrderLifecycleManager::new(ledger.clone()));
        let executor = IntentExecutor::new(lifecycle.clone(), config.order_ttl);
        Self {
            ledger,
            market,
            lifecycle,
            executor,
            config,
        }
    }

    pub fn lifecycle(&self) -> &Arc<OrderLifecycleManager> {
        &self.lifecycle
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Run one tick with a fresh OS-seeded random source.
    pub async fn run_tick(&self, agent_id: AgentId) -> LedgerResult<TickReport> {
        let mut rng = StdRng::from_os_rng();
        self.run_tick_with(agent_id, &mut rng).await
    }

    /// Run one tick with a caller-supplied random source.
    pub async fn run_tick_with<R: Rng + Send>(
        &self,
        agent_id: AgentId,
        rng: &mut R,
    ) -> LedgerResult<TickReport> {
        let agent = self
            .ledger
            .agent(agent_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound(format!("agent {}", agent_id.0)))?;
        let strategy = Strategy::from_key(&agent.strategy);

        let views = self.snapshot(agent_id).await?;
        let active = self.ledger.active_orders(agent_id).await?;

        let mut intents = stale_cancels(&active, Utc::now(), self.config.stale_after);
        let placements = strategy.decide(&views, rng);
        let proposed = placements.len();
        let placements = RiskGuard::for_agent(&agent).review(placements, &views);
        if placements.len() < proposed {
            debug!(
                agent = %agent_id,
                proposed,
                approved = placements.len(),
                "Risk limits dropped intents"
            );
        }
        intents.extend(placements);

        let execution = self.executor.execute(agent_id, &intents).await?;
        let report = TickReport {
            agent_id,
            strategy: strategy.name(),
            intents: intents.len(),
            execution,
        };

        info!(
            agent = %agent_id,
            strategy = report.strategy,
            intents = report.intents,
            placed = report.placed(),
            trades = report.trades(),
            cancelled = report.cancelled(),
            races_lost = report.races_lost(),
            failures = report.failures(),
            "Tick complete"
        );
        Ok(report)
    }

    /// Build one view per listed instrument.
    async fn snapshot(&self, agent_id: AgentId) -> LedgerResult<Vec<InstrumentView>> {
        let instruments = self.ledger.instruments().await?;
        let mut holdings: HashMap<_, Shareholding> = self
            .ledger
            .holdings(agent_id)
            .await?
            .into_iter()
            .map(|h| (h.instrument_id, h))
            .collect();

        let mut fees: HashMap<ExchangeId, Decimal> = HashMap::new();
        let mut views = Vec::with_capacity(instruments.len());
        for instrument in instruments {
            let fee_percent = match fees.get(&instrument.exchange_id) {
                Some(fee) => *fee,
                None => {
                    let exchange = self
                        .ledger
                        .exchange(instrument.exchange_id)
                        .await?
                        .ok_or_else(|| {
                            ExchangeError::NotFound(format!("exchange {}", instrument.exchange_id))
                        })?;
                    fees.insert(exchange.id, exchange.fee_percent);
                    exchange.fee_percent
                }
            };

            let closes = self
                .market
                .recent_candles(instrument.id, self.config.history_candles)
                .await?
                .iter()
                .map(|c| c.close as f64)
                .collect();
            let current_price = self.market.latest_price(instrument.id).await?;
            let holding = holdings
                .remove(&instrument.id)
                .unwrap_or_else(|| Shareholding::empty(agent_id, instrument.id));

            views.push(InstrumentView {
                instrument,
                closes,
                holding,
                current_price,
                fee_percent,
            });
        }
        Ok(views)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
