//! Agent scheduler: one independently timed task per agent.
//!
//! Each running agent owns a tokio task that sleeps `interval + jitter`
//! and then runs one tick. Stopping an agent cancels its timer; a tick that
//! is already running is allowed to finish.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::tick::{TickReport, TickRunner};
use crate::ledger::LedgerResult;
use crate::types::AgentId;

struct AgentTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct AgentScheduler {
    runner: Arc<TickRunner>,
    jitter: Duration,
    tasks: Mutex<HashMap<AgentId, AgentTask>>,
}

impl AgentScheduler {
    pub fn new(runner: Arc<TickRunner>, jitter: Duration) -> Self {
        Self {
            runner,
            jitter,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn runner(&self) -> &Arc<TickRunner> {
        &self.runner
    }

    /// Start ticking `agent_id`. Returns `false` if it was already running.
    pub async fn start(&self, agent_id: AgentId, tick_interval: Duration) -> bool {
        let mut tasks = self.tasks.lock().await;

        if let Some(task) = tasks.get(&agent_id) {
            if !task.handle.is_finished() {
                debug!(agent = %agent_id, "Agent already running");
                return false;
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(agent_loop(
            self.runner.clone(),
            agent_id,
            tick_interval,
            self.jitter,
            cancel.clone(),
        ));
        tasks.insert(agent_id, AgentTask { cancel, handle });

        info!(
            agent = %agent_id,
            interval_ms = tick_interval.as_millis() as u64,
            jitter_ms = self.jitter.as_millis() as u64,
            "Agent started"
        );
        true
    }

    /// Stop ticking `agent_id`. Returns `false` if it was not running.
    ///
    /// Open orders are left alone.
    pub async fn stop(&self, agent_id: AgentId) -> bool {
        let removed = self.tasks.lock().await.remove(&agent_id);
        match removed {
            Some(task) => {
                task.cancel.cancel();
                info!(agent = %agent_id, "Agent stopped");
                !task.handle.is_finished()
            }
            None => false,
        }
    }

    pub async fn is_running(&self, agent_id: AgentId) -> bool {
        self.tasks
            .lock()
            .await
            .get(&agent_id)
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Running agents, ordered by id.
    pub async fn running_agents(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .tasks
            .lock()
            .await
            .iter()
            .filter(|(_, t)| !t.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Stop every agent and wait for in-flight ticks to finish.
    pub async fn stop_all(&self) {
        let drained: Vec<(AgentId, AgentTask)> = self.tasks.lock().await.drain().collect();
        for (_, task) in &drained {
            task.cancel.cancel();
        }

        let count = drained.len();
        let handles = drained.into_iter().map(|(id, task)| async move {
            if let Err(e) = task.handle.await {
                warn!(agent = %id, error = %e, "Agent task ended abnormally");
            }
        });
        futures::future::join_all(handles).await;

        info!(agents = count, "All agents stopped");
    }

    /// Run one tick for `agent_id` right now, outside its timer.
    pub async fn tick_now(&self, agent_id: AgentId) -> LedgerResult<TickReport> {
        self.runner.run_tick(agent_id).await
    }
}

/// Uniform delay in `0..=jitter`.
fn jitter_delay(jitter: Duration) -> Duration {
    let max = jitter.as_millis() as u64;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max))
}

async fn agent_loop(
    runner: Arc<TickRunner>,
    agent_id: AgentId,
    interval: Duration,
    jitter: Duration,
    cancel: CancellationToken,
) {
    loop {
        let delay = interval + jitter_delay(jitter);
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(agent = %agent_id, "Agent loop cancelled");
                break;
            }
            () = tokio::time::sleep(delay) => {}
        }

        // Outside the select: a started tick always runs to completion.
        match runner.run_tick(agent_id).await {
            Ok(report) => {
                debug!(agent = %agent_id, trades = report.trades(), "Tick finished");
            }
            Err(e) => {
                error!(agent = %agent_id, error = %e, kind = e.kind(), "Tick failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tick::TickConfig;
    use crate::ledger::sqlite::{NewAgent, SqliteLedger};
    use crate::ledger::{Ledger, MockLedger, MockMarketView};
    use crate::types::ExchangeError;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn scheduler() -> (AgentScheduler, Arc<SqliteLedger>) {
        let ledger = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let runner = Arc::new(TickRunner::new(
            ledger.clone(),
            ledger.clone(),
            TickConfig::default(),
        ));
        (AgentScheduler::new(runner, Duration::from_millis(5)), ledger)
    }

    #[test]
    fn test_jitter_delay_bounds() {
        assert_eq!(jitter_delay(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(jitter_delay(Duration::from_millis(20)) <= Duration::from_millis(20));
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (scheduler, _) = scheduler().await;
        assert!(scheduler.start(AgentId(1), Duration::from_secs(60)).await);
        assert!(!scheduler.start(AgentId(1), Duration::from_secs(60)).await);
        assert_eq!(scheduler.running_agents().await, vec![AgentId(1)]);
        scheduler.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_and_restart() {
        let (scheduler, _) = scheduler().await;
        scheduler.start(AgentId(1), Duration::from_secs(60)).await;
        scheduler.start(AgentId(2), Duration::from_secs(60)).await;

        assert!(scheduler.stop(AgentId(1)).await);
        assert!(!scheduler.stop(AgentId(1)).await);
        assert!(!scheduler.is_running(AgentId(1)).await);
        assert!(scheduler.is_running(AgentId(2)).await);

        assert!(scheduler.start(AgentId(1), Duration::from_secs(60)).await);
        assert_eq!(scheduler.running_agents().await, vec![AgentId(1), AgentId(2)]);

        scheduler.stop_all().await;
        assert!(scheduler.running_agents().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_failures_do_not_stop_the_task() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut ledger = MockLedger::new();
        ledger.expect_agent().returning(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(ExchangeError::Ledger("database is locked".into()))
        });
        let runner = Arc::new(TickRunner::new(
            Arc::new(ledger),
            Arc::new(MockMarketView::new()),
            TickConfig::default(),
        ));
        let scheduler = AgentScheduler::new(runner, Duration::ZERO);

        scheduler.start(AgentId(7), Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(55)).await;

        assert!(scheduler.is_running(AgentId(7)).await);
        assert!(calls.load(Ordering::SeqCst) >= 3);
        scheduler.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_agent_does_not_stop_the_task() {
        let mut ledger = MockLedger::new();
        ledger.expect_agent().returning(|_| Ok(None));
        let runner = Arc::new(TickRunner::new(
            Arc::new(ledger),
            Arc::new(MockMarketView::new()),
            TickConfig::default(),
        ));
        let scheduler = AgentScheduler::new(runner, Duration::ZERO);

        scheduler.start(AgentId(99), Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(scheduler.is_running(AgentId(99)).await);
        scheduler.stop_all().await;
    }

    #[tokio::test]
    async fn test_running_agent_trades_on_its_own() {
        let (scheduler, ledger) = scheduler().await;
        let exchange = ledger.create_exchange("TEST", dec!(0.15)).await.unwrap();
        let instrument = ledger
            .create_instrument(exchange.id, "ACME", "Acme", 10_000)
            .await
            .unwrap();
        ledger
            .append_candle(&crate::types::Candle {
                instrument_id: instrument.id,
                period: "1m".into(),
                open: 500,
                high: 500,
                low: 500,
                close: 500,
                volume: 1,
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let agent = ledger
            .create_agent(NewAgent::new("bot", "random", 1_000_000))
            .await
            .unwrap();

        scheduler.start(agent.id, Duration::from_millis(5)).await;
        let mut orders = Vec::new();
        for _ in 0..200 {
            orders = ledger.active_orders(agent.id).await.unwrap();
            if !orders.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.stop_all().await;
        assert!(!orders.is_empty());
    }

    #[tokio::test]
    async fn test_tick_now_runs_inline() {
        let (scheduler, _) = scheduler().await;
        let err = scheduler.tick_now(AgentId(5)).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
