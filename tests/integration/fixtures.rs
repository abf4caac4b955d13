//! Shared market fixtures.
//!
//! A `TestMarket` is one exchange (0.15 % fee) with a single instrument,
//! a seller holding shares and a cash-rich buyer.

use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use tradefloor::engine::{AgentScheduler, OrderLifecycleManager, TickConfig, TickRunner};
use tradefloor::ledger::sqlite::NewAgent;
use tradefloor::ledger::SqliteLedger;
use tradefloor::types::{AgentId, Exchange, InstrumentId};

pub const SELLER_SHARES: i64 = 100;
pub const SELLER_AVERAGE: i64 = 150;
pub const STARTING_CASH: i64 = 100_000;

/// Removes the database file (and its WAL siblings) on drop.
pub struct TempDb {
    path: PathBuf,
}

impl TempDb {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!("tradefloor-test-{}.db", Uuid::new_v4()));
        Self { path }
    }

    fn url(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}

pub struct TestMarket {
    pub ledger: Arc<SqliteLedger>,
    pub lifecycle: OrderLifecycleManager,
    pub exchange: Exchange,
    pub instrument: InstrumentId,
    pub seller: AgentId,
    pub buyer: AgentId,
    _db: TempDb,
}

impl TestMarket {
    pub async fn new() -> Self {
        let db = TempDb::new();
        let ledger = Arc::new(
            SqliteLedger::connect(&db.url(), 4, Duration::from_secs(5))
                .await
                .expect("ledger should open"),
        );

        let exchange = ledger.create_exchange("TEST", dec!(0.15)).await.unwrap();
        let instrument = ledger
            .create_instrument(exchange.id, "ACME", "Acme Corp", 10_000)
            .await
            .unwrap();
        let seller = ledger
            .create_agent(NewAgent::new("seller", "dividend", STARTING_CASH))
            .await
            .unwrap();
        let buyer = ledger
            .create_agent(NewAgent::new("buyer", "momentum", STARTING_CASH))
            .await
            .unwrap();
        ledger
            .set_holding(seller.id, instrument.id, SELLER_SHARES, SELLER_AVERAGE)
            .await
            .unwrap();

        Self {
            lifecycle: OrderLifecycleManager::new(ledger.clone()),
            ledger,
            exchange,
            instrument: instrument.id,
            seller: seller.id,
            buyer: buyer.id,
            _db: db,
        }
    }

    /// Add another agent with `cash` and no holdings.
    pub async fn add_agent(&self, name: &str, cash: i64) -> AgentId {
        self.ledger
            .create_agent(NewAgent::new(name, "random", cash))
            .await
            .unwrap()
            .id
    }

    pub fn scheduler(&self, jitter: Duration) -> Arc<AgentScheduler> {
        let runner = Arc::new(TickRunner::new(
            self.ledger.clone(),
            self.ledger.clone(),
            TickConfig::default(),
        ));
        Arc::new(AgentScheduler::new(runner, jitter))
    }
}
