//! TRADEFLOOR: Miniature Exchange with Autonomous Trading Agents
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the ledger, starts one schedule per agent and sweeps expired
//! orders until Ctrl+C.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use tradefloor::api::{self, ApiState};
use tradefloor::config::AppConfig;
use tradefloor::engine::{AgentScheduler, TickConfig, TickRunner};
use tradefloor::ledger::{Ledger, SqliteLedger};

const BANNER: &str = r#"
 _____ ____      _    ____  _____ _____ _     ___   ___  ____
|_   _|  _ \    / \  |  _ \| ____|  ___| |   / _ \ / _ \|  _ \
  | | | |_) |  / _ \ | | | |  _| | |_  | |  | | | | | | | |_) |
  | | |  _ <  / ___ \| |_| | |___|  _| | |__| |_| | |_| |  _ <
  |_| |_| \_\/_/   \_\____/|_____|_|   |_____\___/ \___/|_| \_\

  Miniature exchange, autonomous agents
  v0.1.0
"#;

/// Environment variable that switches logging to JSON lines.
const LOG_JSON_ENV: &str = "TRADEFLOOR_LOG_JSON";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = AppConfig::resolve_path();
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        exchange = %cfg.exchange.name,
        currency = %cfg.exchange.currency,
        config = %config_path,
        "TRADEFLOOR starting up"
    );

    // -- Ledger ------------------------------------------------------------

    let ledger = Arc::new(
        SqliteLedger::connect(
            &cfg.ledger.database_url,
            cfg.ledger.max_connections,
            Duration::from_millis(cfg.ledger.busy_timeout_ms),
        )
        .await
        .with_context(|| format!("Failed to open ledger at {}", cfg.ledger.database_url))?,
    );

    // -- Engine ------------------------------------------------------------

    let runner = Arc::new(TickRunner::new(
        ledger.clone(),
        ledger.clone(),
        TickConfig::from(&cfg.strategy),
    ));
    let scheduler = Arc::new(AgentScheduler::new(runner.clone(), cfg.scheduler.jitter()));

    if cfg.scheduler.autostart {
        let agents = ledger.agents().await.context("Failed to list agents")?;
        if agents.is_empty() {
            warn!("No agents in the ledger; nothing to schedule");
        }
        for agent in &agents {
            scheduler.start(agent.id, cfg.scheduler.tick_interval()).await;
        }
        info!(agents = agents.len(), "Agents scheduled");
    }

    // -- Operator API ------------------------------------------------------

    if cfg.api.enabled {
        let state = Arc::new(ApiState {
            scheduler: scheduler.clone(),
            ledger: ledger.clone(),
            market: ledger.clone(),
            default_interval: cfg.scheduler.tick_interval(),
        });
        api::spawn_api(state, cfg.api.port).await?;
    }

    // -- Main loop: expiry sweep until Ctrl+C ------------------------------

    let mut sweep = tokio::time::interval(Duration::from_secs(cfg.scheduler.expiry_sweep_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        sweep_secs = cfg.scheduler.expiry_sweep_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                match runner.lifecycle().expire_due(Utc::now()).await {
                    Ok(0) => {}
                    Ok(expired) => info!(expired, "Expiry sweep complete"),
                    Err(e) => error!(error = %e, "Expiry sweep failed, continuing"),
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    scheduler.stop_all().await;
    info!("TRADEFLOOR shut down cleanly.");

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tradefloor=info"));

    if std::env::var(LOG_JSON_ENV).is_ok() {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
