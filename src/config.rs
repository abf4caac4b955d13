//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Sections map one-to-one onto the runtime components: the ledger
//! connection, the agent scheduler, strategy housekeeping and the
//! operator API.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "TRADEFLOOR_CONFIG";

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub exchange: ExchangeConfig,
    pub ledger: LedgerConfig,
    pub scheduler: SchedulerConfig,
    pub strategy: StrategyConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeConfig {
    pub name: String,
    pub currency: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    /// SQLite connection string, e.g. `sqlite://tradefloor.db`.
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Base delay between two ticks of the same agent.
    pub tick_interval_ms: u64,
    /// Upper bound of the random spread added to every delay.
    pub jitter_ms: u64,
    /// Start every known agent when the process boots.
    #[serde(default)]
    pub autostart: bool,
    /// How often expired orders are swept.
    #[serde(default = "default_expiry_sweep_secs")]
    pub expiry_sweep_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StrategyConfig {
    /// Number of candles loaded per instrument per tick.
    pub history_candles: u32,
    /// Lifetime of a newly submitted resting order (0 = never expires).
    #[serde(default)]
    pub order_ttl_secs: u64,
    /// Own open orders older than this are cancelled (0 = keep forever).
    #[serde(default)]
    pub stale_order_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_expiry_sweep_secs() -> u64 {
    30
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }
}

/// Whole seconds as a chrono duration usable as an offset from now.
fn seconds(secs: u64) -> Option<chrono::Duration> {
    let duration = i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)?;
    chrono::Utc::now().checked_add_signed(duration)?;
    Some(duration)
}

impl StrategyConfig {
    pub fn order_ttl(&self) -> Option<chrono::Duration> {
        if self.order_ttl_secs == 0 {
            return None;
        }
        seconds(self.order_ttl_secs)
    }

    pub fn stale_after(&self) -> Option<chrono::Duration> {
        if self.stale_order_secs == 0 {
            return None;
        }
        seconds(self.stale_order_secs)
    }

    fn validate(&self) -> Result<()> {
        for (key, secs) in [
            ("order_ttl_secs", self.order_ttl_secs),
            ("stale_order_secs", self.stale_order_secs),
        ] {
            if secs > 0 && seconds(secs).is_none() {
                anyhow::bail!("strategy.{key} is out of range: {secs}");
            }
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.strategy.validate()?;
        Ok(config)
    }

    /// The config path to use: `$TRADEFLOOR_CONFIG` or `config.toml`.
    pub fn resolve_path() -> String {
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [exchange]
        name = "TEST-EX"
        currency = "USD"

        [ledger]
        database_url = "sqlite::memory:"

        [scheduler]
        tick_interval_ms = 1000
        jitter_ms = 250

        [strategy]
        history_candles = 30
        order_ttl_secs = 60

        [api]
        enabled = false
        port = 9000
    "#;

    #[test]
    fn test_parse_sample_config() {
        let cfg = AppConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.exchange.name, "TEST-EX");
        assert_eq!(cfg.ledger.max_connections, 5);
        assert_eq!(cfg.ledger.busy_timeout_ms, 5_000);
        assert_eq!(cfg.scheduler.tick_interval(), Duration::from_millis(1000));
        assert_eq!(cfg.scheduler.jitter(), Duration::from_millis(250));
        assert!(!cfg.scheduler.autostart);
        assert_eq!(cfg.scheduler.expiry_sweep_secs, 30);
        assert!(!cfg.api.enabled);
    }

    #[test]
    fn test_zero_durations_disable_housekeeping() {
        let cfg = AppConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.strategy.order_ttl(), Some(chrono::Duration::seconds(60)));
        assert_eq!(cfg.strategy.stale_after(), None);
    }

    #[test]
    fn test_out_of_range_durations_are_rejected() {
        let huge = SAMPLE.replace("order_ttl_secs = 60", &format!("order_ttl_secs = {}", i64::MAX));
        let err = AppConfig::parse(&huge).unwrap_err();
        assert!(err.to_string().contains("order_ttl_secs"), "got {err}");

        let huge = SAMPLE.replace(
            "order_ttl_secs = 60",
            // Representable, but lands past the last supported date.
            "order_ttl_secs = 60\nstale_order_secs = 1000000000000000",
        );
        let err = AppConfig::parse(&huge).unwrap_err();
        assert!(err.to_string().contains("stale_order_secs"), "got {err}");
    }

    #[test]
    fn test_missing_section_is_an_error() {
        let result = AppConfig::parse("[exchange]\nname = \"x\"\ncurrency = \"USD\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config() {
        // Only meaningful when run from the crate root.
        if let Ok(cfg) = AppConfig::load("config.toml") {
            assert!(cfg.scheduler.tick_interval_ms > 0);
            assert!(cfg.strategy.history_candles >= 20);
        }
    }
}
