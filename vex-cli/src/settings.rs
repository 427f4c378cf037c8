//! Layered configuration loading: `config/default.toml`, then
//! `config/{env}.toml`, then `VEX_*` environment overrides.

use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub snapshot_db: Option<PathBuf>,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub backtest: BacktestDefaults,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_coins")]
    pub coins: Vec<String>,
    #[serde(default = "default_quote")]
    pub quote: String,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    #[serde(default)]
    pub fee_rate: Decimal,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            coins: default_coins(),
            quote: default_quote(),
            initial_balance: default_initial_balance(),
            fee_rate: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BacktestDefaults {
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    #[serde(default)]
    pub fee_rate: Decimal,
    #[serde(default = "default_interval_hours")]
    pub decision_interval_hours: i64,
    #[serde(default = "default_strategy_timeout_secs")]
    pub strategy_timeout_secs: u64,
}

impl Default for BacktestDefaults {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            fee_rate: Decimal::ZERO,
            decision_interval_hours: default_interval_hours(),
            strategy_timeout_secs: default_strategy_timeout_secs(),
        }
    }
}

fn default_data_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_coins() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string()]
}

fn default_quote() -> String {
    "USDT".to_string()
}

fn default_initial_balance() -> Decimal {
    Decimal::from(10_000)
}

fn default_interval_hours() -> i64 {
    4
}

fn default_strategy_timeout_secs() -> u64 {
    120
}

/// Load the layered configuration for the selected environment.
pub fn load_config(env: &str) -> Result<AppConfig> {
    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{env}")).required(false))
        .add_source(Environment::with_prefix("VEX").separator("__"))
        .build()
        .context("failed to assemble configuration sources")?
        .try_deserialize()
        .context("failed to deserialize configuration")
}
