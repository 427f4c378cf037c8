use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{error, info};
use url::Url;
use vex_backtest::{BacktestError, HttpStrategyClient, Orchestrator, OrchestratorConfig, RunStatus};
use vex_data::{CsvCandleStore, DataError};
use vex_engine::{SlippageModel, SnapshotStore, SqliteSnapshotStore};
use vex_server::{router, ServerConfig, ServerState};

mod settings;
mod telemetry;

use settings::AppConfig;

const EXIT_BAD_INPUT: u8 = 2;
const EXIT_DATA_GAP: u8 = 3;
const EXIT_STRATEGY_UNREACHABLE: u8 = 4;
const EXIT_ENGINE_FAULT: u8 = 5;

#[derive(Parser)]
#[command(author, version, about = "Virtual exchange and backtest orchestrator")]
struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },
    /// Run one orchestrated backtest and print the report as JSON
    Orchestrate(OrchestrateArgs),
}

#[derive(Args)]
struct OrchestrateArgs {
    /// Market symbol, e.g. BTCUSDT
    #[arg(long)]
    symbol: String,
    /// Range start, ISO-8601 UTC or YYYY-MM-DD
    #[arg(long)]
    start: String,
    /// Range end, ISO-8601 UTC or YYYY-MM-DD
    #[arg(long)]
    end: String,
    /// Decision interval in hours (defaults from configuration)
    #[arg(long)]
    interval_hours: Option<i64>,
    /// External strategy service endpoint
    #[arg(long)]
    strategy_url: Option<Url>,
    #[arg(long)]
    fee_rate: Option<Decimal>,
    #[arg(long)]
    initial_balance: Option<Decimal>,
    /// Market fill model
    #[arg(long, value_parser = parse_slippage)]
    fill_model: Option<SlippageModel>,
    /// Candle data store root (defaults from configuration)
    #[arg(long)]
    data: Option<PathBuf>,
}

fn parse_slippage(raw: &str) -> Result<SlippageModel, String> {
    match raw.to_lowercase().as_str() {
        "open" | "fill_at_open" => Ok(SlippageModel::FillAtOpen),
        "close" | "fill_at_close" => Ok(SlippageModel::FillAtClose),
        other => Err(format!("unsupported fill model '{other}' (use open|close)")),
    }
}

fn parse_utc(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("'{raw}' is neither ISO-8601 nor YYYY-MM-DD"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .context("invalid midnight timestamp")?;
    Ok(DateTime::from_naive_utc_and_offset(midnight, Utc))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match settings::load_config(&cli.env) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(EXIT_BAD_INPUT);
        }
    };
    let filter = match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    if let Err(err) = telemetry::init_tracing(&filter, config.log_file.as_deref()) {
        eprintln!("failed to install tracing subscriber: {err:#}");
    }

    match cli.command {
        Commands::Serve { bind } => serve(bind, &config).await,
        Commands::Orchestrate(args) => orchestrate(args, &config).await,
    }
}

async fn serve(bind: SocketAddr, config: &AppConfig) -> ExitCode {
    let server_config = ServerConfig {
        coins: config.exchange.coins.clone(),
        quote: config.exchange.quote.clone(),
        initial_balance: config.exchange.initial_balance,
        fee_rate: config.exchange.fee_rate,
        slippage: SlippageModel::default(),
        session_window: None,
        strategy_timeout: StdDuration::from_secs(config.backtest.strategy_timeout_secs),
    };
    let candles = Arc::new(CsvCandleStore::new(config.data_path.join("candles")));
    let snapshots = config
        .snapshot_db
        .as_ref()
        .map(|path| Arc::new(SqliteSnapshotStore::new(path)) as Arc<dyn SnapshotStore>);
    let state = match ServerState::new(server_config, candles, None, snapshots).await {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!(%err, "failed to build server state");
            return ExitCode::from(EXIT_BAD_INPUT);
        }
    };
    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, %bind, "failed to bind listener");
            return ExitCode::from(EXIT_BAD_INPUT);
        }
    };
    info!(%bind, "serving virtual exchange API");
    if let Err(err) = axum::serve(listener, router(state)).await {
        error!(%err, "server terminated abnormally");
        return ExitCode::from(EXIT_ENGINE_FAULT);
    }
    ExitCode::SUCCESS
}

async fn orchestrate(args: OrchestrateArgs, config: &AppConfig) -> ExitCode {
    let (start, end) = match (parse_utc(&args.start), parse_utc(&args.end)) {
        (Ok(start), Ok(end)) => (start, end),
        (Err(err), _) | (_, Err(err)) => {
            eprintln!("invalid time bound: {err:#}");
            return ExitCode::from(EXIT_BAD_INPUT);
        }
    };
    let mut run_config = OrchestratorConfig::new(args.symbol.to_uppercase(), start, end);
    run_config.decision_interval =
        chrono::Duration::hours(args.interval_hours.unwrap_or(config.backtest.decision_interval_hours));
    run_config.fee_rate = args.fee_rate.unwrap_or(config.backtest.fee_rate);
    run_config.initial_balance = args
        .initial_balance
        .unwrap_or(config.backtest.initial_balance);
    if let Some(model) = args.fill_model {
        run_config.slippage = model;
    }

    let mut orchestrator = Orchestrator::new(run_config);
    if let Some(url) = args.strategy_url {
        let timeout = StdDuration::from_secs(config.backtest.strategy_timeout_secs);
        match HttpStrategyClient::new(url, timeout) {
            Ok(client) => orchestrator = orchestrator.with_strategy(Arc::new(client)),
            Err(err) => {
                eprintln!("strategy service unreachable: {err}");
                return ExitCode::from(EXIT_STRATEGY_UNREACHABLE);
            }
        }
    }
    if let Some(path) = &config.snapshot_db {
        orchestrator =
            orchestrator.with_snapshots(Arc::new(SqliteSnapshotStore::new(path)) as Arc<dyn SnapshotStore>);
    }

    let data_root = args.data.unwrap_or_else(|| config.data_path.join("candles"));
    let candles = CsvCandleStore::new(data_root);
    let report = match orchestrator.run(&candles, None).await {
        Ok(report) => report,
        Err(err) => {
            eprintln!("run failed: {err}");
            return ExitCode::from(exit_code_for(&err));
        }
    };
    match serde_json::to_string_pretty(&report) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => {
            eprintln!("failed to render report: {err}");
            return ExitCode::from(EXIT_ENGINE_FAULT);
        }
    }
    if report.status == RunStatus::Failed {
        eprintln!(
            "run flagged as failed: {}",
            report.failure_reason.as_deref().unwrap_or("unknown fault")
        );
        return ExitCode::from(EXIT_ENGINE_FAULT);
    }
    ExitCode::SUCCESS
}

fn exit_code_for(err: &BacktestError) -> u8 {
    match err {
        BacktestError::Data(DataError::DataGap { .. }) => EXIT_DATA_GAP,
        BacktestError::Data(_) | BacktestError::InvalidConfig(_) => EXIT_BAD_INPUT,
        BacktestError::StrategyUnavailable(_) | BacktestError::StrategyTimeout(_) => {
            EXIT_STRATEGY_UNREACHABLE
        }
        BacktestError::ClockRegression { .. } | BacktestError::Engine(_) => EXIT_ENGINE_FAULT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_utc_accepts_both_forms() {
        assert!(parse_utc("2024-01-01T00:00:00Z").is_ok());
        assert!(parse_utc("2024-01-01").is_ok());
        assert!(parse_utc("yesterday").is_err());
        assert_eq!(
            parse_utc("2024-01-01").unwrap(),
            parse_utc("2024-01-01T00:00:00Z").unwrap()
        );
    }

    #[test]
    fn exit_codes_follow_the_contract() {
        let gap = BacktestError::Data(DataError::DataGap {
            symbol: "BTCUSDT".to_string(),
            missing_at: Utc::now(),
        });
        assert_eq!(exit_code_for(&gap), EXIT_DATA_GAP);
        let bad = BacktestError::InvalidConfig("start after end".to_string());
        assert_eq!(exit_code_for(&bad), EXIT_BAD_INPUT);
        let strategy = BacktestError::StrategyUnavailable("503".to_string());
        assert_eq!(exit_code_for(&strategy), EXIT_STRATEGY_UNREACHABLE);
    }
}
