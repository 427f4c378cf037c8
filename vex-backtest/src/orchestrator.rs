//! The outer loop driving an entire run.
//!
//! Advances the virtual clock in fixed decision intervals, consults the
//! external strategy between steps, feeds extracted orders to the engine
//! and lets it chew through candles up to the next decision tick. Because
//! matching snapshots the open-order set at the start of each bar and
//! orders placed at `T` attach to the first bar strictly after `T`, the
//! result is independent of how long the strategy call took in wall time.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;
use vex_core::{CoinMap, OrderRequest, OrderType, Side, Symbol};
use vex_data::{verify_coverage, CandleSource, NewsSource};
use vex_engine::{
    EngineConfig, MatchingEngine, SlippageModel, SnapshotStore, StepFragment, Wallet,
};

use crate::report::{Diagnostic, EquityPoint, PortfolioMetrics, Report, Reproducibility, RunStatus, TradePairer};
use crate::runner::BacktestRunner;
use crate::strategy::{PlaceOrderArgs, StrategyAction, StrategyService};
use crate::{BacktestError, BacktestResult};

/// Inputs of one orchestrated run.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub symbol: Symbol,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub decision_interval: Duration,
    pub fee_rate: Decimal,
    pub slippage: SlippageModel,
    pub initial_balance: Decimal,
    /// Opaque engine revision recorded in the reproducibility block.
    pub engine_version: String,
    pub coin_map: CoinMap,
}

impl OrchestratorConfig {
    /// Conventional defaults: 4-hour decisions, zero fees, 10k starting
    /// balance, `coin -> coinUSDT` mapping.
    pub fn new(symbol: impl Into<Symbol>, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        let symbol: Symbol = symbol.into();
        let base = symbol.strip_suffix("USDT").unwrap_or(&symbol).to_string();
        Self {
            symbol: symbol.clone(),
            start_time,
            end_time,
            decision_interval: Duration::hours(4),
            fee_rate: Decimal::ZERO,
            slippage: SlippageModel::default(),
            initial_balance: Decimal::from(10_000),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            coin_map: CoinMap::with_quote([base], "USDT"),
        }
    }

    fn validate(&self) -> BacktestResult<()> {
        if self.start_time >= self.end_time {
            return Err(BacktestError::InvalidConfig(format!(
                "start {} is not before end {}",
                self.start_time, self.end_time
            )));
        }
        if self.decision_interval <= Duration::zero() {
            return Err(BacktestError::InvalidConfig(
                "decision interval must be positive".to_string(),
            ));
        }
        if self.initial_balance <= Decimal::ZERO {
            return Err(BacktestError::InvalidConfig(
                "initial balance must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct ConfigEcho<'a> {
    symbol: &'a str,
    start_time: i64,
    end_time: i64,
    decision_interval_secs: i64,
    fee_rate: Decimal,
    slippage_model: &'static str,
    initial_balance: Decimal,
    strategy: bool,
}

/// Drives one isolated `{runner, engine, wallet}` bundle from start to end.
pub struct Orchestrator {
    config: OrchestratorConfig,
    strategy: Option<Arc<dyn StrategyService>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    run_id: String,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            strategy: None,
            snapshots: None,
            run_id: Uuid::new_v4().to_string(),
        }
    }

    /// Attach the external strategy collaborator.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn StrategyService>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Persist wallet snapshots under this run's id.
    #[must_use]
    pub fn with_snapshots(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Execute a full orchestrated run.
    ///
    /// Pre-flight failures (`DataGap`, bad configuration) are returned as
    /// errors before any order is accepted; mid-run fatal faults finalise
    /// whatever partial report exists and flag the run as failed.
    pub async fn run(
        &self,
        candles: &dyn CandleSource,
        news: Option<&dyn NewsSource>,
    ) -> BacktestResult<Report> {
        let mut runner = self.prepare(candles, news).await?;
        info!(
            run_id = %self.run_id,
            symbol = %self.config.symbol,
            start = %self.config.start_time,
            end = %self.config.end_time,
            "starting orchestrated backtest"
        );

        let mut equity_curve = vec![EquityPoint {
            timestamp: self.config.start_time,
            equity: self.config.initial_balance,
        }];
        let mut diagnostics = Vec::new();
        let mut failure: Option<String> = None;

        let mut t = self.config.start_time;
        while t < self.config.end_time {
            if let Err(err) = self.step(&mut runner, t, &mut diagnostics).await {
                error!(run_id = %self.run_id, %err, "fatal engine fault, finalising partial report");
                failure = Some(err.to_string());
                break;
            }
            let t_next = std::cmp::min(t + self.config.decision_interval, self.config.end_time);
            let step_fills = match runner.advance_to(t_next) {
                Ok(trades) => {
                    if !trades.is_empty() {
                        info!(run_id = %self.run_id, fills = trades.len(), step = %t_next, "step filled orders");
                    }
                    trades.len() as u64
                }
                Err(err) => {
                    error!(run_id = %self.run_id, %err, "fatal engine fault, finalising partial report");
                    failure = Some(err.to_string());
                    break;
                }
            };
            equity_curve.push(EquityPoint {
                timestamp: t_next,
                equity: runner.equity(),
            });
            if let Some(store) = &self.snapshots {
                let fragment = StepFragment {
                    timestamp: t_next.timestamp(),
                    equity: runner.equity(),
                    fills: step_fills,
                };
                if let Err(err) = store.append_fragment(&self.run_id, &fragment) {
                    error!(run_id = %self.run_id, %err, "failed to persist step fragment");
                    failure = Some(err.to_string());
                    break;
                }
            }
            t = t_next;
        }

        Ok(self.finalise(runner, equity_curve, diagnostics, failure))
    }

    /// Lower-level entry: match a pre-built order list over the range,
    /// without any strategy involvement.
    pub async fn run_prebuilt(
        &self,
        orders: Vec<OrderRequest>,
        candles: &dyn CandleSource,
    ) -> BacktestResult<Report> {
        let mut runner = self.prepare(candles, None).await?;
        let mut diagnostics = Vec::new();
        let mut failure = None;
        runner.set_current_time(self.config.start_time)?;
        runner.prime_mark(&self.config.symbol);
        for request in orders {
            if let Err(err) = runner.place(request.clone()) {
                warn!(%err, "pre-built order rejected");
                diagnostics.push(Diagnostic {
                    timestamp: self.config.start_time,
                    context: intended_order(&request),
                    detail: err.to_string(),
                });
            }
        }
        let mut equity_curve = vec![EquityPoint {
            timestamp: self.config.start_time,
            equity: self.config.initial_balance,
        }];
        match runner.advance_to(self.config.end_time) {
            Ok(_) => {}
            Err(err) => failure = Some(err.to_string()),
        }
        equity_curve.push(EquityPoint {
            timestamp: self.config.end_time,
            equity: runner.equity(),
        });
        Ok(self.finalise(runner, equity_curve, diagnostics, failure))
    }

    async fn prepare(
        &self,
        candles: &dyn CandleSource,
        news: Option<&dyn NewsSource>,
    ) -> BacktestResult<BacktestRunner> {
        self.config.validate()?;
        let window = candles
            .candles(&self.config.symbol, self.config.start_time, self.config.end_time)
            .await?;
        verify_coverage(
            &window,
            &self.config.symbol,
            self.config.start_time,
            self.config.end_time,
        )?;
        let news_items = match news {
            Some(source) => source.published_before(self.config.end_time).await?,
            None => Vec::new(),
        };

        let mut symbols: std::collections::BTreeSet<Symbol> =
            self.config.coin_map.symbols().cloned().collect();
        symbols.insert(self.config.symbol.clone());
        let engine_config = EngineConfig {
            fee_rate: self.config.fee_rate,
            slippage: self.config.slippage,
            symbols,
        };
        let wallet = Wallet::new(self.config.initial_balance);
        let mut engine = MatchingEngine::new(engine_config, wallet);
        if let Some(store) = &self.snapshots {
            engine = engine.with_persistence(self.run_id.clone(), Arc::clone(store));
        }
        engine.load_candles(window.clone())?;

        let mut runner = BacktestRunner::new(engine, self.config.start_time);
        runner.load_window(window, news_items);
        Ok(runner)
    }

    /// One decision step: set the clock, prime the mark, consult the
    /// strategy, feed extracted orders to the engine. Strategy failures are
    /// soft; engine faults propagate as fatal.
    async fn step(
        &self,
        runner: &mut BacktestRunner,
        t: DateTime<Utc>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> BacktestResult<()> {
        runner.set_current_time(t)?;
        runner.prime_mark(&self.config.symbol);

        let Some(strategy) = &self.strategy else {
            return Ok(());
        };
        let reply = match strategy.decide(&self.config.symbol, t).await {
            Ok(reply) => reply,
            Err(err @ (BacktestError::StrategyUnavailable(_) | BacktestError::StrategyTimeout(_))) => {
                warn!(run_id = %self.run_id, step = %t, %err, "strategy step failed, continuing with zero orders");
                diagnostics.push(Diagnostic {
                    timestamp: t,
                    context: "strategy call".to_string(),
                    detail: err.to_string(),
                });
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        for action in reply.actions() {
            match action {
                StrategyAction::Place(args) => self.apply_place(runner, t, args, diagnostics),
                StrategyAction::Cancel(args) => {
                    if let Err(err) = runner.cancel(args.oid) {
                        warn!(run_id = %self.run_id, oid = args.oid, %err, "cancel rejected");
                        diagnostics.push(Diagnostic {
                            timestamp: t,
                            context: format!("cancelOrder oid={}", args.oid),
                            detail: err.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Expand one `placeOrder` action into a parent order and, when a
    /// `tpsl` bracket is present, two OCO children sharing its id.
    fn apply_place(
        &self,
        runner: &mut BacktestRunner,
        t: DateTime<Utc>,
        args: PlaceOrderArgs,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let Some(symbol) = self.config.coin_map.symbol_for(&args.coin).cloned() else {
            warn!(run_id = %self.run_id, coin = %args.coin, "unknown coin in placeOrder");
            diagnostics.push(Diagnostic {
                timestamp: t,
                context: format!("placeOrder coin={}", args.coin),
                detail: format!("unknown symbol: {}", args.coin),
            });
            return;
        };
        let side = if args.is_buy { Side::Buy } else { Side::Sell };
        let limit = args.limit_px.filter(|px| *px > Decimal::ZERO);
        let request = OrderRequest {
            symbol: symbol.clone(),
            side,
            order_type: if limit.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            size: args.sz,
            price: limit,
            reduce_only: args.reduce_only,
            post_only: false,
            parent_id: None,
        };
        let parent = match runner.place(request.clone()) {
            Ok(order) => order,
            Err(err) => {
                warn!(run_id = %self.run_id, %err, "order rejected");
                diagnostics.push(Diagnostic {
                    timestamp: t,
                    context: intended_order(&request),
                    detail: err.to_string(),
                });
                return;
            }
        };
        let Some(tpsl) = args.tpsl else { return };
        let bracket = [
            (OrderType::TakeProfit, tpsl.take_profit),
            (OrderType::StopLoss, tpsl.stop_loss),
        ];
        for (order_type, price) in bracket {
            let Some(price) = price else { continue };
            let child = OrderRequest {
                symbol: symbol.clone(),
                side: side.inverse(),
                order_type,
                size: args.sz,
                price: Some(price),
                reduce_only: false,
                post_only: false,
                parent_id: Some(parent.id),
            };
            if let Err(err) = runner.place(child.clone()) {
                warn!(run_id = %self.run_id, %err, "protective child rejected");
                diagnostics.push(Diagnostic {
                    timestamp: t,
                    context: intended_order(&child),
                    detail: err.to_string(),
                });
            }
        }
    }

    fn finalise(
        &self,
        runner: BacktestRunner,
        equity_curve: Vec<EquityPoint>,
        diagnostics: Vec<Diagnostic>,
        failure: Option<String>,
    ) -> Report {
        let engine = runner.engine();
        let orders = engine.all_orders();
        let fills = engine.trade_log().to_vec();
        let completed = TradePairer::new(&orders).pair(&fills);
        let metrics = PortfolioMetrics::calculate(
            &completed,
            &fills,
            &equity_curve,
            engine.stats(),
            self.config.initial_balance,
        );
        let echo = ConfigEcho {
            symbol: &self.config.symbol,
            start_time: self.config.start_time.timestamp(),
            end_time: self.config.end_time.timestamp(),
            decision_interval_secs: self.config.decision_interval.num_seconds(),
            fee_rate: self.config.fee_rate,
            slippage_model: self.config.slippage.describe(),
            initial_balance: self.config.initial_balance,
            strategy: self.strategy.is_some(),
        };
        let reproducibility = Reproducibility {
            data_hash: engine.data_hash(),
            strategy_config: serde_json::to_string(&echo)
                .unwrap_or_else(|err| format!("unserialisable config: {err}")),
            engine_version: self.config.engine_version.clone(),
            fee_rate: self.config.fee_rate,
            slippage_model: self.config.slippage.describe().to_string(),
        };
        let status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        info!(
            run_id = %self.run_id,
            ?status,
            trades = completed.len(),
            fills = fills.len(),
            "run finished"
        );
        Report {
            status,
            failure_reason: failure,
            symbol: self.config.symbol.clone(),
            start_time: self.config.start_time,
            end_time: self.config.end_time,
            trades: completed,
            fills,
            equity_curve,
            metrics,
            reproducibility,
            diagnostics,
        }
    }
}

fn intended_order(request: &OrderRequest) -> String {
    format!(
        "{:?} {:?} {} {} @ {}",
        request.side,
        request.order_type,
        request.size,
        request.symbol,
        request
            .price
            .map(|p| p.to_string())
            .unwrap_or_else(|| "market".to_string())
    )
}
