//! HTTP façade over the virtual exchange.
//!
//! Both the virtual and the real exchange honour the same wire shapes:
//! Hyperliquid-flavoured order bodies, `{status, response}` envelopes,
//! decimal-as-string amounts and Unix-second timestamps on structured
//! payloads. Each orchestrated backtest runs on its own isolated bundle;
//! the interactive session endpoints share one server-owned runner.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use url::Url;
use vex_backtest::{
    BacktestError, BacktestRunner, HttpStrategyClient, Orchestrator, OrchestratorConfig,
};
use vex_core::{CoinMap, OrderId, OrderRequest, OrderType, Price, Quantity, Side, Symbol};
use vex_data::{CandleSource, DataError, NewsSource};
use vex_engine::{EngineConfig, EngineError, MatchingEngine, SlippageModel, SnapshotStore, Wallet};

/// Static server parameters.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Base assets tradable on the session exchange (e.g. `["BTC", "ETH"]`).
    pub coins: Vec<String>,
    pub quote: String,
    pub initial_balance: Decimal,
    pub fee_rate: Decimal,
    pub slippage: SlippageModel,
    /// Historical range pre-loaded into the interactive session runner.
    pub session_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Bounded timeout for outbound strategy calls.
    pub strategy_timeout: StdDuration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            coins: vec!["BTC".to_string(), "ETH".to_string()],
            quote: "USDT".to_string(),
            initial_balance: Decimal::from(10_000),
            fee_rate: Decimal::ZERO,
            slippage: SlippageModel::default(),
            session_window: None,
            strategy_timeout: StdDuration::from_secs(120),
        }
    }
}

/// Shared state behind the router.
pub struct ServerState {
    config: ServerConfig,
    coin_map: CoinMap,
    candles: Arc<dyn CandleSource>,
    news: Option<Arc<dyn NewsSource>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    session: Mutex<BacktestRunner>,
}

impl ServerState {
    /// Build the state, pre-loading the session window when configured.
    pub async fn new(
        config: ServerConfig,
        candles: Arc<dyn CandleSource>,
        news: Option<Arc<dyn NewsSource>>,
        snapshots: Option<Arc<dyn SnapshotStore>>,
    ) -> Result<Self, ServerError> {
        let coin_map = CoinMap::with_quote(config.coins.iter(), &config.quote);
        let symbols: std::collections::BTreeSet<Symbol> = coin_map.symbols().cloned().collect();
        let engine_config = EngineConfig {
            fee_rate: config.fee_rate,
            slippage: config.slippage,
            symbols: symbols.clone(),
        };
        let mut engine = MatchingEngine::new(engine_config, Wallet::new(config.initial_balance));
        let window_start = config
            .session_window
            .map(|(start, _)| start)
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap_or_default());
        let mut window = Vec::new();
        if let Some((start, end)) = config.session_window {
            for symbol in &symbols {
                window.extend(candles.candles(symbol, start, end).await?);
            }
            engine.load_candles(window.clone())?;
        }
        let news_items = match &news {
            Some(source) => source.published_before(DateTime::<Utc>::MAX_UTC).await?,
            None => Vec::new(),
        };
        let mut session = BacktestRunner::new(engine, window_start);
        session.load_window(window, news_items);
        Ok(Self {
            config,
            coin_map,
            candles,
            news,
            snapshots,
            session: Mutex::new(session),
        })
    }
}

/// Build the full API router.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/exchange/order", post(place_order))
        .route("/exchange/cancel", post(cancel_order))
        .route("/exchange/modify", post(modify_order))
        .route("/info", post(account_info))
        .route("/gpt-latest/:symbol", get(market_snapshot))
        .route("/top-news", get(top_news))
        .route("/backtest/orchestrate", post(orchestrate))
        .route("/backtest/run", post(run_prebuilt))
        .with_state(state)
}

/// Errors mapped onto HTTP statuses with an `{status: "err"}` envelope.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Backtest(#[from] BacktestError),
    #[error(transparent)]
    Data(#[from] DataError),
}

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Engine(err) => match err {
                EngineError::InvalidOrder(_)
                | EngineError::InsufficientFunds { .. }
                | EngineError::UnknownSymbol(_)
                | EngineError::AlreadyTerminal(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Backtest(err) => match err {
                BacktestError::InvalidConfig(_) | BacktestError::ClockRegression { .. } => {
                    StatusCode::BAD_REQUEST
                }
                BacktestError::Data(_) => StatusCode::UNPROCESSABLE_ENTITY,
                BacktestError::StrategyUnavailable(_) | BacktestError::StrategyTimeout(_) => {
                    StatusCode::BAD_GATEWAY
                }
                BacktestError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Data(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "status": "err", "response": self.to_string() }));
        (status, body).into_response()
    }
}

fn ok(response: impl Serialize) -> Json<Value> {
    Json(json!({ "status": "ok", "response": response }))
}

/// Hyperliquid-flavoured order body.
#[derive(Clone, Debug, Deserialize)]
pub struct PlaceOrderBody {
    pub coin: String,
    pub is_buy: bool,
    pub sz: Quantity,
    /// Absent or zero means a market order.
    #[serde(default)]
    pub limit_px: Option<Price>,
    /// Explicit order type; the closed set is enforced at this boundary.
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default)]
    pub tpsl: Option<TpslBody>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TpslBody {
    #[serde(default)]
    pub take_profit: Option<Price>,
    #[serde(default)]
    pub stop_loss: Option<Price>,
}

#[derive(Deserialize)]
struct CancelBody {
    oid: OrderId,
}

#[derive(Deserialize)]
struct ModifyBody {
    oid: OrderId,
    #[serde(default)]
    new_price: Option<Price>,
    #[serde(default)]
    new_size: Option<Quantity>,
}

#[derive(Deserialize)]
struct TimestampQuery {
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Deserialize)]
struct TopNewsQuery {
    #[serde(default)]
    before_timestamp: Option<i64>,
    #[serde(default = "default_news_k")]
    k: usize,
}

fn default_news_k() -> usize {
    10
}

/// Body of `/backtest/orchestrate`; times are ISO-8601 UTC.
#[derive(Deserialize)]
struct OrchestrateBody {
    symbol: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    #[serde(default)]
    meeting_interval_hours: Option<i64>,
    #[serde(default)]
    strategy_agent_url: Option<Url>,
    #[serde(default)]
    fee_rate: Option<Decimal>,
    #[serde(default)]
    initial_balance: Option<Decimal>,
}

#[derive(Deserialize)]
struct RunBody {
    symbol: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    #[serde(default)]
    orders: Vec<PlaceOrderBody>,
}

fn resolve_request(
    coin_map: &CoinMap,
    body: &PlaceOrderBody,
) -> Result<OrderRequest, ServerError> {
    let symbol = coin_map
        .symbol_for(&body.coin)
        .cloned()
        .ok_or_else(|| ServerError::Engine(EngineError::UnknownSymbol(body.coin.clone())))?;
    let limit = body.limit_px.filter(|px| *px > Decimal::ZERO);
    let order_type = match &body.order_type {
        Some(raw) => raw
            .parse::<OrderType>()
            .map_err(|err| ServerError::Engine(EngineError::InvalidOrder(err)))?,
        None => {
            if limit.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            }
        }
    };
    Ok(OrderRequest {
        symbol,
        side: if body.is_buy { Side::Buy } else { Side::Sell },
        order_type,
        size: body.sz,
        price: limit,
        reduce_only: body.reduce_only,
        post_only: body.post_only,
        parent_id: None,
    })
}

async fn place_order(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<PlaceOrderBody>,
) -> Result<Json<Value>, ServerError> {
    let request = resolve_request(&state.coin_map, &body)?;
    let mut session = state.session.lock().await;
    session.prime_mark(&request.symbol);
    let parent = session.place(request)?;
    let mut children = Vec::new();
    if let Some(tpsl) = &body.tpsl {
        let bracket = [
            (OrderType::TakeProfit, tpsl.take_profit),
            (OrderType::StopLoss, tpsl.stop_loss),
        ];
        for (order_type, price) in bracket {
            let Some(price) = price else { continue };
            let child = OrderRequest {
                symbol: parent.request.symbol.clone(),
                side: parent.request.side.inverse(),
                order_type,
                size: parent.request.size,
                price: Some(price),
                reduce_only: false,
                post_only: false,
                parent_id: Some(parent.id),
            };
            children.push(session.place(child)?);
        }
    }
    Ok(ok(json!({
        "oid": parent.id,
        "order": parent,
        "children": children.iter().map(|c| c.id).collect::<Vec<_>>(),
    })))
}

async fn cancel_order(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CancelBody>,
) -> Result<Json<Value>, ServerError> {
    let mut session = state.session.lock().await;
    let order = session.cancel(body.oid)?;
    Ok(ok(order))
}

async fn modify_order(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ModifyBody>,
) -> Result<Json<Value>, ServerError> {
    let mut session = state.session.lock().await;
    let order = session.modify(body.oid, body.new_price, body.new_size)?;
    Ok(ok(order))
}

async fn account_info(State(state): State<Arc<ServerState>>) -> Result<Json<Value>, ServerError> {
    let session = state.session.lock().await;
    Ok(ok(session.account_info()))
}

async fn market_snapshot(
    State(state): State<Arc<ServerState>>,
    Path(symbol): Path<String>,
    Query(query): Query<TimestampQuery>,
) -> Result<Json<Value>, ServerError> {
    let mut session = state.session.lock().await;
    if let Some(ts) = query.timestamp {
        let at = parse_unix(ts)?;
        session.set_current_time(at)?;
    }
    Ok(ok(session.market_snapshot(&symbol.to_uppercase())))
}

async fn top_news(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<TopNewsQuery>,
) -> Result<Json<Value>, ServerError> {
    let mut session = state.session.lock().await;
    if let Some(ts) = query.before_timestamp {
        let at = parse_unix(ts)?;
        session.set_current_time(at)?;
    }
    Ok(ok(session.top_news(query.k)))
}

async fn orchestrate(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<OrchestrateBody>,
) -> Result<Json<Value>, ServerError> {
    let mut config = OrchestratorConfig::new(
        body.symbol.to_uppercase(),
        body.start_time,
        body.end_time,
    );
    config.coin_map = state.coin_map.clone();
    config.fee_rate = body.fee_rate.unwrap_or(state.config.fee_rate);
    config.slippage = state.config.slippage;
    config.initial_balance = body.initial_balance.unwrap_or(state.config.initial_balance);
    if let Some(hours) = body.meeting_interval_hours {
        if hours <= 0 {
            return Err(ServerError::BadRequest(
                "meeting_interval_hours must be positive".to_string(),
            ));
        }
        config.decision_interval = chrono::Duration::hours(hours);
    }
    let mut orchestrator = Orchestrator::new(config);
    if let Some(url) = body.strategy_agent_url {
        let client = HttpStrategyClient::new(url, state.config.strategy_timeout)?;
        orchestrator = orchestrator.with_strategy(Arc::new(client));
    }
    if let Some(store) = &state.snapshots {
        orchestrator = orchestrator.with_snapshots(Arc::clone(store));
    }
    let report = orchestrator
        .run(state.candles.as_ref(), state.news.as_deref())
        .await?;
    Ok(ok(report))
}

async fn run_prebuilt(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RunBody>,
) -> Result<Json<Value>, ServerError> {
    let mut config = OrchestratorConfig::new(
        body.symbol.to_uppercase(),
        body.start_time,
        body.end_time,
    );
    config.coin_map = state.coin_map.clone();
    config.fee_rate = state.config.fee_rate;
    config.initial_balance = state.config.initial_balance;
    let mut orders = Vec::with_capacity(body.orders.len());
    for order in &body.orders {
        if order.tpsl.is_some() {
            warn!(coin = %order.coin, "tpsl is ignored on pre-built order lists");
        }
        orders.push(resolve_request(&state.coin_map, order)?);
    }
    let orchestrator = Orchestrator::new(config);
    let report = orchestrator
        .run_prebuilt(orders, state.candles.as_ref())
        .await?;
    Ok(ok(report))
}

fn parse_unix(ts: i64) -> Result<DateTime<Utc>, ServerError> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| ServerError::BadRequest(format!("timestamp {ts} out of range")))
}
