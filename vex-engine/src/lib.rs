//! Deterministic candle-driven matching engine.
//!
//! The engine exclusively owns the wallet; nothing outside it mutates
//! orders or positions. It is strictly synchronous: the caller hands it the
//! validated one-minute candle window at run start and drives it forward
//! with [`MatchingEngine::advance_to`]. Replaying the same candle window
//! with the same accepted-order stream yields a byte-identical trade log.

pub mod snapshot;
pub mod wallet;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use vex_core::{
    BarKind, CancelReason, Candle, CoreError, Order, OrderId, OrderRequest, OrderState, OrderType,
    Price, Quantity, Side, Symbol, Trade,
};
use vex_data::DatasetDigest;

pub use snapshot::{
    MemorySnapshotStore, RunSnapshot, SnapshotStore, SqliteSnapshotStore, StepFragment,
};
pub use wallet::{Reservation, Wallet};

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the engine. The first four are rejected at the call
/// site and leave the run alive; the rest are fatal.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Price, available: Price },
    #[error("unknown symbol: {0}")]
    UnknownSymbol(Symbol),
    #[error("order {0} is already terminal")]
    AlreadyTerminal(OrderId),
    #[error(transparent)]
    MalformedCandle(#[from] CoreError),
    #[error("engine invariant violated: {0}")]
    Invariant(String),
    #[error("snapshot persistence failed: {0}")]
    Snapshot(String),
}

/// How market orders are priced against the bar that fills them.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageModel {
    /// Market orders fill at the bar open.
    #[default]
    FillAtOpen,
    /// Market orders fill at the bar close.
    FillAtClose,
}

impl SlippageModel {
    /// Free-form description recorded in the reproducibility metadata.
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::FillAtOpen => "market: fill at bar open, limit: 0",
            Self::FillAtClose => "market: fill at bar close, limit: 0",
        }
    }
}

/// Static engine parameters fixed for the lifetime of a run.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub fee_rate: Decimal,
    pub slippage: SlippageModel,
    /// Symbols accepted by `place`; anything else is `UnknownSymbol`.
    pub symbols: BTreeSet<Symbol>,
}

impl EngineConfig {
    /// Zero-fee engine over the given symbols with the default fill model.
    pub fn new(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            fee_rate: Decimal::ZERO,
            slippage: SlippageModel::default(),
            symbols: symbols.into_iter().collect(),
        }
    }
}

/// Counters used by the report's exposure metric.
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStats {
    pub bars_processed: u64,
    pub bars_in_position: u64,
}

struct SnapshotSink {
    run_id: String,
    store: Arc<dyn SnapshotStore>,
}

/// The matching engine for one isolated run.
pub struct MatchingEngine {
    config: EngineConfig,
    wallet: Wallet,
    orders: BTreeMap<OrderId, Order>,
    next_order_id: OrderId,
    window: Vec<Candle>,
    cursor: usize,
    marks: HashMap<Symbol, Price>,
    digest: DatasetDigest,
    stats: EngineStats,
    persistence: Option<SnapshotSink>,
}

impl MatchingEngine {
    /// Create an engine owning the given wallet.
    #[must_use]
    pub fn new(config: EngineConfig, wallet: Wallet) -> Self {
        Self {
            config,
            wallet,
            orders: BTreeMap::new(),
            next_order_id: 1,
            window: Vec::new(),
            cursor: 0,
            marks: HashMap::new(),
            digest: DatasetDigest::new(),
            stats: EngineStats::default(),
            persistence: None,
        }
    }

    /// Persist a full snapshot after every state-changing call.
    #[must_use]
    pub fn with_persistence(mut self, run_id: impl Into<String>, store: Arc<dyn SnapshotStore>) -> Self {
        self.persistence = Some(SnapshotSink {
            run_id: run_id.into(),
            store,
        });
        self
    }

    /// Load the validated one-minute window the run will match against.
    ///
    /// Candles are ordered by close time, ties broken by symbol ascending;
    /// this ordering is part of the determinism contract.
    pub fn load_candles(&mut self, mut candles: Vec<Candle>) -> EngineResult<()> {
        for candle in &candles {
            candle.validate()?;
        }
        candles.sort_by(|a, b| (a.close_time(), &a.symbol).cmp(&(b.close_time(), &b.symbol)));
        info!(bars = candles.len(), "loaded candle window");
        self.window = candles;
        self.cursor = 0;
        Ok(())
    }

    /// Prime the mark used for equity accounting and market reservations.
    pub fn set_mark_price(&mut self, symbol: &str, price: Price) {
        self.marks.insert(symbol.to_string(), price);
        self.wallet.mark_price(symbol, price);
    }

    #[must_use]
    pub fn mark_price(&self, symbol: &str) -> Option<Price> {
        self.marks.get(symbol).copied()
    }

    #[must_use]
    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    #[must_use]
    pub fn fee_rate(&self) -> Decimal {
        self.config.fee_rate
    }

    #[must_use]
    pub fn slippage(&self) -> SlippageModel {
        self.config.slippage
    }

    /// Hex digest over the candle rows consumed so far.
    #[must_use]
    pub fn data_hash(&self) -> String {
        self.digest.clone().finalize()
    }

    #[must_use]
    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    /// Non-terminal orders sorted by id.
    #[must_use]
    pub fn open_orders(&self) -> Vec<Order> {
        self.orders
            .values()
            .filter(|o| !o.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Every order the run has accepted, terminal or not.
    #[must_use]
    pub fn all_orders(&self) -> Vec<Order> {
        self.orders.values().cloned().collect()
    }

    #[must_use]
    pub fn trade_log(&self) -> &[Trade] {
        self.wallet.trades()
    }

    /// Current account snapshot for the read API.
    #[must_use]
    pub fn account_info(&self) -> vex_core::AccountInfo {
        vex_core::AccountInfo {
            equity: self.wallet.equity(),
            cash: self.wallet.cash(),
            total_margin_used: self.wallet.total_margin_used(),
            positions: self.wallet.positions(),
            open_orders: self.open_orders(),
        }
    }

    /// Validate and accept an order, debiting its reservation immediately.
    ///
    /// The id is assigned at acceptance and strictly increases with
    /// acceptance order; rejected requests consume no id.
    pub fn place(&mut self, request: OrderRequest, now: DateTime<Utc>) -> EngineResult<Order> {
        let request = self.validate_request(request)?;
        let state = match request.parent_id {
            Some(parent_id) => {
                let parent = self
                    .orders
                    .get(&parent_id)
                    .ok_or_else(|| EngineError::InvalidOrder(format!("unknown parent order {parent_id}")))?;
                if parent.state.is_terminal() && parent.state != OrderState::Filled {
                    return Err(EngineError::InvalidOrder(format!(
                        "parent order {parent_id} is no longer active"
                    )));
                }
                if parent.state == OrderState::Filled {
                    OrderState::Open
                } else {
                    OrderState::New
                }
            }
            None => OrderState::Open,
        };
        let order = Order::accepted(self.next_order_id, request, state, now);
        let mark = self
            .marks
            .get(&order.request.symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);
        self.wallet.reserve(&order, mark, self.config.fee_rate)?;
        self.next_order_id += 1;
        info!(
            order_id = order.id,
            symbol = %order.request.symbol,
            side = ?order.request.side,
            order_type = ?order.request.order_type,
            size = %order.request.size,
            price = ?order.request.price,
            "order accepted"
        );
        self.orders.insert(order.id, order.clone());
        self.persist()?;
        Ok(order)
    }

    /// Cancel an order, refunding its reservation. Cancelling one leg of an
    /// OCO pair cancels both; cancelling a parent cancels its children.
    pub fn cancel(&mut self, id: OrderId, now: DateTime<Utc>) -> EngineResult<Order> {
        let order = self
            .orders
            .get(&id)
            .ok_or_else(|| EngineError::InvalidOrder(format!("unknown order id {id}")))?;
        if order.state.is_terminal() {
            return Err(EngineError::AlreadyTerminal(id));
        }
        self.cancel_single(id, CancelReason::User, now)?;
        for sibling in self.sibling_ids(id) {
            self.cancel_single(sibling, CancelReason::Oco, now)?;
        }
        for child in self.child_ids(id) {
            self.cancel_single(child, CancelReason::ParentCancelled, now)?;
        }
        self.persist()?;
        Ok(self.orders[&id].clone())
    }

    /// Replace price and/or size, preserving the OCO linkage. Equivalent to
    /// cancel-then-place with a fresh id.
    pub fn modify(
        &mut self,
        id: OrderId,
        new_price: Option<Price>,
        new_size: Option<Quantity>,
        now: DateTime<Utc>,
    ) -> EngineResult<Order> {
        let order = self
            .orders
            .get(&id)
            .ok_or_else(|| EngineError::InvalidOrder(format!("unknown order id {id}")))?;
        if order.state.is_terminal() {
            return Err(EngineError::AlreadyTerminal(id));
        }
        if !matches!(order.state, OrderState::Open | OrderState::PartiallyFilled) {
            return Err(EngineError::InvalidOrder(format!(
                "order {id} cannot be modified in state {:?}",
                order.state
            )));
        }
        let mut request = order.request.clone();
        if let Some(price) = new_price {
            request.price = Some(price);
        }
        if let Some(size) = new_size {
            request.size = size;
        }
        self.cancel_single(id, CancelReason::Replaced, now)?;
        let replacement = self.place(request, now)?;
        // Children of a replaced parent follow it to the new id.
        for child in self.child_ids(id) {
            if let Some(child_order) = self.orders.get_mut(&child) {
                child_order.request.parent_id = Some(replacement.id);
            }
        }
        self.persist()?;
        Ok(replacement)
    }

    /// Feed every loaded candle with `close_time <= until` through the
    /// matching algorithm, in strict chronological order. Returns the
    /// trades executed by this call.
    pub fn advance_to(&mut self, until: DateTime<Utc>) -> EngineResult<Vec<Trade>> {
        let mut executed = Vec::new();
        while self.cursor < self.window.len() && self.window[self.cursor].close_time() <= until {
            let candle = self.window[self.cursor].clone();
            self.cursor += 1;
            self.apply_candle(&candle, &mut executed)?;
        }
        self.persist()?;
        Ok(executed)
    }

    fn validate_request(&self, mut request: OrderRequest) -> EngineResult<OrderRequest> {
        if !self.config.symbols.contains(&request.symbol) {
            return Err(EngineError::UnknownSymbol(request.symbol));
        }
        if request.size <= Decimal::ZERO {
            return Err(EngineError::InvalidOrder(format!(
                "size must be positive, got {}",
                request.size
            )));
        }
        match request.order_type {
            OrderType::Market => {
                request.price = None;
            }
            _ => match request.price {
                Some(price) if price > Decimal::ZERO => {}
                _ => {
                    return Err(EngineError::InvalidOrder(format!(
                        "{:?} order requires a positive price",
                        request.order_type
                    )))
                }
            },
        }
        if request.post_only {
            if request.order_type != OrderType::Limit {
                return Err(EngineError::InvalidOrder(
                    "post-only applies to limit orders only".to_string(),
                ));
            }
            if let (Some(limit), Some(mark)) = (
                request.price,
                self.marks.get(&request.symbol).copied(),
            ) {
                let crosses = match request.side {
                    Side::Buy => limit >= mark,
                    Side::Sell => limit <= mark,
                };
                if crosses {
                    return Err(EngineError::InvalidOrder(format!(
                        "post-only limit {limit} would cross the market at {mark}"
                    )));
                }
            }
        }
        Ok(request)
    }

    fn sibling_ids(&self, id: OrderId) -> Vec<OrderId> {
        let Some(parent_id) = self.orders.get(&id).and_then(|o| o.request.parent_id) else {
            return Vec::new();
        };
        self.orders
            .values()
            .filter(|o| o.id != id && o.request.parent_id == Some(parent_id) && !o.state.is_terminal())
            .map(|o| o.id)
            .collect()
    }

    fn child_ids(&self, id: OrderId) -> Vec<OrderId> {
        self.orders
            .values()
            .filter(|o| o.request.parent_id == Some(id) && !o.state.is_terminal())
            .map(|o| o.id)
            .collect()
    }

    fn cancel_single(
        &mut self,
        id: OrderId,
        reason: CancelReason,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let order = self
            .orders
            .get_mut(&id)
            .ok_or_else(|| EngineError::Invariant(format!("cancel of missing order {id}")))?;
        if order.state.is_terminal() {
            return Ok(());
        }
        if !order.state.may_transition(OrderState::Cancelled) {
            return Err(EngineError::Invariant(format!(
                "illegal transition {:?} -> Cancelled for order {id}",
                order.state
            )));
        }
        order.state = OrderState::Cancelled;
        order.cancel_reason = Some(reason);
        order.updated_at = now;
        self.wallet.release(id);
        debug!(order_id = id, ?reason, "order cancelled");
        Ok(())
    }

    /// Apply one candle. The per-candle event sequence is an observable
    /// contract: snapshot, market fills, triggered protective orders,
    /// limit fills, position update, fees. Ties break by id ascending.
    fn apply_candle(&mut self, candle: &Candle, executed: &mut Vec<Trade>) -> EngineResult<()> {
        candle.validate()?;
        let now = candle.close_time();
        // Orders placed within this bar first become eligible on the next
        // bar, which keeps the run independent of strategy wall time.
        let snapshot: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| {
                o.is_matchable() && o.request.symbol == candle.symbol && o.created_at < candle.start
            })
            .map(|o| o.id)
            .collect();

        for &id in &snapshot {
            if self.order_type(id) != Some(OrderType::Market) || !self.is_matchable(id) {
                continue;
            }
            let (price, kind) = match self.config.slippage {
                SlippageModel::FillAtOpen => (candle.open, BarKind::BarOpen),
                SlippageModel::FillAtClose => (candle.close, BarKind::BarClose),
            };
            self.execute_fill(id, price, kind, now, executed)?;
        }

        let mut triggered: Vec<OrderId> = Vec::new();
        for &id in &snapshot {
            let Some(order) = self.orders.get(&id) else { continue };
            if !order.is_matchable() || !order.request.order_type.is_protective() {
                continue;
            }
            let trigger = order.request.price.ok_or_else(|| {
                EngineError::Invariant(format!("protective order {id} without a trigger"))
            })?;
            if candle.low <= trigger && trigger <= candle.high {
                triggered.push(id);
            }
        }
        // When both legs of an OCO pair trigger inside one bar, the
        // take-profit wins and the stop-loss is cancelled.
        let winners: BTreeSet<OrderId> = triggered
            .iter()
            .filter(|id| self.order_type(**id) == Some(OrderType::TakeProfit))
            .filter_map(|id| self.orders.get(id).and_then(|o| o.request.parent_id))
            .collect();
        triggered.retain(|&id| {
            let Some(order) = self.orders.get(&id) else { return false };
            if order.request.order_type == OrderType::StopLoss {
                if let Some(parent) = order.request.parent_id {
                    if winners.contains(&parent) {
                        return false;
                    }
                }
            }
            true
        });
        for id in triggered {
            let Some(order) = self.orders.get(&id) else { continue };
            if !order.is_matchable() {
                continue;
            }
            let trigger = order.request.price.unwrap_or(candle.close);
            let price = match order.request.order_type {
                OrderType::TakeProfit => trigger,
                // Stop losses fill at the worse of trigger and bar close.
                OrderType::StopLoss => match order.request.side {
                    Side::Sell => trigger.min(candle.close),
                    Side::Buy => trigger.max(candle.close),
                },
                _ => continue,
            };
            self.execute_fill(id, price, BarKind::Intrabar, now, executed)?;
            for sibling in self.sibling_ids(id) {
                self.cancel_single(sibling, CancelReason::Oco, now)?;
            }
        }

        for &id in &snapshot {
            let Some(order) = self.orders.get(&id) else { continue };
            if !order.is_matchable() || order.request.order_type != OrderType::Limit {
                continue;
            }
            let limit = order.request.price.ok_or_else(|| {
                EngineError::Invariant(format!("limit order {id} without a price"))
            })?;
            if candle.low <= limit && limit <= candle.high {
                self.execute_fill(id, limit, BarKind::Intrabar, now, executed)?;
            }
        }

        self.marks.insert(candle.symbol.clone(), candle.close);
        self.wallet.mark_price(&candle.symbol, candle.close);
        self.digest.push(candle);
        self.stats.bars_processed += 1;
        if !self.wallet.position_size(&candle.symbol).is_zero() {
            self.stats.bars_in_position += 1;
        }
        Ok(())
    }

    fn order_type(&self, id: OrderId) -> Option<OrderType> {
        self.orders.get(&id).map(|o| o.request.order_type)
    }

    fn is_matchable(&self, id: OrderId) -> bool {
        self.orders.get(&id).map(Order::is_matchable).unwrap_or(false)
    }

    fn execute_fill(
        &mut self,
        id: OrderId,
        price: Price,
        bar_kind: BarKind,
        now: DateTime<Utc>,
        executed: &mut Vec<Trade>,
    ) -> EngineResult<()> {
        // OCO exclusivity: a fill while the sibling is already filled would
        // break the at-most-one guarantee.
        if let Some(parent_id) = self.orders.get(&id).and_then(|o| o.request.parent_id) {
            let sibling_filled = self.orders.values().any(|o| {
                o.id != id
                    && o.request.parent_id == Some(parent_id)
                    && o.state == OrderState::Filled
            });
            if sibling_filled {
                return Err(EngineError::Invariant(format!(
                    "both legs of OCO pair (parent {parent_id}) would fill"
                )));
            }
        }
        let order = self
            .orders
            .get_mut(&id)
            .ok_or_else(|| EngineError::Invariant(format!("fill of missing order {id}")))?;
        let size = order.remaining_size();
        if size <= Decimal::ZERO {
            return Err(EngineError::Invariant(format!(
                "order {id} has no remaining size to fill"
            )));
        }
        order.record_fill(price, size, now);
        let filled = order.state == OrderState::Filled;
        let trade = Trade {
            order_id: id,
            symbol: order.request.symbol.clone(),
            side: order.request.side,
            size,
            price,
            fee: price * size * self.config.fee_rate,
            timestamp: now,
            bar_kind,
        };
        info!(
            order_id = id,
            symbol = %trade.symbol,
            side = ?trade.side,
            size = %trade.size,
            price = %trade.price,
            ?bar_kind,
            "order filled"
        );
        self.wallet.apply_fill(trade.clone())?;
        executed.push(trade);
        if filled {
            for child in self.child_ids(id) {
                if let Some(child_order) = self.orders.get_mut(&child) {
                    if child_order.state == OrderState::New {
                        child_order.state = OrderState::Open;
                        child_order.updated_at = now;
                        debug!(order_id = child, parent_id = id, "protective child activated");
                    }
                }
            }
        }
        Ok(())
    }

    /// Full snapshot of wallet plus orders, suitable for recovery.
    #[must_use]
    pub fn snapshot(&self) -> RunSnapshot {
        let (cash, positions, trades, reservations) = self.wallet.snapshot_parts();
        RunSnapshot {
            cash,
            positions,
            trades,
            reservations,
            orders: self.all_orders(),
            next_order_id: self.next_order_id,
        }
    }

    /// Rebuild engine state from a persisted snapshot. The candle window is
    /// not part of the snapshot and must be loaded separately.
    pub fn restore(&mut self, snapshot: RunSnapshot) {
        self.wallet = Wallet::restore_parts(
            snapshot.cash,
            snapshot.positions,
            snapshot.trades,
            snapshot.reservations,
        );
        self.orders = snapshot.orders.into_iter().map(|o| (o.id, o)).collect();
        self.next_order_id = snapshot.next_order_id;
    }

    fn persist(&self) -> EngineResult<()> {
        if let Some(sink) = &self.persistence {
            let snapshot = self.snapshot();
            sink.store
                .save(&sink.run_id, &snapshot)
                .map_err(|err| EngineError::Snapshot(err.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn minute(offset: i64, open: i64, high: i64, low: i64, close: i64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            interval: vex_core::Interval::OneMinute,
            start: t0() + Duration::minutes(offset),
            open: Decimal::from(open),
            high: Decimal::from(high),
            low: Decimal::from(low),
            close: Decimal::from(close),
            volume: Decimal::ONE,
        }
    }

    fn flat_minutes(closes: &[i64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| minute(1 + i as i64, *c, *c, *c, *c))
            .collect()
    }

    fn engine(balance: i64) -> MatchingEngine {
        let config = EngineConfig::new(["BTCUSDT".to_string()]);
        MatchingEngine::new(config, Wallet::new(Decimal::from(balance)))
    }

    fn request(side: Side, order_type: OrderType, size: i64, price: Option<i64>) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side,
            order_type,
            size: Decimal::from(size),
            price: price.map(Decimal::from),
            reduce_only: false,
            post_only: false,
            parent_id: None,
        }
    }

    #[test]
    fn market_buy_fills_at_next_bar_open() {
        // Candles close 100..104; buy placed before the first bar fills at
        // its open and rides to 104.
        let mut engine = engine(10_000);
        engine.load_candles(flat_minutes(&[100, 101, 102, 103, 104])).unwrap();
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        engine
            .place(request(Side::Buy, OrderType::Market, 1, None), t0())
            .unwrap();
        let trades = engine.advance_to(t0() + Duration::minutes(6)).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, Decimal::from(100));
        assert_eq!(trades[0].bar_kind, BarKind::BarOpen);
        assert_eq!(engine.wallet().equity(), Decimal::from(10_004));
    }

    #[test]
    fn limit_away_from_the_range_stays_open() {
        let mut engine = engine(10_000);
        engine.load_candles(flat_minutes(&[100, 101, 102, 103, 104])).unwrap();
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        let order = engine
            .place(request(Side::Buy, OrderType::Limit, 1, Some(90)), t0())
            .unwrap();
        let trades = engine.advance_to(t0() + Duration::minutes(6)).unwrap();
        assert!(trades.is_empty());
        assert_eq!(engine.order(order.id).unwrap().state, OrderState::Open);
        assert_eq!(engine.wallet().equity(), Decimal::from(10_000));
    }

    #[test]
    fn oco_take_profit_wins_and_cancels_stop() {
        // Long position opened at 100, protective pair at 105/95; a bar
        // spanning 94..106 triggers both, the take-profit fills.
        let mut engine = engine(10_000);
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        let parent = engine
            .place(request(Side::Buy, OrderType::Market, 1, None), t0())
            .unwrap();
        let mut tp = request(Side::Sell, OrderType::TakeProfit, 1, Some(105));
        tp.parent_id = Some(parent.id);
        let mut sl = request(Side::Sell, OrderType::StopLoss, 1, Some(95));
        sl.parent_id = Some(parent.id);
        let tp = engine.place(tp, t0()).unwrap();
        let sl = engine.place(sl, t0()).unwrap();
        assert_eq!(engine.order(tp.id).unwrap().state, OrderState::New);

        engine
            .load_candles(vec![
                minute(1, 100, 100, 100, 100),
                minute(2, 100, 106, 94, 100),
            ])
            .unwrap();
        let trades = engine.advance_to(t0() + Duration::minutes(3)).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[1].order_id, tp.id);
        assert_eq!(trades[1].price, Decimal::from(105));
        assert_eq!(engine.order(tp.id).unwrap().state, OrderState::Filled);
        let stop = engine.order(sl.id).unwrap();
        assert_eq!(stop.state, OrderState::Cancelled);
        assert_eq!(stop.cancel_reason, Some(CancelReason::Oco));
        let position = engine.wallet().position("BTCUSDT").unwrap();
        assert_eq!(position.realized_pnl, Decimal::from(5));
    }

    #[test]
    fn stop_loss_triggers_inclusively_at_bar_high() {
        // Short from 100; a buy-side stop with trigger exactly at the bar
        // high triggers, and its take-profit sibling is cancelled.
        let mut engine = engine(10_000);
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        let parent = engine
            .place(request(Side::Sell, OrderType::Market, 1, None), t0())
            .unwrap();
        let mut sl = request(Side::Buy, OrderType::StopLoss, 1, Some(103));
        sl.parent_id = Some(parent.id);
        let mut tp = request(Side::Buy, OrderType::TakeProfit, 1, Some(90));
        tp.parent_id = Some(parent.id);
        let sl = engine.place(sl, t0()).unwrap();
        let tp = engine.place(tp, t0()).unwrap();

        engine
            .load_candles(vec![
                minute(1, 100, 100, 100, 100),
                minute(2, 100, 103, 99, 102),
            ])
            .unwrap();
        engine.advance_to(t0() + Duration::minutes(3)).unwrap();
        let stop = engine.order(sl.id).unwrap();
        assert_eq!(stop.state, OrderState::Filled);
        // Worse of trigger 103 and close 102 for a buy is 103.
        assert_eq!(stop.avg_fill_price, Some(Decimal::from(103)));
        assert_eq!(engine.order(tp.id).unwrap().state, OrderState::Cancelled);
        assert_eq!(
            engine.order(tp.id).unwrap().cancel_reason,
            Some(CancelReason::Oco)
        );
    }

    #[test]
    fn limit_exactly_at_bar_low_fills_full_size() {
        let mut engine = engine(10_000);
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        engine
            .place(request(Side::Buy, OrderType::Limit, 2, Some(95)), t0())
            .unwrap();
        engine
            .load_candles(vec![minute(1, 100, 101, 95, 99)])
            .unwrap();
        let trades = engine.advance_to(t0() + Duration::minutes(2)).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, Decimal::from(95));
        assert_eq!(trades[0].size, Decimal::from(2));
    }

    #[test]
    fn orders_skip_their_placement_bar() {
        let mut engine = engine(10_000);
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        engine.load_candles(flat_minutes(&[100, 101])).unwrap();
        // Placed exactly at the first bar's start: matches the second bar.
        engine
            .place(
                request(Side::Buy, OrderType::Market, 1, None),
                t0() + Duration::minutes(1),
            )
            .unwrap();
        let trades = engine.advance_to(t0() + Duration::minutes(3)).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, Decimal::from(101));
    }

    #[test]
    fn place_then_cancel_restores_wallet_exactly() {
        let mut engine = engine(10_000);
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        let before = engine.wallet().equity();
        let cash_before = engine.wallet().cash();
        let order = engine
            .place(request(Side::Buy, OrderType::Limit, 1, Some(95)), t0())
            .unwrap();
        engine.cancel(order.id, t0()).unwrap();
        assert_eq!(engine.wallet().equity(), before);
        assert_eq!(engine.wallet().cash(), cash_before);
        assert_eq!(engine.wallet().total_margin_used(), Decimal::ZERO);
    }

    #[test]
    fn cancel_of_terminal_order_reports_already_terminal() {
        let mut engine = engine(10_000);
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        let order = engine
            .place(request(Side::Buy, OrderType::Limit, 1, Some(95)), t0())
            .unwrap();
        engine.cancel(order.id, t0()).unwrap();
        let err = engine.cancel(order.id, t0()).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyTerminal(_)));
    }

    #[test]
    fn cancelling_one_oco_leg_cancels_both() {
        let mut engine = engine(10_000);
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        let parent = engine
            .place(request(Side::Buy, OrderType::Market, 1, None), t0())
            .unwrap();
        let mut tp = request(Side::Sell, OrderType::TakeProfit, 1, Some(105));
        tp.parent_id = Some(parent.id);
        let mut sl = request(Side::Sell, OrderType::StopLoss, 1, Some(95));
        sl.parent_id = Some(parent.id);
        let tp = engine.place(tp, t0()).unwrap();
        let sl = engine.place(sl, t0()).unwrap();
        engine.cancel(tp.id, t0()).unwrap();
        assert_eq!(engine.order(sl.id).unwrap().state, OrderState::Cancelled);
        assert_eq!(
            engine.order(sl.id).unwrap().cancel_reason,
            Some(CancelReason::Oco)
        );
    }

    #[test]
    fn modify_assigns_fresh_id_and_repoints_children() {
        let mut engine = engine(10_000);
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        let parent = engine
            .place(request(Side::Buy, OrderType::Limit, 1, Some(99)), t0())
            .unwrap();
        let mut tp = request(Side::Sell, OrderType::TakeProfit, 1, Some(105));
        tp.parent_id = Some(parent.id);
        let tp = engine.place(tp, t0()).unwrap();
        let replacement = engine
            .modify(parent.id, Some(Decimal::from(98)), None, t0())
            .unwrap();
        assert!(replacement.id > tp.id);
        assert_eq!(
            engine.order(parent.id).unwrap().cancel_reason,
            Some(CancelReason::Replaced)
        );
        assert_eq!(
            engine.order(tp.id).unwrap().request.parent_id,
            Some(replacement.id)
        );
    }

    #[test]
    fn rejections_consume_no_order_id() {
        let mut engine = engine(10);
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        let err = engine
            .place(request(Side::Buy, OrderType::Limit, 1, Some(100)), t0())
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        let err = engine
            .place(request(Side::Buy, OrderType::Limit, 1, None), t0())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOrder(_)));
        let mut unknown = request(Side::Buy, OrderType::Limit, 1, Some(1));
        unknown.symbol = "DOGEUSDT".to_string();
        let err = engine.place(unknown, t0()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownSymbol(_)));
        // First successful placement still gets id 1.
        let order = engine
            .place(request(Side::Buy, OrderType::Limit, 1, Some(5)), t0())
            .unwrap();
        assert_eq!(order.id, 1);
    }

    #[test]
    fn post_only_crossing_is_rejected_at_place() {
        let mut engine = engine(10_000);
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        let mut crossing = request(Side::Buy, OrderType::Limit, 1, Some(101));
        crossing.post_only = true;
        assert!(matches!(
            engine.place(crossing, t0()),
            Err(EngineError::InvalidOrder(_))
        ));
        let mut passive = request(Side::Buy, OrderType::Limit, 1, Some(99));
        passive.post_only = true;
        assert!(engine.place(passive, t0()).is_ok());
    }

    #[test]
    fn fill_at_close_model_prices_markets_at_close() {
        let config = EngineConfig {
            fee_rate: Decimal::ZERO,
            slippage: SlippageModel::FillAtClose,
            symbols: ["BTCUSDT".to_string()].into_iter().collect(),
        };
        let mut engine = MatchingEngine::new(config, Wallet::new(Decimal::from(10_000)));
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        engine
            .load_candles(vec![minute(1, 100, 103, 99, 102)])
            .unwrap();
        engine
            .place(request(Side::Buy, OrderType::Market, 1, None), t0())
            .unwrap();
        let trades = engine.advance_to(t0() + Duration::minutes(2)).unwrap();
        assert_eq!(trades[0].price, Decimal::from(102));
        assert_eq!(trades[0].bar_kind, BarKind::BarClose);
    }

    #[test]
    fn replay_produces_an_identical_trade_log_and_hash() {
        let run = || {
            let mut engine = engine(10_000);
            engine.set_mark_price("BTCUSDT", Decimal::from(100));
            engine
                .load_candles(vec![
                    minute(1, 100, 102, 99, 101),
                    minute(2, 101, 104, 100, 103),
                    minute(3, 103, 105, 101, 102),
                ])
                .unwrap();
            engine
                .place(request(Side::Buy, OrderType::Market, 1, None), t0())
                .unwrap();
            engine
                .place(request(Side::Sell, OrderType::Limit, 1, Some(104)), t0())
                .unwrap();
            engine.advance_to(t0() + Duration::minutes(4)).unwrap();
            (engine.trade_log().to_vec(), engine.data_hash())
        };
        let (log_a, hash_a) = run();
        let (log_b, hash_b) = run();
        assert_eq!(log_a, log_b);
        assert_eq!(hash_a, hash_b);
        assert_eq!(
            serde_json::to_vec(&log_a).unwrap(),
            serde_json::to_vec(&log_b).unwrap()
        );
    }

    #[test]
    fn malformed_candle_is_fatal() {
        let mut engine = engine(10_000);
        let mut bad = minute(1, 100, 90, 100, 100);
        bad.low = Decimal::from(100);
        bad.high = Decimal::from(90);
        assert!(matches!(
            engine.load_candles(vec![bad]),
            Err(EngineError::MalformedCandle(_))
        ));
    }

    #[test]
    fn exposure_counters_track_bars_in_position() {
        let mut engine = engine(10_000);
        engine.set_mark_price("BTCUSDT", Decimal::from(100));
        engine
            .load_candles(flat_minutes(&[100, 101, 102, 103]))
            .unwrap();
        engine
            .place(request(Side::Buy, OrderType::Market, 1, None), t0())
            .unwrap();
        engine.advance_to(t0() + Duration::minutes(5)).unwrap();
        let stats = engine.stats();
        assert_eq!(stats.bars_processed, 4);
        assert_eq!(stats.bars_in_position, 4);
    }
}
