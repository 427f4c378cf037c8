//! The backtest runner: a virtual clock plus windowed historical reads.
//!
//! Every read-side API answers "as if now were `T`". Partial, in-progress
//! candles are never served; coarser intervals are resampled on demand from
//! the one-minute window and cached.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vex_core::{
    AccountInfo, Candle, Interval, NewsItem, Order, OrderId, OrderRequest, Price, Quantity,
    Symbol, Trade,
};
use vex_data::{align_up, resample};
use vex_engine::MatchingEngine;
use vex_indicators::IndicatorSnapshot;

use crate::{BacktestError, BacktestResult};

/// Intervals served by the read API; one minute is the native series.
const DERIVED_INTERVALS: [Interval; 3] = [
    Interval::FifteenMinutes,
    Interval::FourHours,
    Interval::OneDay,
];

/// Per-interval OHLC plus indicator block in a market snapshot.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IntervalSnapshot {
    pub ohlc: Option<Candle>,
    pub indicators: IndicatorSnapshot,
}

/// Multi-timeframe view of one symbol as of the virtual clock.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub as_of: DateTime<Utc>,
    pub last_price: Option<Price>,
    pub intervals: BTreeMap<String, IntervalSnapshot>,
}

/// Owns the virtual clock and the per-run historical window.
pub struct BacktestRunner {
    engine: MatchingEngine,
    clock: Option<DateTime<Utc>>,
    window_start: DateTime<Utc>,
    candles: Vec<Candle>,
    news: Vec<NewsItem>,
    derived: HashMap<(Symbol, Interval), Vec<Candle>>,
}

impl BacktestRunner {
    /// Build a runner over an engine that has already been handed the
    /// matching window.
    #[must_use]
    pub fn new(engine: MatchingEngine, window_start: DateTime<Utc>) -> Self {
        Self {
            engine,
            clock: None,
            window_start,
            candles: Vec::new(),
            news: Vec::new(),
            derived: HashMap::new(),
        }
    }

    /// Install the read-side copies of the historical window.
    pub fn load_window(&mut self, candles: Vec<Candle>, news: Vec<NewsItem>) {
        self.candles = candles;
        self.news = news;
        self.derived.clear();
    }

    /// Set the virtual clock. Monotonic within a run; moving backwards is
    /// rejected without any state change.
    pub fn set_current_time(&mut self, t: DateTime<Utc>) -> BacktestResult<()> {
        if let Some(current) = self.clock {
            if t < current {
                return Err(BacktestError::ClockRegression {
                    current,
                    requested: t,
                });
            }
        }
        self.clock = Some(t);
        Ok(())
    }

    /// The virtual clock, or the window start before the first tick.
    #[must_use]
    pub fn current_time(&self) -> DateTime<Utc> {
        self.clock.unwrap_or(self.window_start)
    }

    /// The most recent `limit` closed candles of `interval` as of the
    /// virtual clock. In-progress bars are never returned.
    pub fn candles(&mut self, symbol: &str, interval: Interval, limit: usize) -> Vec<Candle> {
        let now = self.current_time();
        let series: Vec<Candle> = match interval {
            Interval::OneMinute => self
                .candles
                .iter()
                .filter(|c| c.symbol == symbol && c.close_time() <= now)
                .cloned()
                .collect(),
            _ => {
                let aligned_start = align_up(self.window_start, interval);
                self.derived_series(symbol, interval)
                    .iter()
                    .filter(|c| c.start >= aligned_start && c.close_time() <= now)
                    .cloned()
                    .collect()
            }
        };
        let skip = series.len().saturating_sub(limit);
        series.into_iter().skip(skip).collect()
    }

    /// Close of the last one-minute bar at or before the virtual clock.
    #[must_use]
    pub fn last_close(&self, symbol: &str) -> Option<Price> {
        let now = self.current_time();
        self.candles
            .iter()
            .filter(|c| c.symbol == symbol && c.close_time() <= now)
            .next_back()
            .map(|c| c.close)
    }

    /// At most `k` news items published by the virtual clock, ordered by
    /// importance descending, then publication time descending.
    #[must_use]
    pub fn top_news(&self, k: usize) -> Vec<NewsItem> {
        let now = self.current_time();
        let mut items: Vec<NewsItem> = self
            .news
            .iter()
            .filter(|item| item.published_at <= now)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then(b.published_at.cmp(&a.published_at))
        });
        items.truncate(k);
        items
    }

    /// Wallet snapshot at the virtual clock.
    #[must_use]
    pub fn account_info(&self) -> AccountInfo {
        self.engine.account_info()
    }

    /// Multi-timeframe indicator bundle served by the read API.
    pub fn market_snapshot(&mut self, symbol: &str) -> MarketSnapshot {
        let as_of = self.current_time();
        let last_price = self.last_close(symbol);
        let mut intervals = BTreeMap::new();
        for interval in [Interval::OneMinute]
            .into_iter()
            .chain(DERIVED_INTERVALS)
        {
            let series = self.candles(symbol, interval, 512);
            intervals.insert(
                interval.label().to_string(),
                IntervalSnapshot {
                    ohlc: series.last().cloned(),
                    indicators: IndicatorSnapshot::from_candles(&series),
                },
            );
        }
        MarketSnapshot {
            symbol: symbol.to_string(),
            as_of,
            last_price,
            intervals,
        }
    }

    /// Prime the engine's mark price from the last close at the clock;
    /// keeps equity accounting meaningful before the first fill.
    pub fn prime_mark(&mut self, symbol: &str) {
        if let Some(close) = self.last_close(symbol) {
            self.engine.set_mark_price(symbol, close);
        } else {
            debug!(symbol, "no candle at or before the clock to prime mark from");
        }
    }

    /// Place an order stamped with the virtual clock.
    pub fn place(&mut self, request: OrderRequest) -> BacktestResult<Order> {
        let now = self.current_time();
        Ok(self.engine.place(request, now)?)
    }

    pub fn cancel(&mut self, id: OrderId) -> BacktestResult<Order> {
        let now = self.current_time();
        Ok(self.engine.cancel(id, now)?)
    }

    pub fn modify(
        &mut self,
        id: OrderId,
        new_price: Option<Price>,
        new_size: Option<Quantity>,
    ) -> BacktestResult<Order> {
        let now = self.current_time();
        Ok(self.engine.modify(id, new_price, new_size, now)?)
    }

    /// Drive matching forward and move the clock with it.
    pub fn advance_to(&mut self, t: DateTime<Utc>) -> BacktestResult<Vec<Trade>> {
        let trades = self.engine.advance_to(t)?;
        self.set_current_time(t)?;
        Ok(trades)
    }

    #[must_use]
    pub fn equity(&self) -> Decimal {
        self.engine.wallet().equity()
    }

    #[must_use]
    pub fn engine(&self) -> &MatchingEngine {
        &self.engine
    }

    #[must_use]
    pub fn engine_mut(&mut self) -> &mut MatchingEngine {
        &mut self.engine
    }

    fn derived_series(&mut self, symbol: &str, interval: Interval) -> &[Candle] {
        let key = (symbol.to_string(), interval);
        if !self.derived.contains_key(&key) {
            let base: Vec<Candle> = self
                .candles
                .iter()
                .filter(|c| c.symbol == symbol)
                .cloned()
                .collect();
            self.derived.insert(key.clone(), resample(&base, interval));
        }
        self.derived
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use vex_engine::{EngineConfig, Wallet};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn minute(offset: i64, close: i64) -> Candle {
        let close = Decimal::from(close);
        Candle {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::OneMinute,
            start: t0() + Duration::minutes(offset),
            open: close,
            high: close + Decimal::ONE,
            low: close - Decimal::ONE,
            close,
            volume: Decimal::ONE,
        }
    }

    fn runner_with_minutes(count: i64) -> BacktestRunner {
        let engine = MatchingEngine::new(
            EngineConfig::new(["BTCUSDT".to_string()]),
            Wallet::new(Decimal::from(10_000)),
        );
        let mut runner = BacktestRunner::new(engine, t0());
        let candles: Vec<Candle> = (0..count).map(|i| minute(i, 100 + i)).collect();
        runner.load_window(candles, Vec::new());
        runner
    }

    #[test]
    fn clock_regression_is_rejected_without_state_change() {
        let mut runner = runner_with_minutes(10);
        runner.set_current_time(t0() + Duration::minutes(5)).unwrap();
        let err = runner
            .set_current_time(t0() + Duration::minutes(4))
            .unwrap_err();
        assert!(matches!(err, BacktestError::ClockRegression { .. }));
        assert_eq!(runner.current_time(), t0() + Duration::minutes(5));
        // Re-setting the same instant is fine.
        runner.set_current_time(t0() + Duration::minutes(5)).unwrap();
    }

    #[test]
    fn candle_reads_exclude_in_progress_bars() {
        let mut runner = runner_with_minutes(10);
        // 30 seconds into minute 3: bars 0..=2 have closed.
        runner
            .set_current_time(t0() + Duration::minutes(3) + Duration::seconds(30))
            .unwrap();
        let recent = runner.candles("BTCUSDT", Interval::OneMinute, 10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent.last().unwrap().close, Decimal::from(102));
    }

    #[test]
    fn candle_reads_honor_the_limit_with_latest_last() {
        let mut runner = runner_with_minutes(10);
        runner.set_current_time(t0() + Duration::minutes(10)).unwrap();
        let recent = runner.candles("BTCUSDT", Interval::OneMinute, 3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].close, Decimal::from(107));
        assert_eq!(recent[2].close, Decimal::from(109));
    }

    #[test]
    fn derived_intervals_only_serve_fully_closed_buckets() {
        let mut runner = runner_with_minutes(40);
        runner.set_current_time(t0() + Duration::minutes(40)).unwrap();
        let fifteen = runner.candles("BTCUSDT", Interval::FifteenMinutes, 10);
        // 40 minutes of data: two full 15m buckets, the third in progress.
        assert_eq!(fifteen.len(), 2);
        assert_eq!(fifteen[0].start, t0());
        assert_eq!(fifteen[0].open, Decimal::from(100));
        assert_eq!(fifteen[0].close, Decimal::from(114));
        assert_eq!(fifteen[1].start, t0() + Duration::minutes(15));
    }

    #[test]
    fn top_news_orders_by_importance_then_recency() {
        let engine = MatchingEngine::new(
            EngineConfig::new(["BTCUSDT".to_string()]),
            Wallet::new(Decimal::from(10_000)),
        );
        let mut runner = BacktestRunner::new(engine, t0());
        let item = |id: &str, importance: f64, offset: i64| NewsItem {
            id: id.to_string(),
            source: "wire".to_string(),
            title: id.to_string(),
            importance,
            published_at: t0() + Duration::minutes(offset),
        };
        runner.load_window(
            Vec::new(),
            vec![
                item("early-low", 0.2, 0),
                item("late-high", 0.9, 10),
                item("early-high", 0.9, 5),
                item("future", 1.0, 120),
            ],
        );
        runner.set_current_time(t0() + Duration::minutes(30)).unwrap();
        let top = runner.top_news(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].id, "late-high");
        assert_eq!(top[1].id, "early-high");
    }

    #[test]
    fn runner_indicators_match_the_collector_path_exactly() {
        // The read API resamples one-minute bars and runs the same
        // indicator routines the collector uses; values must be identical
        // for the same series.
        let mut runner = runner_with_minutes(16 * 15);
        runner
            .set_current_time(t0() + Duration::minutes(16 * 15))
            .unwrap();
        let served = runner.candles("BTCUSDT", Interval::FifteenMinutes, 512);
        let direct = {
            let base: Vec<Candle> = (0..16 * 15).map(|i| minute(i, 100 + i)).collect();
            vex_data::resample(&base, Interval::FifteenMinutes)
        };
        assert_eq!(served, direct);
        assert_eq!(
            vex_indicators::IndicatorSnapshot::from_candles(&served),
            vex_indicators::IndicatorSnapshot::from_candles(&direct)
        );
        assert!(vex_indicators::IndicatorSnapshot::from_candles(&served)
            .sma_14
            .is_some());
    }

    #[test]
    fn market_snapshot_carries_all_timeframes() {
        let mut runner = runner_with_minutes(40);
        runner.set_current_time(t0() + Duration::minutes(40)).unwrap();
        let snapshot = runner.market_snapshot("BTCUSDT");
        assert_eq!(snapshot.last_price, Some(Decimal::from(139)));
        assert_eq!(snapshot.intervals.len(), 4);
        let one_minute = &snapshot.intervals["1m"];
        assert!(one_minute.ohlc.is_some());
        assert!(one_minute.indicators.sma_14.is_some());
        // Not enough closed 4h buckets yet.
        assert!(snapshot.intervals["4h"].ohlc.is_none());
    }
}
