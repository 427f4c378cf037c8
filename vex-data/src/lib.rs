//! Historical data access for the virtual exchange.
//!
//! Sources are read-only and safe to share across concurrently executing
//! runs; all mutation happens inside the per-run engine state.

pub mod csv_store;
pub mod hash;
pub mod resample;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use thiserror::Error;
use vex_core::{Candle, Interval, NewsItem, Symbol};

pub use csv_store::CsvCandleStore;
pub use hash::DatasetDigest;
pub use resample::resample;

/// Result alias for data-layer operations.
pub type DataResult<T> = Result<T, DataError>;

/// Errors surfaced by data sources.
#[derive(Debug, Error)]
pub enum DataError {
    /// The requested range is not fully covered by one-minute bars.
    /// Fatal to a backtest run.
    #[error("data gap for {symbol}: no 1m candle starting at {missing_at}")]
    DataGap {
        symbol: Symbol,
        missing_at: DateTime<Utc>,
    },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error(transparent)]
    Candle(#[from] vex_core::CoreError),
}

/// Provides time-indexed one-minute candles.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// All one-minute candles with `start` in `[start, end)`, sorted by
    /// bar start. The canonical interval is one minute; coarser intervals
    /// are derived by the caller.
    async fn candles(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DataResult<Vec<Candle>>;
}

/// Provides time-indexed news items.
#[async_trait]
pub trait NewsSource: Send + Sync {
    /// All items published at or before `before`, in source order.
    async fn published_before(&self, before: DateTime<Utc>) -> DataResult<Vec<NewsItem>>;
}

/// In-memory candle source used by tests and pre-loaded runs.
#[derive(Clone, Debug, Default)]
pub struct MemoryCandleSource {
    by_symbol: HashMap<Symbol, Vec<Candle>>,
}

impl MemoryCandleSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert candles, keeping each symbol's series sorted by bar start.
    pub fn extend(&mut self, candles: impl IntoIterator<Item = Candle>) {
        for candle in candles {
            self.by_symbol
                .entry(candle.symbol.clone())
                .or_default()
                .push(candle);
        }
        for series in self.by_symbol.values_mut() {
            series.sort_by_key(|c| c.start);
        }
    }
}

#[async_trait]
impl CandleSource for MemoryCandleSource {
    async fn candles(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DataResult<Vec<Candle>> {
        Ok(self
            .by_symbol
            .get(symbol)
            .map(|series| {
                series
                    .iter()
                    .filter(|c| c.start >= start && c.start < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// In-memory news source.
#[derive(Clone, Debug, Default)]
pub struct MemoryNewsSource {
    items: Vec<NewsItem>,
}

impl MemoryNewsSource {
    #[must_use]
    pub fn new(items: Vec<NewsItem>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl NewsSource for MemoryNewsSource {
    async fn published_before(&self, before: DateTime<Utc>) -> DataResult<Vec<NewsItem>> {
        Ok(self
            .items
            .iter()
            .filter(|item| item.published_at <= before)
            .cloned()
            .collect())
    }
}

/// Round a timestamp down to the enclosing interval boundary.
#[must_use]
pub fn align_down(ts: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
    ts.duration_trunc(interval.as_duration())
        .expect("interval durations are well below the chrono rounding limit")
}

/// Round a timestamp up to the next interval boundary (identity when aligned).
#[must_use]
pub fn align_up(ts: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
    let down = align_down(ts, interval);
    if down == ts {
        ts
    } else {
        down + interval.as_duration()
    }
}

/// Verify that `candles` covers every one-minute bar in `[start, end)`.
///
/// `candles` must be sorted by bar start; the orchestrator rejects runs
/// whose range is not fully covered before accepting any order.
pub fn verify_coverage(
    candles: &[Candle],
    symbol: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> DataResult<()> {
    let mut expected = align_up(start, Interval::OneMinute);
    let step = Duration::minutes(1);
    let mut iter = candles.iter();
    while expected + step <= end {
        match iter.next() {
            Some(candle) if candle.start == expected => {}
            _ => {
                return Err(DataError::DataGap {
                    symbol: symbol.to_string(),
                    missing_at: expected,
                })
            }
        }
        expected += step;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use vex_core::{Candle, Interval};

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    pub fn minute_candle(offset_minutes: i64, close: i64) -> Candle {
        let close = Decimal::from(close);
        Candle {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::OneMinute,
            start: t0() + chrono::Duration::minutes(offset_minutes),
            open: close,
            high: close,
            low: close,
            close,
            volume: Decimal::ONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{minute_candle, t0};
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn memory_source_filters_by_range() {
        let mut source = MemoryCandleSource::new();
        source.extend((0..5).map(|i| minute_candle(i, 100 + i)));
        let window = source
            .candles("BTCUSDT", t0() + Duration::minutes(1), t0() + Duration::minutes(4))
            .await
            .unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].start, t0() + Duration::minutes(1));
    }

    #[test]
    fn coverage_accepts_contiguous_series() {
        let candles: Vec<_> = (0..10).map(|i| minute_candle(i, 100)).collect();
        assert!(verify_coverage(&candles, "BTCUSDT", t0(), t0() + Duration::minutes(10)).is_ok());
    }

    #[test]
    fn coverage_reports_the_first_missing_bar() {
        let mut candles: Vec<_> = (0..10).map(|i| minute_candle(i, 100)).collect();
        candles.remove(4);
        let err = verify_coverage(&candles, "BTCUSDT", t0(), t0() + Duration::minutes(10))
            .unwrap_err();
        match err {
            DataError::DataGap { missing_at, .. } => {
                assert_eq!(missing_at, t0() + Duration::minutes(4));
            }
            other => panic!("expected DataGap, got {other:?}"),
        }
    }

    #[test]
    fn align_helpers_round_to_interval() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 13, 7, 0).unwrap();
        assert_eq!(
            align_down(ts, Interval::FourHours),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(
            align_up(ts, Interval::FifteenMinutes),
            Utc.with_ymd_and_hms(2024, 1, 1, 13, 15, 0).unwrap()
        );
        let aligned = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(align_up(aligned, Interval::FourHours), aligned);
    }
}
