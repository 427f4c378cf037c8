//! Directory-backed candle store with one CSV file per symbol and day.
//!
//! Layout: `{root}/{SYMBOL}_{interval}/{YYYY-MM-DD}.csv` with columns
//! `symbol,timestamp,open,high,low,close,volume` (timestamps are Unix
//! seconds, UTC). Missing day files simply contribute no rows; coverage is
//! enforced separately by [`crate::verify_coverage`].

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use csv::ReaderBuilder;
use rust_decimal::Decimal;
use tracing::debug;
use vex_core::{Candle, Interval, Symbol};

use crate::{CandleSource, DataError, DataResult};

/// Read-only candle source over a local CSV data store.
#[derive(Clone, Debug)]
pub struct CsvCandleStore {
    root: PathBuf,
}

impl CsvCandleStore {
    /// Bind the store to a data-store root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn day_file(&self, symbol: &str, day: chrono::NaiveDate) -> PathBuf {
        self.root
            .join(format!("{symbol}_{}", Interval::OneMinute.label()))
            .join(format!("{}.csv", day.format("%Y-%m-%d")))
    }

    fn read_day(&self, symbol: &str, path: &Path) -> DataResult<Vec<Candle>> {
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|err| DataError::Parse {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
        let mut candles = Vec::new();
        for row in reader.records() {
            let record = row.map_err(|err| DataError::Parse {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
            let field = |index: usize, name: &str| -> DataResult<&str> {
                record.get(index).ok_or_else(|| DataError::Parse {
                    path: path.display().to_string(),
                    reason: format!("missing {name} column"),
                })
            };
            let parse_decimal = |index: usize, name: &str| -> DataResult<Decimal> {
                let raw = field(index, name)?;
                Decimal::from_str(raw.trim()).map_err(|err| DataError::Parse {
                    path: path.display().to_string(),
                    reason: format!("invalid {name} '{raw}': {err}"),
                })
            };
            let raw_ts = field(1, "timestamp")?;
            let seconds = i64::from_str(raw_ts.trim()).map_err(|err| DataError::Parse {
                path: path.display().to_string(),
                reason: format!("invalid timestamp '{raw_ts}': {err}"),
            })?;
            let start = Utc
                .timestamp_opt(seconds, 0)
                .single()
                .ok_or_else(|| DataError::Parse {
                    path: path.display().to_string(),
                    reason: format!("timestamp {seconds} out of range"),
                })?;
            let row_symbol = match record.get(0) {
                Some(value) if !value.trim().is_empty() => Symbol::from(value.trim()),
                _ => symbol.to_string(),
            };
            candles.push(Candle {
                symbol: row_symbol,
                interval: Interval::OneMinute,
                start,
                open: parse_decimal(2, "open")?,
                high: parse_decimal(3, "high")?,
                low: parse_decimal(4, "low")?,
                close: parse_decimal(5, "close")?,
                volume: parse_decimal(6, "volume")?,
            });
        }
        Ok(candles)
    }
}

#[async_trait]
impl CandleSource for CsvCandleStore {
    async fn candles(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DataResult<Vec<Candle>> {
        let mut candles = Vec::new();
        let mut day = start.date_naive();
        let last_day = end.date_naive();
        while day <= last_day {
            let path = self.day_file(symbol, day);
            if path.exists() {
                candles.extend(self.read_day(symbol, &path)?);
            } else {
                debug!(path = %path.display(), "no candle file for day");
            }
            day += Duration::days(1);
        }
        candles.retain(|c| c.start >= start && c.start < end);
        candles.sort_by_key(|c| c.start);
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn write_day(root: &Path, day: &str, rows: &[(i64, &str)]) {
        let dir = root.join("BTCUSDT_1m");
        fs::create_dir_all(&dir).unwrap();
        let mut file = fs::File::create(dir.join(format!("{day}.csv"))).unwrap();
        writeln!(file, "symbol,timestamp,open,high,low,close,volume").unwrap();
        for (ts, px) in rows {
            writeln!(file, "BTCUSDT,{ts},{px},{px},{px},{px},1").unwrap();
        }
    }

    #[tokio::test]
    async fn loads_and_filters_day_files() {
        let temp = tempfile::tempdir().unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().timestamp();
        write_day(
            temp.path(),
            "2024-01-01",
            &[(base, "100"), (base + 60, "101"), (base + 120, "102")],
        );
        let store = CsvCandleStore::new(temp.path());
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 0, 3, 0).unwrap();
        let candles = store.candles("BTCUSDT", start, end).await.unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, Decimal::from(101));
    }

    #[tokio::test]
    async fn missing_days_yield_no_rows() {
        let temp = tempfile::tempdir().unwrap();
        let store = CsvCandleStore::new(temp.path());
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = start + Duration::hours(1);
        let candles = store.candles("BTCUSDT", start, end).await.unwrap();
        assert!(candles.is_empty());
    }

    #[tokio::test]
    async fn malformed_rows_are_reported_with_path() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("BTCUSDT_1m");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("2024-01-01.csv"),
            "symbol,timestamp,open,high,low,close,volume\nBTCUSDT,notatime,1,1,1,1,1\n",
        )
        .unwrap();
        let store = CsvCandleStore::new(temp.path());
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let err = store
            .candles("BTCUSDT", start, start + Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Parse { .. }));
    }
}
