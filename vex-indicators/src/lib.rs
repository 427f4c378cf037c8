//! Technical indicators shared by the live data collector and the backtest
//! read path.
//!
//! Both paths call the exact same routines, so indicator values are
//! identical by construction for identical input series. The semantics
//! deliberately mirror the collector's rolling/exponentially-weighted
//! conventions: EMAs are seeded from the first observation and recurse with
//! `alpha = 2 / (span + 1)`; rolling means cover exactly the trailing
//! window; rolling standard deviation uses the sample estimator.

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use vex_core::Candle;

/// Exponential moving average over the full series, last value.
/// Returns `None` until `period` observations are available.
#[must_use]
pub fn ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    Some(ema_series(prices, period).pop()?)
}

/// Simple moving average of the trailing `period` observations.
#[must_use]
pub fn sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let window = &prices[prices.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Relative strength index over the trailing `period` price changes.
///
/// A window with zero average loss saturates at 100; a window with no
/// movement at all has no defined value.
#[must_use]
pub fn rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }
    let deltas: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
    let window = &deltas[deltas.len() - period..];
    let avg_gain = window.iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
    let avg_loss = -window.iter().filter(|d| **d < 0.0).sum::<f64>() / period as f64;
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            return None;
        }
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// MACD line, signal line and histogram.
#[must_use]
pub fn macd(
    prices: &[f64],
    short_period: usize,
    long_period: usize,
    signal_period: usize,
) -> Option<(f64, f64, f64)> {
    if prices.len() < long_period {
        return None;
    }
    let short = ema_series(prices, short_period);
    let long = ema_series(prices, long_period);
    let macd_line: Vec<f64> = short.iter().zip(&long).map(|(s, l)| s - l).collect();
    let signal = ema_series(&macd_line, signal_period);
    let line = *macd_line.last()?;
    let signal = *signal.last()?;
    Some((line, signal, line - signal))
}

/// Bollinger bands `(upper, middle, lower)` over the trailing window.
#[must_use]
pub fn bollinger_bands(prices: &[f64], period: usize, num_std: f64) -> Option<(f64, f64, f64)> {
    if period < 2 || prices.len() < period {
        return None;
    }
    let window = &prices[prices.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    let variance = window
        .iter()
        .map(|p| (p - middle).powi(2))
        .sum::<f64>()
        / (period - 1) as f64;
    let std = variance.sqrt();
    Some((middle + num_std * std, middle, middle - num_std * std))
}

/// Average true range over the trailing `period` true ranges.
#[must_use]
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    let n = highs.len();
    if period == 0 || n < period + 1 || lows.len() != n || closes.len() != n {
        return None;
    }
    let mut true_ranges = Vec::with_capacity(n - 1);
    for i in 1..n {
        let tr = (highs[i] - lows[i])
            .max((highs[i] - closes[i - 1]).abs())
            .max((lows[i] - closes[i - 1]).abs());
        true_ranges.push(tr);
    }
    let window = &true_ranges[true_ranges.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for value in values {
        let next = match prev {
            None => *value,
            Some(prev) => (1.0 - alpha) * prev + alpha * value,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

/// The per-interval indicator block served by the read API.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub ema_9: Option<f64>,
    pub sma_14: Option<f64>,
    pub rsi: Option<f64>,
    pub macd_line: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_hist: Option<f64>,
    pub bollinger_upper: Option<f64>,
    pub bollinger_middle: Option<f64>,
    pub bollinger_lower: Option<f64>,
    pub atr: Option<f64>,
}

impl IndicatorSnapshot {
    /// Compute the standard bundle from a chronologically sorted series.
    #[must_use]
    pub fn from_candles(candles: &[Candle]) -> Self {
        let closes: Vec<f64> = candles.iter().filter_map(|c| c.close.to_f64()).collect();
        let highs: Vec<f64> = candles.iter().filter_map(|c| c.high.to_f64()).collect();
        let lows: Vec<f64> = candles.iter().filter_map(|c| c.low.to_f64()).collect();
        let (macd_line, macd_signal, macd_hist) = match macd(&closes, 12, 26, 9) {
            Some((line, signal, hist)) => (Some(line), Some(signal), Some(hist)),
            None => (None, None, None),
        };
        let (bollinger_upper, bollinger_middle, bollinger_lower) =
            match bollinger_bands(&closes, 20, 2.0) {
                Some((upper, middle, lower)) => (Some(upper), Some(middle), Some(lower)),
                None => (None, None, None),
            };
        Self {
            ema_9: ema(&closes, 9),
            sma_14: sma(&closes, 14),
            rsi: rsi(&closes, 14),
            macd_line,
            macd_signal,
            macd_hist,
            bollinger_upper,
            bollinger_middle,
            bollinger_lower,
            atr: atr(&highs, &lows, &closes, 14),
        }
    }
}
