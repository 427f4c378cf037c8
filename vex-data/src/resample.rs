//! Resamples one-minute candles into the coarser read-side intervals.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem;

use chrono::DateTime;
use chrono::Utc;
use vex_core::{Candle, Interval, Symbol};

use crate::align_down;

/// Streaming resampler targeting a single coarser [`Interval`].
///
/// Bucket convention: `open` is the first bar's open, `high`/`low` the
/// extremes, `close` the last bar's close, `volume` the sum.
pub struct Resampler {
    interval: Interval,
    active: HashMap<Symbol, Bucket>,
    output: Vec<Candle>,
}

impl Resampler {
    /// Create a new resampler targeting the provided [`Interval`].
    #[must_use]
    pub fn new(interval: Interval) -> Self {
        Self {
            interval,
            active: HashMap::new(),
            output: Vec::new(),
        }
    }

    /// Ingest one candle. Completed buckets move to the output buffer.
    pub fn push(&mut self, candle: &Candle) {
        let bucket_start = align_down(candle.start, self.interval);
        match self.active.entry(candle.symbol.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(Bucket::seed(bucket_start, candle));
            }
            Entry::Occupied(mut slot) => {
                let bucket = slot.get_mut();
                if bucket_start == bucket.start {
                    bucket.update(candle);
                } else {
                    let finished =
                        mem::replace(bucket, Bucket::seed(bucket_start, candle));
                    self.output
                        .push(finished.into_candle(slot.key().clone(), self.interval));
                }
            }
        }
    }

    /// Finalize open buckets and return all resampled candles sorted by
    /// bar start, then symbol.
    #[must_use]
    pub fn finish(mut self) -> Vec<Candle> {
        for (symbol, bucket) in self.active.drain() {
            self.output.push(bucket.into_candle(symbol, self.interval));
        }
        self.output
            .sort_by(|a, b| (a.start, &a.symbol).cmp(&(b.start, &b.symbol)));
        self.output
    }
}

/// Convenience helper resampling a chronologically sorted slice.
#[must_use]
pub fn resample(candles: &[Candle], interval: Interval) -> Vec<Candle> {
    let mut resampler = Resampler::new(interval);
    for candle in candles {
        resampler.push(candle);
    }
    resampler.finish()
}

struct Bucket {
    start: DateTime<Utc>,
    open: vex_core::Price,
    high: vex_core::Price,
    low: vex_core::Price,
    close: vex_core::Price,
    volume: vex_core::Quantity,
}

impl Bucket {
    fn seed(start: DateTime<Utc>, candle: &Candle) -> Self {
        Self {
            start,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        }
    }

    fn update(&mut self, candle: &Candle) {
        self.high = self.high.max(candle.high);
        self.low = self.low.min(candle.low);
        self.close = candle.close;
        self.volume += candle.volume;
    }

    fn into_candle(self, symbol: Symbol, interval: Interval) -> Candle {
        Candle {
            symbol,
            interval,
            start: self.start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}
