//! Canonical hashing of the candle rows a run actually consumed.

use sha2::{Digest, Sha256};
use vex_core::Candle;

/// Number of decimal places a row is normalised to before hashing.
const ROW_PRECISION: u32 = 8;

/// Incremental SHA-256 digest over canonicalised candle rows.
///
/// Rows must be fed in the chronological order the engine consumed them;
/// two runs that consume the same rows in the same order produce the same
/// hex digest.
#[derive(Clone)]
pub struct DatasetDigest {
    hasher: Sha256,
    rows: u64,
}

impl Default for DatasetDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetDigest {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            rows: 0,
        }
    }

    /// Canonical form: `symbol|close_ts|open|high|low|close|volume` with
    /// fixed decimal precision.
    pub fn push(&mut self, candle: &Candle) {
        let row = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            candle.symbol,
            candle.close_time().timestamp(),
            canonical(candle.open),
            canonical(candle.high),
            canonical(candle.low),
            canonical(candle.close),
            canonical(candle.volume),
        );
        self.hasher.update(row.as_bytes());
        self.hasher.update(b"\n");
        self.rows += 1;
    }

    /// Rows consumed so far.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Hex-encoded digest over everything pushed so far.
    #[must_use]
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

fn canonical(value: rust_decimal::Decimal) -> String {
    format!("{:.prec$}", value, prec = ROW_PRECISION as usize)
}
