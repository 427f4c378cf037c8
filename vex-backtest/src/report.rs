//! End-of-run reporting: FIFO trade pairing, portfolio metrics and the
//! reproducibility block.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use vex_core::{Order, OrderId, OrderType, Price, Quantity, Side, Symbol, Trade};
use vex_engine::EngineStats;

/// PnL within this band of zero counts as breakeven and is excluded from
/// the win-rate denominator.
const BREAKEVEN_THRESHOLD: &str = "0.000001";

/// Terminal status of a run.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Direction of a completed round trip.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Long,
    Short,
}

/// One fully paired round trip produced by FIFO lot matching.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CompletedTrade {
    pub symbol: Symbol,
    pub side: TradeSide,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub entry_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub exit_time: DateTime<Utc>,
    pub qty: Quantity,
    pub avg_entry_price: Price,
    pub avg_exit_price: Price,
    pub fees: Price,
    pub slippage: Price,
    pub pnl_before_fees: Price,
    pub pnl: Price,
    pub duration_secs: i64,
    /// PnL divided by the risk implied by the entry's initial stop, when
    /// the entry order carried one.
    pub r_multiple: Option<Decimal>,
    pub initial_sl_price: Option<Price>,
}

/// One point of the equity curve, sampled at decision boundaries.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EquityPoint {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub equity: Price,
}

/// Portfolio-level statistics over the whole run.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PortfolioMetrics {
    pub total_pnl: Price,
    /// Largest peak-to-trough loss as a fraction of the peak.
    pub max_drawdown: Decimal,
    /// Longest stretch of equity samples spent below a running peak.
    pub mdd_duration: u64,
    pub win_rate: f64,
    pub avg_win: Price,
    pub avg_loss: Price,
    pub profit_factor: f64,
    /// Fraction of processed bars with a non-zero position.
    pub exposure: f64,
    /// Total traded notional over starting equity.
    pub turnover: Decimal,
    pub win_count: usize,
    pub loss_count: usize,
    pub breakeven_count: usize,
}

/// Everything needed to reproduce the run byte-for-byte.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Reproducibility {
    /// SHA-256 over the canonicalised candle rows actually consumed.
    pub data_hash: String,
    /// Verbatim serialisation of the run configuration.
    pub strategy_config: String,
    /// Opaque engine revision supplied by the caller.
    pub engine_version: String,
    pub fee_rate: Decimal,
    pub slippage_model: String,
}

/// Placement rejections and strategy failures collected during the run.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Diagnostic {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub context: String,
    pub detail: String,
}

/// The orchestrator's end-of-run product.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Report {
    pub status: RunStatus,
    pub failure_reason: Option<String>,
    pub symbol: Symbol,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub end_time: DateTime<Utc>,
    pub trades: Vec<CompletedTrade>,
    pub fills: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: PortfolioMetrics,
    pub reproducibility: Reproducibility,
    pub diagnostics: Vec<Diagnostic>,
}

struct Lot {
    side: TradeSide,
    qty: Quantity,
    price: Price,
    time: DateTime<Utc>,
    fee_per_unit: Price,
    initial_sl_price: Option<Price>,
}

/// Pair raw fills into completed round trips with FIFO semantics.
///
/// Supports scaling in and out and position flips; a flip closes the whole
/// open side first, then opens the remainder as a fresh lot. `orders` is
/// used to recover the initial stop attached to each entry.
pub struct TradePairer<'a> {
    orders: HashMap<OrderId, &'a Order>,
}

impl<'a> TradePairer<'a> {
    #[must_use]
    pub fn new(orders: &'a [Order]) -> Self {
        Self {
            orders: orders.iter().map(|o| (o.id, o)).collect(),
        }
    }

    /// FIFO-pair the chronological fill stream.
    #[must_use]
    pub fn pair(&self, fills: &[Trade]) -> Vec<CompletedTrade> {
        let mut by_symbol: HashMap<&str, Vec<&Trade>> = HashMap::new();
        for fill in fills {
            by_symbol.entry(fill.symbol.as_str()).or_default().push(fill);
        }
        let mut symbols: Vec<&str> = by_symbol.keys().copied().collect();
        symbols.sort_unstable();

        let mut completed = Vec::new();
        for symbol in symbols {
            let mut lots: VecDeque<Lot> = VecDeque::new();
            for fill in &by_symbol[symbol] {
                self.apply_fill(fill, &mut lots, &mut completed);
            }
        }
        completed.sort_by_key(|t| t.exit_time);
        completed
    }

    fn apply_fill(&self, fill: &Trade, lots: &mut VecDeque<Lot>, completed: &mut Vec<CompletedTrade>) {
        let fill_side = match fill.side {
            Side::Buy => TradeSide::Long,
            Side::Sell => TradeSide::Short,
        };
        let fee_per_unit = if fill.size.is_zero() {
            Decimal::ZERO
        } else {
            fill.fee / fill.size
        };
        let opening = lots.front().map(|lot| lot.side) != Some(opposite(fill_side));
        if opening {
            lots.push_back(Lot {
                side: fill_side,
                qty: fill.size,
                price: fill.price,
                time: fill.timestamp,
                fee_per_unit,
                initial_sl_price: self.initial_stop(fill.order_id),
            });
            return;
        }

        let mut remaining = fill.size;
        let mut closed_qty = Decimal::ZERO;
        let mut entry_cost = Decimal::ZERO;
        let mut entry_fees = Decimal::ZERO;
        let mut entry_time: Option<DateTime<Utc>> = None;
        let mut initial_sl: Option<Price> = None;
        let closed_side = lots.front().map(|lot| lot.side);
        while remaining > Decimal::ZERO {
            let Some(lot) = lots.front_mut() else { break };
            let close = lot.qty.min(remaining);
            entry_cost += lot.price * close;
            entry_fees += lot.fee_per_unit * close;
            entry_time.get_or_insert(lot.time);
            if initial_sl.is_none() {
                initial_sl = lot.initial_sl_price;
            }
            closed_qty += close;
            lot.qty -= close;
            remaining -= close;
            if lot.qty.is_zero() {
                lots.pop_front();
            }
        }

        if closed_qty > Decimal::ZERO {
            let side = closed_side.unwrap_or(opposite(fill_side));
            let avg_entry = entry_cost / closed_qty;
            let pnl_before_fees = match side {
                TradeSide::Long => (fill.price - avg_entry) * closed_qty,
                TradeSide::Short => (avg_entry - fill.price) * closed_qty,
            };
            let fees = entry_fees + fee_per_unit * closed_qty;
            let pnl = pnl_before_fees - fees;
            let entry_time = entry_time.unwrap_or(fill.timestamp);
            let r_multiple = initial_sl.and_then(|sl| {
                let risk = (avg_entry - sl).abs() * closed_qty;
                if risk.is_zero() {
                    None
                } else {
                    Some(pnl / risk)
                }
            });
            completed.push(CompletedTrade {
                symbol: fill.symbol.clone(),
                side,
                entry_time,
                exit_time: fill.timestamp,
                qty: closed_qty,
                avg_entry_price: avg_entry,
                avg_exit_price: fill.price,
                fees,
                // The configured fill models apply no slippage on top of
                // the reference price.
                slippage: Decimal::ZERO,
                pnl_before_fees,
                pnl,
                duration_secs: (fill.timestamp - entry_time).num_seconds(),
                r_multiple,
                initial_sl_price: initial_sl,
            });
        }

        if remaining > Decimal::ZERO {
            // Position flip: the excess opens a fresh lot on the fill side.
            lots.push_back(Lot {
                side: fill_side,
                qty: remaining,
                price: fill.price,
                time: fill.timestamp,
                fee_per_unit,
                initial_sl_price: self.initial_stop(fill.order_id),
            });
        }
    }

    /// The stop-loss price protecting an entry, recovered from the entry
    /// order's protective children.
    fn initial_stop(&self, entry_order_id: OrderId) -> Option<Price> {
        self.orders.values().find_map(|order| {
            (order.request.parent_id == Some(entry_order_id)
                && order.request.order_type == OrderType::StopLoss)
                .then(|| order.request.price)
                .flatten()
        })
    }
}

impl PortfolioMetrics {
    /// Compute portfolio-level metrics from the run artifacts.
    #[must_use]
    pub fn calculate(
        completed: &[CompletedTrade],
        fills: &[Trade],
        equity_curve: &[EquityPoint],
        stats: EngineStats,
        starting_equity: Price,
    ) -> Self {
        let threshold: Decimal = BREAKEVEN_THRESHOLD.parse().expect("static threshold parses");
        let wins: Vec<&CompletedTrade> =
            completed.iter().filter(|t| t.pnl > threshold).collect();
        let losses: Vec<&CompletedTrade> =
            completed.iter().filter(|t| t.pnl < -threshold).collect();
        let breakeven_count = completed.len() - wins.len() - losses.len();

        let decided = wins.len() + losses.len();
        let win_rate = if decided > 0 {
            wins.len() as f64 / decided as f64
        } else {
            0.0
        };
        let avg_win = if wins.is_empty() {
            Decimal::ZERO
        } else {
            wins.iter().map(|t| t.pnl).sum::<Decimal>() / Decimal::from(wins.len())
        };
        let avg_loss = if losses.is_empty() {
            Decimal::ZERO
        } else {
            losses.iter().map(|t| t.pnl).sum::<Decimal>() / Decimal::from(losses.len())
        };
        let total_win: Decimal = wins.iter().map(|t| t.pnl).sum();
        let total_loss: Decimal = losses.iter().map(|t| t.pnl).sum::<Decimal>().abs();
        let profit_factor = if total_loss.is_zero() {
            0.0
        } else {
            use rust_decimal::prelude::ToPrimitive;
            (total_win / total_loss).to_f64().unwrap_or(0.0)
        };

        let (max_drawdown, mdd_duration) = drawdown_stats(equity_curve);
        let exposure = if stats.bars_processed > 0 {
            stats.bars_in_position as f64 / stats.bars_processed as f64
        } else {
            0.0
        };
        let traded_notional: Decimal = fills.iter().map(|f| f.price * f.size).sum();
        let turnover = if starting_equity.is_zero() {
            Decimal::ZERO
        } else {
            traded_notional / starting_equity
        };
        let total_pnl = equity_curve
            .last()
            .map(|p| p.equity - starting_equity)
            .unwrap_or(Decimal::ZERO);

        Self {
            total_pnl,
            max_drawdown,
            mdd_duration,
            win_rate,
            avg_win,
            avg_loss,
            profit_factor,
            exposure,
            turnover,
            win_count: wins.len(),
            loss_count: losses.len(),
            breakeven_count,
        }
    }
}

fn drawdown_stats(equity_curve: &[EquityPoint]) -> (Decimal, u64) {
    let mut peak = match equity_curve.first() {
        Some(point) => point.equity,
        None => return (Decimal::ZERO, 0),
    };
    let mut max_drawdown = Decimal::ZERO;
    let mut peak_index = 0u64;
    let mut longest_below = 0u64;
    for (index, point) in equity_curve.iter().enumerate() {
        let index = index as u64;
        if point.equity > peak {
            peak = point.equity;
            peak_index = index;
        } else {
            longest_below = longest_below.max(index - peak_index);
        }
        if !peak.is_zero() {
            let drawdown = (peak - point.equity) / peak;
            max_drawdown = max_drawdown.max(drawdown);
        }
    }
    (max_drawdown, longest_below)
}

fn opposite(side: TradeSide) -> TradeSide {
    match side {
        TradeSide::Long => TradeSide::Short,
        TradeSide::Short => TradeSide::Long,
    }
}
