//! Fundamental data types shared across the entire workspace.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `BTCUSDT`).
pub type Symbol = String;

/// Identifier assigned to orders by the engine at acceptance, strictly increasing.
pub type OrderId = u64;

/// Errors produced while validating core data.
#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    /// A candle whose prices are internally inconsistent. Fatal to a run.
    #[error("malformed candle for {symbol} at {start}: {reason}")]
    MalformedCandle {
        symbol: Symbol,
        start: DateTime<Utc>,
        reason: String,
    },
    /// Two base assets mapped onto the same symbol.
    #[error("coin mapping is not injective: {coin} and {other} both map to {symbol}")]
    AmbiguousCoin {
        coin: String,
        other: String,
        symbol: Symbol,
    },
}

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Order execution style. A closed set: unknown wire strings are rejected
/// at the API boundary instead of being carried around as free text.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Execute at the next bar according to the configured fill model.
    Market,
    /// Execute at the provided limit price when the bar range touches it.
    Limit,
    /// Protective order that fills at its trigger price.
    TakeProfit,
    /// Protective order that fills at the worse of trigger and bar close.
    StopLoss,
}

impl OrderType {
    /// True for the protective order variants that form OCO pairs.
    #[must_use]
    pub fn is_protective(self) -> bool {
        matches!(self, Self::TakeProfit | Self::StopLoss)
    }

    /// True when the variant requires an explicit price.
    #[must_use]
    pub fn requires_price(self) -> bool {
        !matches!(self, Self::Market)
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "market" => Ok(Self::Market),
            "limit" => Ok(Self::Limit),
            "take_profit" | "takeprofit" | "tp" => Ok(Self::TakeProfit),
            "stop_loss" | "stoploss" | "sl" => Ok(Self::StopLoss),
            other => Err(format!("unsupported order type '{other}'")),
        }
    }
}

/// Order lifecycle state maintained by the engine.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    /// Accepted but dormant (e.g., a protective child waiting on its parent).
    New,
    /// Resting and eligible for matching.
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    /// Terminal states never regress to an earlier state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    #[must_use]
    pub fn may_transition(self, next: Self) -> bool {
        match self {
            Self::New => matches!(
                next,
                Self::Open | Self::Filled | Self::Cancelled | Self::Rejected
            ),
            Self::Open => matches!(next, Self::PartiallyFilled | Self::Filled | Self::Cancelled),
            Self::PartiallyFilled => matches!(next, Self::Filled | Self::Cancelled),
            Self::Filled | Self::Cancelled | Self::Rejected => false,
        }
    }
}

/// Why an order left the book without filling.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit cancel from the caller.
    User,
    /// The sibling of an OCO pair filled first.
    Oco,
    /// The order was superseded by a modify.
    Replaced,
    /// The parent of a protective child was cancelled before filling.
    ParentCancelled,
}

/// Interval granularity for candle aggregates. One minute is the matching
/// primitive; the coarser intervals are derived by resampling.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    OneMinute,
    FifteenMinutes,
    FourHours,
    OneDay,
}

impl Interval {
    /// Convert the interval into a chrono `Duration`.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        match self {
            Self::OneMinute => Duration::minutes(1),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::FourHours => Duration::hours(4),
            Self::OneDay => Duration::days(1),
        }
    }

    /// Short label used in file names and wire payloads.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FifteenMinutes => "15m",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
        }
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "1m" | "1min" | "1minute" => Ok(Self::OneMinute),
            "15m" | "15min" | "15minutes" => Ok(Self::FifteenMinutes),
            "4h" | "240m" | "4hours" => Ok(Self::FourHours),
            "1d" | "day" | "d" => Ok(Self::OneDay),
            other => Err(format!("unsupported interval '{other}'")),
        }
    }
}

/// Aggregated OHLCV bar keyed by symbol, interval and bar-start timestamp.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub interval: Interval,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub start: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Quantity,
}

impl Candle {
    /// The instant the bar closes; reads at the virtual clock compare
    /// against this, never the bar start.
    #[must_use]
    pub fn close_time(&self) -> DateTime<Utc> {
        self.start + self.interval.as_duration()
    }

    /// Reject internally inconsistent bars before they reach the engine.
    pub fn validate(&self) -> Result<(), CoreError> {
        let malformed = |reason: &str| CoreError::MalformedCandle {
            symbol: self.symbol.clone(),
            start: self.start,
            reason: reason.to_string(),
        };
        if self.low > self.high {
            return Err(malformed("low exceeds high"));
        }
        if self.open < self.low || self.open > self.high {
            return Err(malformed("open outside low/high range"));
        }
        if self.close < self.low || self.close > self.high {
            return Err(malformed("close outside low/high range"));
        }
        if self.low <= Decimal::ZERO {
            return Err(malformed("non-positive price"));
        }
        if self.volume < Decimal::ZERO {
            return Err(malformed("negative volume"));
        }
        Ok(())
    }
}

/// Desired order placement parameters.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub size: Quantity,
    pub price: Option<Price>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub post_only: bool,
    /// Links the protective children of an OCO pair to their parent.
    #[serde(default)]
    pub parent_id: Option<OrderId>,
}

/// Order representation maintained by the engine.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub request: OrderRequest,
    pub state: OrderState,
    pub filled_size: Quantity,
    pub avg_fill_price: Option<Price>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub updated_at: DateTime<Utc>,
    pub cancel_reason: Option<CancelReason>,
}

impl Order {
    /// Construct a freshly accepted order in the given state.
    #[must_use]
    pub fn accepted(
        id: OrderId,
        request: OrderRequest,
        state: OrderState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            request,
            state,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            created_at: now,
            updated_at: now,
            cancel_reason: None,
        }
    }

    /// Quantity still outstanding.
    #[must_use]
    pub fn remaining_size(&self) -> Quantity {
        self.request.size - self.filled_size
    }

    /// True while the order is resting and eligible for matching.
    #[must_use]
    pub fn is_matchable(&self) -> bool {
        matches!(self.state, OrderState::Open | OrderState::PartiallyFilled)
    }

    /// Fold a fill into the order, maintaining the volume-weighted average
    /// fill price and the state machine. `filled_size` never exceeds `size`.
    pub fn record_fill(&mut self, price: Price, size: Quantity, now: DateTime<Utc>) {
        let previous = self.filled_size;
        self.filled_size += size;
        let total_cost = self.avg_fill_price.unwrap_or(Decimal::ZERO) * previous + price * size;
        if !self.filled_size.is_zero() {
            self.avg_fill_price = Some(total_cost / self.filled_size);
        }
        self.state = if self.filled_size >= self.request.size {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        self.updated_at = now;
    }
}

/// Where within the bar a fill happened; diagnostic only.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BarKind {
    BarOpen,
    Intrabar,
    BarClose,
}

/// Immutable execution record appended to the wallet's trade log.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Trade {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub size: Quantity,
    pub price: Price,
    pub fee: Price,
    /// Bar close of the candle the fill was matched against.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub bar_kind: BarKind,
}

/// Netted position per symbol. Created on first fill, never deleted; size
/// may return to zero.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Position {
    pub symbol: Symbol,
    /// Signed size: positive = long, negative = short.
    pub size: Quantity,
    pub avg_entry_price: Price,
    pub realized_pnl: Price,
    pub last_price: Price,
}

impl Position {
    /// A flat position primed with a reference price.
    #[must_use]
    pub fn flat(symbol: impl Into<Symbol>, price: Price) -> Self {
        Self {
            symbol: symbol.into(),
            size: Decimal::ZERO,
            avg_entry_price: price,
            realized_pnl: Decimal::ZERO,
            last_price: price,
        }
    }

    /// Apply one fill with netting semantics: VWAP on entries, realised PnL
    /// on exits, sign flip when the fill exceeds the remaining size.
    /// Returns the realised PnL delta of this fill.
    pub fn apply_fill(&mut self, side: Side, size: Quantity, price: Price) -> Price {
        let signed = match side {
            Side::Buy => size,
            Side::Sell => -size,
        };
        let mut realized = Decimal::ZERO;
        let extending = self.size.is_zero()
            || (self.size > Decimal::ZERO) == (signed > Decimal::ZERO);
        if extending {
            let new_size = self.size + signed;
            if !new_size.is_zero() {
                self.avg_entry_price = (self.avg_entry_price * self.size.abs() + price * size)
                    / new_size.abs();
            }
            self.size = new_size;
        } else {
            let closing = size.min(self.size.abs());
            realized = if self.size > Decimal::ZERO {
                (price - self.avg_entry_price) * closing
            } else {
                (self.avg_entry_price - price) * closing
            };
            self.realized_pnl += realized;
            if self.size > Decimal::ZERO {
                self.size -= closing;
            } else {
                self.size += closing;
            }
            let remainder = size - closing;
            if remainder > Decimal::ZERO {
                self.size = if signed > Decimal::ZERO {
                    remainder
                } else {
                    -remainder
                };
                self.avg_entry_price = price;
            }
        }
        self.last_price = price;
        realized
    }

    /// Refresh the mark used for unrealised PnL and equity.
    pub fn mark(&mut self, price: Price) {
        self.last_price = price;
    }

    /// PnL of the open size against the last mark.
    #[must_use]
    pub fn unrealized_pnl(&self) -> Price {
        (self.last_price - self.avg_entry_price) * self.size
    }

    /// Value the open size at the last mark.
    #[must_use]
    pub fn notional(&self) -> Price {
        self.size * self.last_price
    }
}

/// Time-indexed news item served by the read API.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NewsItem {
    pub id: String,
    pub source: String,
    pub title: String,
    /// Importance score assigned by the upstream source; higher is first.
    pub importance: f64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub published_at: DateTime<Utc>,
}

/// Wallet snapshot returned by the read API at the virtual clock.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AccountInfo {
    pub equity: Price,
    pub cash: Price,
    pub total_margin_used: Price,
    pub positions: Vec<Position>,
    pub open_orders: Vec<Order>,
}

/// Injective mapping from base asset ("BTC") to market symbol ("BTCUSDT").
#[derive(Clone, Debug, Default)]
pub struct CoinMap {
    forward: HashMap<String, Symbol>,
}

impl CoinMap {
    /// Build a mapping, rejecting duplicates on either side.
    pub fn new(pairs: impl IntoIterator<Item = (String, Symbol)>) -> Result<Self, CoreError> {
        let mut forward = HashMap::new();
        let mut reverse: HashMap<Symbol, String> = HashMap::new();
        for (coin, symbol) in pairs {
            let coin = coin.to_uppercase();
            let symbol = symbol.to_uppercase();
            if let Some(other) = reverse.get(&symbol) {
                if *other != coin {
                    return Err(CoreError::AmbiguousCoin {
                        coin,
                        other: other.clone(),
                        symbol,
                    });
                }
            }
            reverse.insert(symbol.clone(), coin.clone());
            forward.insert(coin, symbol);
        }
        Ok(Self { forward })
    }

    /// Conventional mapping `coin -> coin + quote` for a set of bases.
    pub fn with_quote<I, S>(coins: I, quote: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let forward = coins
            .into_iter()
            .map(|coin| {
                let coin = coin.as_ref().to_uppercase();
                let symbol = format!("{coin}{}", quote.to_uppercase());
                (coin, symbol)
            })
            .collect();
        Self { forward }
    }

    /// Resolve a base asset into its market symbol.
    #[must_use]
    pub fn symbol_for(&self, coin: &str) -> Option<&Symbol> {
        self.forward.get(&coin.to_uppercase())
    }

    /// Symbols known to this mapping.
    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.forward.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(open: i64, high: i64, low: i64, close: i64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::OneMinute,
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            open: Decimal::from(open),
            high: Decimal::from(high),
            low: Decimal::from(low),
            close: Decimal::from(close),
            volume: Decimal::ONE,
        }
    }

    #[test]
    fn interval_duration_matches_definition() {
        assert_eq!(Interval::OneMinute.as_duration(), Duration::minutes(1));
        assert_eq!(Interval::FourHours.as_duration(), Duration::hours(4));
        assert_eq!("15m".parse::<Interval>(), Ok(Interval::FifteenMinutes));
        assert!("7m".parse::<Interval>().is_err());
    }

    #[test]
    fn unknown_order_type_is_rejected() {
        assert_eq!("limit".parse::<OrderType>(), Ok(OrderType::Limit));
        assert!("trailing_stop".parse::<OrderType>().is_err());
    }

    #[test]
    fn candle_close_time_adds_interval() {
        let c = candle(100, 105, 95, 102);
        assert_eq!(c.close_time(), c.start + Duration::minutes(1));
    }

    #[test]
    fn candle_validate_rejects_inverted_range() {
        let mut c = candle(100, 105, 95, 102);
        assert!(c.validate().is_ok());
        c.low = Decimal::from(106);
        assert!(matches!(
            c.validate(),
            Err(CoreError::MalformedCandle { .. })
        ));
    }

    #[test]
    fn terminal_states_never_regress() {
        assert!(OrderState::Open.may_transition(OrderState::Filled));
        assert!(!OrderState::Filled.may_transition(OrderState::Open));
        assert!(!OrderState::Cancelled.may_transition(OrderState::PartiallyFilled));
    }

    #[test]
    fn record_fill_tracks_vwap_and_state() {
        let request = OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            size: Decimal::from(4),
            price: Some(Decimal::from(100)),
            reduce_only: false,
            post_only: false,
            parent_id: None,
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut order = Order::accepted(1, request, OrderState::Open, now);
        order.record_fill(Decimal::from(100), Decimal::from(1), now);
        assert_eq!(order.state, OrderState::PartiallyFilled);
        order.record_fill(Decimal::from(104), Decimal::from(3), now);
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.avg_fill_price, Some(Decimal::from(103)));
        assert_eq!(order.remaining_size(), Decimal::ZERO);
    }

    #[test]
    fn position_vwap_on_entries() {
        let mut position = Position::flat("BTCUSDT", Decimal::from(100));
        position.apply_fill(Side::Buy, Decimal::from(1), Decimal::from(100));
        position.apply_fill(Side::Buy, Decimal::from(1), Decimal::from(110));
        assert_eq!(position.size, Decimal::from(2));
        assert_eq!(position.avg_entry_price, Decimal::from(105));
        assert_eq!(position.realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn position_realizes_pnl_on_exit() {
        let mut position = Position::flat("BTCUSDT", Decimal::from(100));
        position.apply_fill(Side::Buy, Decimal::from(2), Decimal::from(100));
        let realized = position.apply_fill(Side::Sell, Decimal::from(1), Decimal::from(110));
        assert_eq!(realized, Decimal::from(10));
        assert_eq!(position.size, Decimal::from(1));
        assert_eq!(position.avg_entry_price, Decimal::from(100));
    }

    #[test]
    fn position_flips_sign_when_exit_exceeds_size() {
        let mut position = Position::flat("BTCUSDT", Decimal::from(100));
        position.apply_fill(Side::Buy, Decimal::from(1), Decimal::from(100));
        let realized = position.apply_fill(Side::Sell, Decimal::from(3), Decimal::from(90));
        assert_eq!(realized, Decimal::from(-10));
        assert_eq!(position.size, Decimal::from(-2));
        assert_eq!(position.avg_entry_price, Decimal::from(90));
    }

    #[test]
    fn coin_map_rejects_ambiguity() {
        let ok = CoinMap::new([
            ("BTC".to_string(), "BTCUSDT".to_string()),
            ("ETH".to_string(), "ETHUSDT".to_string()),
        ]);
        assert!(ok.is_ok());
        let bad = CoinMap::new([
            ("BTC".to_string(), "BTCUSDT".to_string()),
            ("XBT".to_string(), "BTCUSDT".to_string()),
        ]);
        assert!(matches!(bad, Err(CoreError::AmbiguousCoin { .. })));
    }

    #[test]
    fn coin_map_resolves_case_insensitively() {
        let map = CoinMap::with_quote(["btc", "eth"], "usdt");
        assert_eq!(map.symbol_for("btc"), Some(&"BTCUSDT".to_string()));
        assert_eq!(map.symbol_for("DOGE"), None);
    }
}
