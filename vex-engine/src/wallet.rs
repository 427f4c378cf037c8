//! Single-ledger virtual wallet.
//!
//! Reservation policy is immediate: placing an order debits the cash
//! balance (or earmarks position quantity for reduce-only orders) and a
//! cancel refunds exactly the outstanding reservation. There is no separate
//! frozen-funds bucket; reserved cash leaves the balance entirely and is
//! reported back through `total_margin_used`.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vex_core::{Order, OrderId, Position, Price, Quantity, Side, Symbol, Trade};

use crate::{EngineError, EngineResult};

/// Funds or quantity earmarked for one resting order.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Reservation {
    /// Cash debited for a buy: `unit_cost` per unit still outstanding.
    Cash {
        unit_cost: Price,
        remaining: Quantity,
    },
    /// Position quantity earmarked by a reduce-only order.
    PositionQty { symbol: Symbol, remaining: Quantity },
}

impl Reservation {
    fn outstanding_cash(&self) -> Price {
        match self {
            Self::Cash {
                unit_cost,
                remaining,
            } => *unit_cost * *remaining,
            Self::PositionQty { .. } => Decimal::ZERO,
        }
    }
}

/// Balances, positions and the append-only trade log for one run.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Wallet {
    cash: Price,
    positions: HashMap<Symbol, Position>,
    trades: Vec<Trade>,
    reservations: HashMap<OrderId, Reservation>,
}

impl Wallet {
    /// Start a wallet with the given quote-currency balance.
    #[must_use]
    pub fn new(initial_balance: Price) -> Self {
        Self {
            cash: initial_balance,
            positions: HashMap::new(),
            trades: Vec::new(),
            reservations: HashMap::new(),
        }
    }

    /// Available cash (reservations already removed).
    #[must_use]
    pub fn cash(&self) -> Price {
        self.cash
    }

    /// Sum of outstanding cash reservations across open orders.
    #[must_use]
    pub fn total_margin_used(&self) -> Price {
        self.reservations
            .values()
            .map(Reservation::outstanding_cash)
            .sum()
    }

    /// Cash plus reserved margin plus open positions at their last mark.
    ///
    /// `place` immediately followed by `cancel` leaves this unchanged.
    #[must_use]
    pub fn equity(&self) -> Price {
        self.cash
            + self.total_margin_used()
            + self
                .positions
                .values()
                .map(Position::notional)
                .sum::<Price>()
    }

    #[must_use]
    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<_> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Signed size of the symbol's position, zero when flat.
    #[must_use]
    pub fn position_size(&self, symbol: &str) -> Quantity {
        self.positions
            .get(symbol)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO)
    }

    #[must_use]
    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    /// Refresh the mark price used for equity accounting.
    pub fn mark_price(&mut self, symbol: &str, price: Price) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.mark(price);
        }
    }

    fn reduce_only_headroom(&self, symbol: &str) -> Quantity {
        let earmarked: Quantity = self
            .reservations
            .values()
            .filter_map(|r| match r {
                Reservation::PositionQty {
                    symbol: s,
                    remaining,
                } if s == symbol => Some(*remaining),
                _ => None,
            })
            .sum();
        self.position_size(symbol).abs() - earmarked
    }

    /// Debit the reservation for a freshly validated order.
    ///
    /// `mark` prices market buys, which carry no limit price of their own.
    pub fn reserve(&mut self, order: &Order, mark: Price, fee_rate: Decimal) -> EngineResult<()> {
        let request = &order.request;
        if request.reduce_only {
            let position = self.position_size(&request.symbol);
            let compatible = match request.side {
                Side::Sell => position > Decimal::ZERO,
                Side::Buy => position < Decimal::ZERO,
            };
            if !compatible {
                return Err(EngineError::InvalidOrder(format!(
                    "reduce-only {:?} incompatible with position {position} in {}",
                    request.side, request.symbol
                )));
            }
            if request.size > self.reduce_only_headroom(&request.symbol) {
                return Err(EngineError::InvalidOrder(format!(
                    "reduce-only size {} exceeds unreserved position in {}",
                    request.size, request.symbol
                )));
            }
            self.reservations.insert(
                order.id,
                Reservation::PositionQty {
                    symbol: request.symbol.clone(),
                    remaining: request.size,
                },
            );
            return Ok(());
        }
        match request.side {
            Side::Buy => {
                let basis = request.price.unwrap_or(mark);
                let unit_cost = basis * (Decimal::ONE + fee_rate);
                let amount = unit_cost * request.size;
                if amount > self.cash {
                    return Err(EngineError::InsufficientFunds {
                        required: amount,
                        available: self.cash,
                    });
                }
                self.cash -= amount;
                self.reservations.insert(
                    order.id,
                    Reservation::Cash {
                        unit_cost,
                        remaining: request.size,
                    },
                );
                debug!(order_id = order.id, %amount, cash = %self.cash, "reserved cash");
            }
            // Plain sells open or extend a short and reserve nothing.
            Side::Sell => {}
        }
        Ok(())
    }

    /// Refund whatever is still reserved for the order.
    pub fn release(&mut self, order_id: OrderId) {
        if let Some(reservation) = self.reservations.remove(&order_id) {
            let refund = reservation.outstanding_cash();
            if !refund.is_zero() {
                self.cash += refund;
                debug!(order_id, %refund, cash = %self.cash, "released reservation");
            }
        }
    }

    /// Settle one fill: convert reservation into cash movement, update the
    /// position with netting semantics and append the trade record.
    pub fn apply_fill(&mut self, trade: Trade) -> EngineResult<()> {
        if trade.size <= Decimal::ZERO {
            return Err(EngineError::Invariant(format!(
                "fill size {} for order {} is not positive",
                trade.size, trade.order_id
            )));
        }
        match self.reservations.get_mut(&trade.order_id) {
            Some(Reservation::Cash {
                unit_cost,
                remaining,
            }) => {
                let released = *unit_cost * trade.size;
                *remaining -= trade.size;
                let done = *remaining <= Decimal::ZERO;
                self.cash += released;
                if done {
                    self.reservations.remove(&trade.order_id);
                }
            }
            Some(Reservation::PositionQty { remaining, .. }) => {
                *remaining -= trade.size;
                if *remaining <= Decimal::ZERO {
                    self.reservations.remove(&trade.order_id);
                }
            }
            None => {}
        }
        match trade.side {
            Side::Buy => self.cash -= trade.price * trade.size + trade.fee,
            Side::Sell => self.cash += trade.price * trade.size - trade.fee,
        }
        let position = self
            .positions
            .entry(trade.symbol.clone())
            .or_insert_with(|| Position::flat(trade.symbol.clone(), trade.price));
        position.apply_fill(trade.side, trade.size, trade.price);
        self.trades.push(trade);
        Ok(())
    }

    pub(crate) fn snapshot_parts(
        &self,
    ) -> (
        Price,
        Vec<Position>,
        Vec<Trade>,
        Vec<(OrderId, Reservation)>,
    ) {
        let mut reservations: Vec<_> = self
            .reservations
            .iter()
            .map(|(id, r)| (*id, r.clone()))
            .collect();
        reservations.sort_by_key(|(id, _)| *id);
        (
            self.cash,
            self.positions(),
            self.trades.clone(),
            reservations,
        )
    }

    pub(crate) fn restore_parts(
        cash: Price,
        positions: Vec<Position>,
        trades: Vec<Trade>,
        reservations: Vec<(OrderId, Reservation)>,
    ) -> Self {
        Self {
            cash,
            positions: positions
                .into_iter()
                .map(|p| (p.symbol.clone(), p))
                .collect(),
            trades,
            reservations: reservations.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use vex_core::{BarKind, OrderRequest, OrderState, OrderType};

    fn order(id: OrderId, side: Side, order_type: OrderType, size: i64, price: Option<i64>) -> Order {
        let request = OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side,
            order_type,
            size: Decimal::from(size),
            price: price.map(Decimal::from),
            reduce_only: false,
            post_only: false,
            parent_id: None,
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Order::accepted(id, request, OrderState::Open, now)
    }

    fn trade(order_id: OrderId, side: Side, size: i64, price: i64, fee: &str) -> Trade {
        Trade {
            order_id,
            symbol: "BTCUSDT".to_string(),
            side,
            size: Decimal::from(size),
            price: Decimal::from(price),
            fee: fee.parse().unwrap(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap(),
            bar_kind: BarKind::BarOpen,
        }
    }

    #[test]
    fn place_then_cancel_restores_the_wallet_exactly() {
        let mut wallet = Wallet::new(Decimal::from(10_000));
        let buy = order(1, Side::Buy, OrderType::Limit, 2, Some(100));
        wallet
            .reserve(&buy, Decimal::from(100), Decimal::ZERO)
            .unwrap();
        assert_eq!(wallet.cash(), Decimal::from(9_800));
        assert_eq!(wallet.total_margin_used(), Decimal::from(200));
        assert_eq!(wallet.equity(), Decimal::from(10_000));
        wallet.release(1);
        assert_eq!(wallet.cash(), Decimal::from(10_000));
        assert_eq!(wallet.total_margin_used(), Decimal::ZERO);
        assert_eq!(wallet.equity(), Decimal::from(10_000));
    }

    #[test]
    fn reservation_includes_fee_headroom() {
        let mut wallet = Wallet::new(Decimal::from(100));
        let buy = order(1, Side::Buy, OrderType::Limit, 1, Some(100));
        let fee_rate: Decimal = "0.01".parse().unwrap();
        let err = wallet
            .reserve(&buy, Decimal::from(100), fee_rate)
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
    }

    #[test]
    fn buy_fill_settles_reservation_into_position() {
        let mut wallet = Wallet::new(Decimal::from(10_000));
        let buy = order(1, Side::Buy, OrderType::Limit, 1, Some(100));
        wallet
            .reserve(&buy, Decimal::from(100), Decimal::ZERO)
            .unwrap();
        wallet.apply_fill(trade(1, Side::Buy, 1, 100, "0")).unwrap();
        assert_eq!(wallet.cash(), Decimal::from(9_900));
        assert_eq!(wallet.total_margin_used(), Decimal::ZERO);
        assert_eq!(wallet.position_size("BTCUSDT"), Decimal::ONE);
        assert_eq!(wallet.equity(), Decimal::from(10_000));
    }

    #[test]
    fn sell_fill_credits_cash_and_realizes_pnl() {
        let mut wallet = Wallet::new(Decimal::from(10_000));
        let buy = order(1, Side::Buy, OrderType::Limit, 1, Some(100));
        wallet
            .reserve(&buy, Decimal::from(100), Decimal::ZERO)
            .unwrap();
        wallet.apply_fill(trade(1, Side::Buy, 1, 100, "0")).unwrap();
        wallet
            .apply_fill(trade(2, Side::Sell, 1, 110, "0"))
            .unwrap();
        assert_eq!(wallet.cash(), Decimal::from(10_010));
        assert_eq!(wallet.position_size("BTCUSDT"), Decimal::ZERO);
        let position = wallet.position("BTCUSDT").unwrap();
        assert_eq!(position.realized_pnl, Decimal::from(10));
    }

    #[test]
    fn reduce_only_requires_a_compatible_position() {
        let mut wallet = Wallet::new(Decimal::from(10_000));
        let mut sell = order(1, Side::Sell, OrderType::Limit, 1, Some(100));
        sell.request.reduce_only = true;
        let err = wallet
            .reserve(&sell, Decimal::from(100), Decimal::ZERO)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOrder(_)));
    }

    #[test]
    fn reduce_only_headroom_accounts_for_existing_reservations() {
        let mut wallet = Wallet::new(Decimal::from(10_000));
        let buy = order(1, Side::Buy, OrderType::Limit, 2, Some(100));
        wallet
            .reserve(&buy, Decimal::from(100), Decimal::ZERO)
            .unwrap();
        wallet.apply_fill(trade(1, Side::Buy, 2, 100, "0")).unwrap();

        let mut first = order(2, Side::Sell, OrderType::TakeProfit, 2, Some(110));
        first.request.reduce_only = true;
        wallet
            .reserve(&first, Decimal::from(100), Decimal::ZERO)
            .unwrap();

        let mut second = order(3, Side::Sell, OrderType::StopLoss, 1, Some(90));
        second.request.reduce_only = true;
        let err = wallet
            .reserve(&second, Decimal::from(100), Decimal::ZERO)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOrder(_)));
    }

    #[test]
    fn fees_reduce_cash_on_both_sides() {
        let mut wallet = Wallet::new(Decimal::from(10_000));
        let buy = order(1, Side::Buy, OrderType::Limit, 1, Some(100));
        let fee_rate: Decimal = "0.001".parse().unwrap();
        wallet.reserve(&buy, Decimal::from(100), fee_rate).unwrap();
        wallet
            .apply_fill(trade(1, Side::Buy, 1, 100, "0.1"))
            .unwrap();
        wallet
            .apply_fill(trade(2, Side::Sell, 1, 100, "0.1"))
            .unwrap();
        assert_eq!(wallet.cash(), "9999.8".parse::<Decimal>().unwrap());
    }
}
