//! Position tracking types
//!
//! A position is derived state: the fold of every committed trade for one
//! `(exchange, symbol)` pair, applied in commit order.

use crate::errors::LedgerError;
use crate::ids::{ExchangeId, Symbol};
use crate::trade::Trade;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Decimal places kept on the weighted-average entry price.
pub const AVERAGE_PRICE_SCALE: u32 = 12;

/// Key of one aggregation stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub exchange_id: ExchangeId,
    pub symbol: Symbol,
}

impl PositionKey {
    pub fn new(exchange_id: ExchangeId, symbol: Symbol) -> Self {
        Self { exchange_id, symbol }
    }

    pub fn of(trade: &Trade) -> Self {
        Self::new(trade.exchange_id, trade.symbol.clone())
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange_id, self.symbol)
    }
}

/// Running position per (exchange, symbol)
///
/// Invariant: `average_price` is zero iff `quantity` is zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub exchange_id: ExchangeId,
    pub symbol: Symbol,
    /// Signed net quantity: positive long, negative short
    pub quantity: Decimal,
    /// Weighted-average entry price of the open quantity
    pub average_price: Decimal,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub trade_count: u64,
    /// Commit sequence of the last folded trade
    pub last_sequence: u64,
    pub last_timestamp: i64,
}

impl Position {
    /// Create a flat position
    pub fn flat(exchange_id: ExchangeId, symbol: Symbol) -> Self {
        Self {
            exchange_id,
            symbol,
            quantity: Decimal::ZERO,
            average_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            trade_count: 0,
            last_sequence: 0,
            last_timestamp: 0,
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.exchange_id, self.symbol.clone())
    }

    /// Total cost of the open quantity: |quantity| × average price.
    /// `apply` refuses any trade that would make this overflow.
    pub fn cost_basis(&self) -> Decimal {
        self.quantity.abs() * self.average_price
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Unrealized PnL at a given mark price, `None` if it overflows
    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Option<Decimal> {
        mark_price
            .checked_sub(self.average_price)?
            .checked_mul(self.quantity)
    }

    /// Fold one trade into the position.
    ///
    /// - Opening or extending: the average price becomes the
    ///   quantity-weighted average of the old and new exposure.
    /// - Reducing: the average price is kept and the closed part realizes
    ///   `closed × (price − average) × direction`.
    /// - Flipping: the remainder opens at the trade price.
    ///
    /// The caller guarantees the trade belongs to this key and is newer than
    /// `last_sequence`. On overflow the position is left untouched.
    pub fn apply(&mut self, trade: &Trade) -> Result<(), LedgerError> {
        let overflow = || LedgerError::ArithmeticOverflow {
            key: self.key(),
            sequence: trade.sequence,
        };
        let delta = trade.signed_quantity();
        let price = trade.price.as_decimal();
        let current = self.quantity;
        let quantity = current.checked_add(delta).ok_or_else(overflow)?;

        let mut average_price = self.average_price;
        let mut realized_pnl = self.realized_pnl;
        if current.is_zero() || current.is_sign_negative() == delta.is_sign_negative() {
            let open = current.abs();
            let added = delta.abs();
            let weighted = open
                .checked_mul(self.average_price)
                .zip(added.checked_mul(price))
                .and_then(|(held, bought)| held.checked_add(bought))
                .and_then(|notional| notional.checked_div(quantity.abs()))
                .ok_or_else(overflow)?;
            average_price = round_average(weighted);
        } else {
            let closed = current.abs().min(delta.abs());
            let direction = if current.is_sign_positive() {
                Decimal::ONE
            } else {
                Decimal::NEGATIVE_ONE
            };
            realized_pnl = price
                .checked_sub(self.average_price)
                .and_then(|edge| edge.checked_mul(closed))
                .map(|pnl| pnl * direction)
                .and_then(|pnl| realized_pnl.checked_add(pnl))
                .ok_or_else(overflow)?;

            if quantity.is_zero() {
                average_price = Decimal::ZERO;
            } else if quantity.is_sign_negative() != current.is_sign_negative() {
                average_price = round_average(price);
            }
        }
        let fees = self.fees.checked_add(trade.fee).ok_or_else(overflow)?;
        // cost_basis must stay representable
        quantity.abs().checked_mul(average_price).ok_or_else(overflow)?;

        // Keep the representation canonical so replayed and incremental
        // states hash identically.
        self.quantity = quantity.normalize();
        self.average_price = average_price.normalize();
        self.realized_pnl = realized_pnl.normalize();
        self.fees = fees.normalize();
        self.trade_count += 1;
        self.last_sequence = trade.sequence;
        self.last_timestamp = trade.timestamp;
        Ok(())
    }
}

fn round_average(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(AVERAGE_PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{DedupKey, TradeId};
    use crate::numeric::{Price, Quantity};
    use crate::side::Side;

    fn trade(seq: u64, side: Side, qty: &str, price: &str) -> Trade {
        Trade {
            trade_id: TradeId::new(),
            sequence: seq,
            dedup_key: DedupKey::try_new(format!("e-{seq}")).unwrap(),
            exchange_id: ExchangeId::new(1),
            user_id: None,
            symbol: Symbol::new("BTC"),
            side,
            quantity: Quantity::from_str(qty).unwrap(),
            price: Price::from_str(price).unwrap(),
            fee: Decimal::ZERO,
            timestamp: 1_708_123_456_789_000_000 + seq as i64,
            recorded_at: 1_708_123_456_789_000_000 + seq as i64,
        }
    }

    fn flat() -> Position {
        Position::flat(ExchangeId::new(1), Symbol::new("BTC"))
    }

    #[test]
    fn test_buy_then_partial_sell() {
        let mut position = flat();
        position.apply(&trade(1, Side::BUY, "10", "100")).unwrap();
        position.apply(&trade(2, Side::SELL, "4", "110")).unwrap();

        assert_eq!(position.quantity, Decimal::from(6));
        assert_eq!(position.average_price, Decimal::from(100));
        assert_eq!(position.cost_basis(), Decimal::from(600));
        assert_eq!(position.realized_pnl, Decimal::from(40));
        assert_eq!(position.trade_count, 2);
        assert_eq!(position.last_sequence, 2);
    }

    #[test]
    fn test_weighted_average_on_extend() {
        let mut position = flat();
        position.apply(&trade(1, Side::BUY, "10", "100")).unwrap();
        position.apply(&trade(2, Side::BUY, "10", "110")).unwrap();

        assert_eq!(position.quantity, Decimal::from(20));
        assert_eq!(position.average_price, Decimal::from(105));
    }

    #[test]
    fn test_close_to_flat_resets_average() {
        let mut position = flat();
        position.apply(&trade(1, Side::BUY, "2", "100")).unwrap();
        position.apply(&trade(2, Side::SELL, "2", "90")).unwrap();

        assert!(position.is_flat());
        assert_eq!(position.average_price, Decimal::ZERO);
        assert_eq!(position.realized_pnl, Decimal::from(-20));
    }

    #[test]
    fn test_flip_opens_remainder_at_trade_price() {
        let mut position = flat();
        position.apply(&trade(1, Side::BUY, "3", "100")).unwrap();
        position.apply(&trade(2, Side::SELL, "5", "120")).unwrap();

        assert_eq!(position.quantity, Decimal::from(-2));
        assert_eq!(position.average_price, Decimal::from(120));
        assert_eq!(position.realized_pnl, Decimal::from(60));
    }

    #[test]
    fn test_short_covering_realizes_pnl() {
        let mut position = flat();
        position.apply(&trade(1, Side::SELL, "4", "200")).unwrap();
        position.apply(&trade(2, Side::BUY, "1", "150")).unwrap();

        assert_eq!(position.quantity, Decimal::from(-3));
        assert_eq!(position.average_price, Decimal::from(200));
        assert_eq!(position.realized_pnl, Decimal::from(50));
        assert_eq!(position.unrealized_pnl(Decimal::from(190)), Some(Decimal::from(30)));
    }

    #[test]
    fn test_average_rounded_half_up() {
        let mut position = flat();
        position.apply(&trade(1, Side::BUY, "1", "1")).unwrap();
        position.apply(&trade(2, Side::BUY, "2", "2")).unwrap();
        // (1 + 4) / 3 = 1.666...
        assert_eq!(
            position.average_price,
            Decimal::from_str_exact("1.666666666667").unwrap()
        );
    }

    #[test]
    fn test_fees_accumulate() {
        let mut position = flat();
        let mut t1 = trade(1, Side::BUY, "1", "100");
        t1.fee = Decimal::from_str_exact("0.1").unwrap();
        let mut t2 = trade(2, Side::SELL, "1", "100");
        t2.fee = Decimal::from_str_exact("-0.02").unwrap();
        position.apply(&t1).unwrap();
        position.apply(&t2).unwrap();
        assert_eq!(position.fees, Decimal::from_str_exact("0.08").unwrap());
    }

    #[test]
    fn test_overflow_leaves_position_untouched() {
        let mut position = flat();
        position.apply(&trade(1, Side::BUY, "1", "100")).unwrap();
        let before = position.clone();

        let err = position
            .apply(&trade(2, Side::BUY, "1000000000000000", "1000000000000000"))
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::ArithmeticOverflow {
                key: before.key(),
                sequence: 2
            }
        );
        assert_eq!(position, before);
    }

    #[test]
    fn test_unrealized_pnl_overflow_is_none() {
        let mut position = flat();
        position.apply(&trade(1, Side::BUY, "100000000000000", "1")).unwrap();
        assert_eq!(position.unrealized_pnl(Decimal::MAX), None);
    }

    proptest::proptest! {
        #[test]
        fn prop_average_zero_iff_flat(
            fills in proptest::collection::vec((proptest::bool::ANY, 1u64..50, 1u64..500), 1..40),
        ) {
            let mut position = flat();
            for (i, (buy, qty, price)) in fills.into_iter().enumerate() {
                let side = if buy { Side::BUY } else { Side::SELL };
                position.apply(&trade(i as u64 + 1, side, &qty.to_string(), &price.to_string())).unwrap();
                proptest::prop_assert_eq!(position.average_price.is_zero(), position.is_flat());
                proptest::prop_assert!(position.average_price >= Decimal::ZERO);
            }
        }
    }
}
