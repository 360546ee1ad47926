//! Ledger Aggregator
//!
//! Folds committed trades into per-(exchange, symbol) positions. The view
//! is a pure function of the committed trade sequence: replaying from
//! scratch and folding incrementally produce byte-identical state, which
//! `state_hash` makes checkable.
//!
//! A stream that cannot fold a trade halts. The fault is kept in the view
//! and every later trade for the key is refused, so a gap in a position is
//! always visible.

use crate::validator::ExchangeLookup;
use persistence::snapshot::{LedgerState, StreamFault};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{error, trace, warn};
use types::errors::LedgerError;
use types::ids::{ExchangeId, Symbol};
use types::position::{Position, PositionKey};
use types::trade::Trade;

/// Result of applying one trade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Folded,
    /// The position already reflects this sequence
    AlreadyApplied,
}

/// Counters from folding a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    pub folded: u64,
    pub already_applied: u64,
    /// Trades refused by a halted or newly halted stream
    pub faulted: u64,
}

impl FoldStats {
    pub fn merge(&mut self, other: FoldStats) {
        self.folded += other.folded;
        self.already_applied += other.already_applied;
        self.faulted += other.faulted;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionView {
    state: LedgerState,
}

impl PositionView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: LedgerState) -> Self {
        Self { state }
    }

    /// Rebuild the view from scratch.
    ///
    /// Trades are folded in commit order whatever order they arrive in.
    /// Stream faults are recorded in the returned view; only an input with
    /// repeated sequences fails the replay.
    pub fn replay<L>(trades: &[Trade], exchanges: &L) -> Result<PositionView, LedgerError>
    where
        L: ExchangeLookup + ?Sized,
    {
        let mut ordered: Vec<&Trade> = trades.iter().collect();
        ordered.sort_by_key(|t| t.sequence);

        let mut view = PositionView::new();
        view.fold_refs(ordered, exchanges)?;
        Ok(view)
    }

    /// Fold one trade.
    pub fn apply<L>(&mut self, trade: &Trade, exchanges: &L) -> Result<Applied, LedgerError>
    where
        L: ExchangeLookup + ?Sized,
    {
        let key = PositionKey::of(trade);

        if let Some(position) = self.state.positions.get(&key) {
            if trade.sequence <= position.last_sequence {
                trace!(key = %key, sequence = trade.sequence, "Already applied");
                return Ok(Applied::AlreadyApplied);
            }
        }

        if let Some(fault) = self.state.faults.get_mut(&key) {
            if trade.sequence > self.state.commit_marker {
                fault.blocked += 1;
                self.state.commit_marker = trade.sequence;
            }
            warn!(
                key = %key,
                sequence = trade.sequence,
                halted_at = fault.sequence,
                "Trade refused by halted stream"
            );
            return Err(LedgerError::StreamHalted {
                key,
                reason: fault.reason.clone(),
            });
        }

        if trade.sequence <= self.state.commit_marker {
            let last = self.state.commit_marker;
            self.halt(&key, trade, format!("sequence regression: {} after {}", trade.sequence, last));
            return Err(LedgerError::SequenceRegression {
                key,
                last,
                got: trade.sequence,
            });
        }

        if exchanges.find_exchange(trade.exchange_id).is_none() {
            self.halt(&key, trade, format!("unknown exchange {}", trade.exchange_id));
            self.state.commit_marker = trade.sequence;
            return Err(LedgerError::UnknownExchange {
                exchange_id: trade.exchange_id,
                sequence: trade.sequence,
            });
        }

        let position = self
            .state
            .positions
            .entry(key.clone())
            .or_insert_with(|| Position::flat(trade.exchange_id, trade.symbol.clone()));
        if let Err(e) = position.apply(trade) {
            if position.trade_count == 0 {
                self.state.positions.remove(&key);
            }
            self.halt(&key, trade, e.to_string());
            self.state.commit_marker = trade.sequence;
            return Err(e);
        }
        self.state.commit_marker = trade.sequence;
        Ok(Applied::Folded)
    }

    /// Fold trades that are already in commit order.
    ///
    /// Halted-stream refusals are counted and recorded; a sequence
    /// regression aborts the batch.
    pub fn fold_all<L>(&mut self, trades: &[Trade], exchanges: &L) -> Result<FoldStats, LedgerError>
    where
        L: ExchangeLookup + ?Sized,
    {
        self.fold_refs(trades.iter(), exchanges)
    }

    fn fold_refs<'a, L>(
        &mut self,
        trades: impl IntoIterator<Item = &'a Trade>,
        exchanges: &L,
    ) -> Result<FoldStats, LedgerError>
    where
        L: ExchangeLookup + ?Sized,
    {
        let mut stats = FoldStats::default();
        for trade in trades {
            match self.apply(trade, exchanges) {
                Ok(Applied::Folded) => stats.folded += 1,
                Ok(Applied::AlreadyApplied) => stats.already_applied += 1,
                Err(e @ LedgerError::SequenceRegression { .. }) => return Err(e),
                Err(_) => stats.faulted += 1,
            }
        }
        Ok(stats)
    }

    fn halt(&mut self, key: &PositionKey, trade: &Trade, reason: String) {
        error!(
            key = %key,
            sequence = trade.sequence,
            exchange_id = %trade.exchange_id,
            reason = %reason,
            "Position stream halted"
        );
        self.state.faults.insert(
            key.clone(),
            StreamFault {
                sequence: trade.sequence,
                exchange_id: trade.exchange_id,
                reason,
                blocked: 0,
            },
        );
    }

    // ── Partitioning ────────────────────────────────────────────────

    /// Move one key's position and fault into a view of its own, carrying
    /// the current commit marker. Fold it independently, then `absorb` it.
    pub fn split_off(&mut self, key: &PositionKey) -> PositionView {
        let mut part = LedgerState {
            commit_marker: self.state.commit_marker,
            ..LedgerState::default()
        };
        if let Some(position) = self.state.positions.remove(key) {
            part.positions.insert(key.clone(), position);
        }
        if let Some(fault) = self.state.faults.remove(key) {
            part.faults.insert(key.clone(), fault);
        }
        PositionView { state: part }
    }

    /// Merge a folded partition back in.
    pub fn absorb(&mut self, part: PositionView) {
        let LedgerState {
            positions,
            commit_marker,
            faults,
        } = part.state;
        self.state.positions.extend(positions);
        self.state.faults.extend(faults);
        self.advance_marker(commit_marker);
    }

    /// Record that every trade up to `sequence` has been consumed.
    pub fn advance_marker(&mut self, sequence: u64) {
        self.state.commit_marker = self.state.commit_marker.max(sequence);
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn position(&self, exchange_id: ExchangeId, symbol: &Symbol) -> Option<&Position> {
        self.state
            .positions
            .get(&PositionKey::new(exchange_id, symbol.clone()))
    }

    /// All positions ordered by (exchange, symbol)
    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.state.positions.values()
    }

    pub fn positions_for_symbol(&self, symbol: &Symbol) -> Vec<&Position> {
        self.positions().filter(|p| &p.symbol == symbol).collect()
    }

    /// Net quantity of `symbol` across every exchange, `None` on overflow.
    pub fn net_quantity(&self, symbol: &Symbol) -> Option<Decimal> {
        self.positions_for_symbol(symbol)
            .into_iter()
            .try_fold(Decimal::ZERO, |net, p| net.checked_add(p.quantity))
            .map(|net| net.normalize())
    }

    pub fn faults(&self) -> &BTreeMap<PositionKey, StreamFault> {
        &self.state.faults
    }

    pub fn is_halted(&self, key: &PositionKey) -> bool {
        self.state.faults.contains_key(key)
    }

    pub fn commit_marker(&self) -> u64 {
        self.state.commit_marker
    }

    pub fn len(&self) -> usize {
        self.state.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.positions.is_empty()
    }

    /// SHA-256 over the canonical encoding of positions, faults and marker.
    pub fn state_hash(&self) -> String {
        self.state.compute_hash()
    }

    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    pub fn into_state(self) -> LedgerState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::ExchangeRegistry;
    use types::exchange::Exchange;
    use types::ids::{DedupKey, TradeId};
    use types::numeric::{Price, Quantity};
    use types::side::Side;

    fn registry() -> ExchangeRegistry {
        ExchangeRegistry::from_exchanges((1..=2).map(|id| Exchange {
            id: ExchangeId::new(id),
            name: format!("venue-{id}"),
            credential_ref: None,
            active: true,
            created_at: 0,
        }))
    }

    fn trade(seq: u64, exchange: i64, symbol: &str, side: Side, qty: &str, price: &str) -> Trade {
        Trade {
            trade_id: TradeId::new(),
            sequence: seq,
            dedup_key: DedupKey::try_new(format!("fill-{seq}")).unwrap(),
            exchange_id: ExchangeId::new(exchange),
            user_id: None,
            symbol: Symbol::new(symbol),
            side,
            quantity: Quantity::from_str(qty).unwrap(),
            price: Price::from_str(price).unwrap(),
            fee: Decimal::ZERO,
            timestamp: 1_700_000_000_000_000_000 + seq as i64,
            recorded_at: 1_700_000_000_000_000_000 + seq as i64,
        }
    }

    fn btc() -> Symbol {
        Symbol::new("BTC")
    }

    #[test]
    fn test_buy_then_sell_fold() {
        let mut view = PositionView::new();
        let reg = registry();
        view.apply(&trade(1, 1, "BTC", Side::BUY, "10", "100"), &reg).unwrap();
        view.apply(&trade(2, 1, "BTC", Side::SELL, "4", "110"), &reg).unwrap();

        let p = view.position(ExchangeId::new(1), &btc()).unwrap();
        assert_eq!(p.quantity, Decimal::from(6));
        assert_eq!(p.average_price, Decimal::from(100));
        assert_eq!(p.cost_basis(), Decimal::from(600));
        assert_eq!(p.realized_pnl, Decimal::from(40));
        assert_eq!(view.commit_marker(), 2);
    }

    #[test]
    fn test_reapply_is_skipped() {
        let mut view = PositionView::new();
        let reg = registry();
        let t = trade(1, 1, "BTC", Side::BUY, "10", "100");
        assert_eq!(view.apply(&t, &reg).unwrap(), Applied::Folded);
        let hash = view.state_hash();
        assert_eq!(view.apply(&t, &reg).unwrap(), Applied::AlreadyApplied);
        assert_eq!(view.state_hash(), hash);
    }

    #[test]
    fn test_unknown_exchange_halts_stream() {
        let mut view = PositionView::new();
        let reg = registry();

        let err = view
            .apply(&trade(1, 9, "BTC", Side::BUY, "1", "100"), &reg)
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::UnknownExchange {
                exchange_id: ExchangeId::new(9),
                sequence: 1
            }
        );

        let key = PositionKey::new(ExchangeId::new(9), btc());
        assert!(view.is_halted(&key));
        assert_eq!(view.commit_marker(), 1);

        let err = view
            .apply(&trade(2, 9, "BTC", Side::BUY, "1", "100"), &reg)
            .unwrap_err();
        assert!(matches!(err, LedgerError::StreamHalted { .. }));
        assert_eq!(view.faults()[&key].blocked, 1);
        assert!(view.position(ExchangeId::new(9), &btc()).is_none());
    }

    #[test]
    fn test_halt_does_not_block_other_keys() {
        let mut view = PositionView::new();
        let reg = registry();
        let _ = view.apply(&trade(1, 9, "BTC", Side::BUY, "1", "100"), &reg);
        assert_eq!(
            view.apply(&trade(2, 1, "BTC", Side::BUY, "1", "100"), &reg).unwrap(),
            Applied::Folded
        );
    }

    #[test]
    fn test_overflow_halts_only_its_stream() {
        let mut view = PositionView::new();
        let reg = registry();
        view.apply(&trade(1, 1, "BTC", Side::BUY, "2", "100"), &reg).unwrap();

        let huge = trade(2, 1, "BTC", Side::BUY, "1000000000000000", "1000000000000000");
        let err = view.apply(&huge, &reg).unwrap_err();
        let key = PositionKey::new(ExchangeId::new(1), btc());
        assert_eq!(
            err,
            LedgerError::ArithmeticOverflow {
                key: key.clone(),
                sequence: 2
            }
        );
        assert!(view.is_halted(&key));
        assert_eq!(view.commit_marker(), 2);
        assert_eq!(view.position(ExchangeId::new(1), &btc()).unwrap().quantity, Decimal::from(2));

        // A fresh key that overflows on its first trade leaves no position behind
        let fresh = trade(3, 2, "ETH", Side::SELL, "1000000000000000", "1000000000000000");
        assert!(view.apply(&fresh, &reg).is_err());
        assert!(view.position(ExchangeId::new(2), &Symbol::new("ETH")).is_none());

        assert_eq!(
            view.apply(&trade(4, 2, "BTC", Side::BUY, "1", "100"), &reg).unwrap(),
            Applied::Folded
        );
    }

    #[test]
    fn test_net_quantity_overflow_is_none() {
        let reg = registry();
        let trades = vec![
            trade(1, 1, "BTC", Side::BUY, "50000000000000000000000000000", "0.000000000001"),
            trade(2, 2, "BTC", Side::BUY, "50000000000000000000000000000", "0.000000000001"),
        ];
        let view = PositionView::replay(&trades, &reg).unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.net_quantity(&btc()), None);
    }

    #[test]
    fn test_regression_detected() {
        let mut view = PositionView::new();
        let reg = registry();
        view.apply(&trade(5, 1, "BTC", Side::BUY, "1", "100"), &reg).unwrap();
        let err = view
            .apply(&trade(3, 1, "ETH", Side::BUY, "1", "100"), &reg)
            .unwrap_err();
        assert!(matches!(err, LedgerError::SequenceRegression { last: 5, got: 3, .. }));
    }

    #[test]
    fn test_replay_sorts_by_sequence() {
        let reg = registry();
        let trades = vec![
            trade(2, 1, "BTC", Side::SELL, "4", "110"),
            trade(1, 1, "BTC", Side::BUY, "10", "100"),
        ];
        let replayed = PositionView::replay(&trades, &reg).unwrap();

        let mut incremental = PositionView::new();
        incremental.apply(&trades[1], &reg).unwrap();
        incremental.apply(&trades[0], &reg).unwrap();
        assert_eq!(replayed.state_hash(), incremental.state_hash());
    }

    #[test]
    fn test_replay_records_faults() {
        let reg = registry();
        let trades = vec![
            trade(1, 9, "BTC", Side::BUY, "1", "100"),
            trade(2, 9, "BTC", Side::BUY, "1", "100"),
            trade(3, 1, "BTC", Side::BUY, "1", "100"),
        ];
        let view = PositionView::replay(&trades, &reg).unwrap();
        assert_eq!(view.faults().len(), 1);
        assert_eq!(view.len(), 1);
        assert_eq!(view.commit_marker(), 3);
    }

    #[test]
    fn test_net_quantity_across_exchanges() {
        let reg = registry();
        let trades = vec![
            trade(1, 1, "BTC", Side::BUY, "3", "100"),
            trade(2, 2, "BTC", Side::SELL, "1.5", "101"),
            trade(3, 1, "ETH", Side::BUY, "7", "10"),
        ];
        let view = PositionView::replay(&trades, &reg).unwrap();
        assert_eq!(view.net_quantity(&btc()), Some(Decimal::from_str_exact("1.5").unwrap()));
        assert_eq!(view.positions_for_symbol(&btc()).len(), 2);
        assert_eq!(view.net_quantity(&Symbol::new("SOL")), Some(Decimal::ZERO));
    }

    #[test]
    fn test_split_and_absorb_matches_sequential() {
        let reg = registry();
        let trades = vec![
            trade(1, 1, "BTC", Side::BUY, "3", "100"),
            trade(2, 1, "ETH", Side::BUY, "2", "10"),
            trade(3, 1, "BTC", Side::SELL, "1", "120"),
            trade(4, 1, "ETH", Side::SELL, "5", "9"),
        ];
        let sequential = PositionView::replay(&trades, &reg).unwrap();

        let mut view = PositionView::new();
        let btc_key = PositionKey::new(ExchangeId::new(1), btc());
        let eth_key = PositionKey::new(ExchangeId::new(1), Symbol::new("ETH"));
        let mut btc_part = view.split_off(&btc_key);
        let mut eth_part = view.split_off(&eth_key);
        let (btc_trades, eth_trades): (Vec<Trade>, Vec<Trade>) =
            trades.iter().cloned().partition(|t| t.symbol == btc());
        btc_part.fold_all(&btc_trades, &reg).unwrap();
        eth_part.fold_all(&eth_trades, &reg).unwrap();
        view.absorb(btc_part);
        view.absorb(eth_part);

        assert_eq!(view.state_hash(), sequential.state_hash());
    }
}
