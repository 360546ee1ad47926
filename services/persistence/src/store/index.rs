//! In-memory ledger index shared by the memory and journal backends
//!
//! Holds registries, committed trades in sequence order, and the dedup key
//! index. Callers serialize access behind one lock so a key check and the
//! following commit are atomic.

use std::collections::{BTreeMap, HashMap};
use types::errors::StorageError;
use types::exchange::{Exchange, NewExchange, User};
use types::ids::{DedupKey, ExchangeId, Symbol, UserId};
use types::trade::{Trade, ValidatedTrade};

#[derive(Debug, Default)]
pub struct LedgerIndex {
    exchanges: BTreeMap<ExchangeId, Exchange>,
    users: BTreeMap<UserId, User>,
    /// Committed trades, ascending by sequence
    trades: Vec<Trade>,
    by_key: HashMap<DedupKey, usize>,
}

impl LedgerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Exchanges ───────────────────────────────────────────────────

    pub fn next_exchange_id(&self) -> ExchangeId {
        let last = self.exchanges.keys().next_back().map_or(0, |id| id.value());
        ExchangeId::new(last + 1)
    }

    /// Refuse a registration whose name is taken.
    pub fn check_new_exchange(&self, exchange: &NewExchange) -> Result<(), StorageError> {
        let name = exchange.name.trim();
        if name.is_empty() {
            return Err(StorageError::permanent("exchange name must not be blank"));
        }
        if self.exchanges.values().any(|e| e.name == name) {
            return Err(StorageError::permanent(format!(
                "UNIQUE constraint failed: exchanges.name ({})",
                name
            )));
        }
        Ok(())
    }

    pub fn insert_exchange(&mut self, exchange: Exchange) {
        self.exchanges.insert(exchange.id, exchange);
    }

    pub fn set_active(&mut self, id: ExchangeId, active: bool) -> Result<Exchange, StorageError> {
        let exchange = self
            .exchanges
            .get_mut(&id)
            .ok_or_else(|| StorageError::permanent(format!("unknown exchange {}", id)))?;
        exchange.active = active;
        Ok(exchange.clone())
    }

    pub fn exchange(&self, id: ExchangeId) -> Option<&Exchange> {
        self.exchanges.get(&id)
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.exchanges.values().cloned().collect()
    }

    // ── Users ───────────────────────────────────────────────────────

    pub fn next_user_id(&self) -> UserId {
        let last = self.users.keys().next_back().map_or(0, |id| id.value());
        UserId::new(last + 1)
    }

    pub fn check_new_user(&self, username: &str) -> Result<(), StorageError> {
        if username.trim().is_empty() {
            return Err(StorageError::permanent("username must not be blank"));
        }
        if self.users.values().any(|u| u.username == username.trim()) {
            return Err(StorageError::permanent(format!(
                "UNIQUE constraint failed: users.username ({})",
                username.trim()
            )));
        }
        Ok(())
    }

    pub fn insert_user(&mut self, user: User) {
        self.users.insert(user.id, user);
    }

    // ── Trades ──────────────────────────────────────────────────────

    /// Referential checks the relational schema expresses as foreign keys.
    pub fn check_references(&self, trade: &ValidatedTrade) -> Result<(), StorageError> {
        if !self.exchanges.contains_key(&trade.exchange_id) {
            return Err(StorageError::permanent(format!(
                "FOREIGN KEY constraint failed: unknown exchange {}",
                trade.exchange_id
            )));
        }
        if let Some(user_id) = trade.user_id {
            if !self.users.contains_key(&user_id) {
                return Err(StorageError::permanent(format!(
                    "FOREIGN KEY constraint failed: unknown user {}",
                    user_id
                )));
            }
        }
        Ok(())
    }

    pub fn trade_by_key(&self, key: &DedupKey) -> Option<&Trade> {
        self.by_key.get(key).map(|&idx| &self.trades[idx])
    }

    /// Append a committed trade. Its sequence must exceed every stored one.
    pub fn insert_trade(&mut self, trade: Trade) -> Result<(), StorageError> {
        if trade.sequence <= self.latest_sequence() {
            return Err(StorageError::permanent(format!(
                "commit sequence regression: {} after {}",
                trade.sequence,
                self.latest_sequence()
            )));
        }
        if self.by_key.contains_key(&trade.dedup_key) {
            return Err(StorageError::permanent(format!(
                "UNIQUE constraint failed: trades.dedup_key ({})",
                trade.dedup_key
            )));
        }
        self.by_key.insert(trade.dedup_key.clone(), self.trades.len());
        self.trades.push(trade);
        Ok(())
    }

    pub fn trades_after(&self, after: u64, limit: usize) -> Vec<Trade> {
        let start = self.trades.partition_point(|t| t.sequence <= after);
        self.trades[start..].iter().take(limit).cloned().collect()
    }

    pub fn recent_trades(&self, symbol: &Symbol, limit: usize) -> Vec<Trade> {
        self.trades
            .iter()
            .rev()
            .filter(|t| &t.symbol == symbol)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn latest_sequence(&self) -> u64 {
        self.trades.last().map_or(0, |t| t.sequence)
    }

    pub fn trade_count(&self) -> usize {
        self.trades.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::ids::TradeId;
    use types::numeric::{Price, Quantity};
    use types::side::Side;
    use rust_decimal::Decimal;

    fn exchange(id: i64, name: &str) -> Exchange {
        Exchange {
            id: ExchangeId::new(id),
            name: name.into(),
            credential_ref: None,
            active: true,
            created_at: 0,
        }
    }

    fn trade(seq: u64, key: &str, symbol: &str) -> Trade {
        let validated = ValidatedTrade {
            exchange_id: ExchangeId::new(1),
            user_id: None,
            symbol: Symbol::new(symbol),
            side: Side::BUY,
            quantity: Quantity::from_u64(1),
            price: Price::from_u64(100),
            fee: Decimal::ZERO,
            timestamp: None,
        };
        Trade::from_validated(&validated, TradeId::new(), seq, DedupKey::try_new(key).unwrap(), 1)
    }

    #[test]
    fn test_exchange_ids_and_unique_names() {
        let mut index = LedgerIndex::new();
        assert_eq!(index.next_exchange_id(), ExchangeId::new(1));
        index.insert_exchange(exchange(1, "binance"));
        assert_eq!(index.next_exchange_id(), ExchangeId::new(2));

        assert!(index.check_new_exchange(&NewExchange::new("binance")).is_err());
        assert!(index.check_new_exchange(&NewExchange::new("kraken")).is_ok());
        assert!(index.check_new_exchange(&NewExchange::new("  ")).is_err());
    }

    #[test]
    fn test_set_active_unknown_exchange() {
        let mut index = LedgerIndex::new();
        assert!(index.set_active(ExchangeId::new(4), false).is_err());
    }

    #[test]
    fn test_trades_after_and_recent() {
        let mut index = LedgerIndex::new();
        index.insert_trade(trade(1, "a", "BTC")).unwrap();
        index.insert_trade(trade(3, "b", "ETH")).unwrap();
        index.insert_trade(trade(4, "c", "BTC")).unwrap();

        let after: Vec<u64> = index.trades_after(1, 10).iter().map(|t| t.sequence).collect();
        assert_eq!(after, vec![3, 4]);
        assert_eq!(index.trades_after(0, 1).len(), 1);
        assert!(index.trades_after(4, 10).is_empty());

        let recent: Vec<u64> = index
            .recent_trades(&Symbol::new("BTC"), 10)
            .iter()
            .map(|t| t.sequence)
            .collect();
        assert_eq!(recent, vec![4, 1]);
        assert_eq!(index.latest_sequence(), 4);
    }

    #[test]
    fn test_insert_rejects_regression_and_duplicate_key() {
        let mut index = LedgerIndex::new();
        index.insert_trade(trade(2, "a", "BTC")).unwrap();
        assert!(index.insert_trade(trade(2, "b", "BTC")).is_err());
        assert!(index.insert_trade(trade(3, "a", "BTC")).is_err());
        assert_eq!(index.trade_count(), 1);
    }

    #[test]
    fn test_check_references() {
        let mut index = LedgerIndex::new();
        let t = trade(1, "a", "BTC").to_validated();
        assert!(index.check_references(&t).is_err());

        index.insert_exchange(exchange(1, "binance"));
        assert!(index.check_references(&t).is_ok());

        let mut with_user = t.clone();
        with_user.user_id = Some(UserId::new(5));
        assert!(index.check_references(&with_user).is_err());
    }
}
