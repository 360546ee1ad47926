//! Process-local trade store

use super::index::LedgerIndex;
use super::{InsertOutcome, TradeStore};
use std::sync::{Mutex, MutexGuard};
use types::errors::StorageError;
use types::exchange::{Exchange, NewExchange, User};
use types::ids::{DedupKey, ExchangeId, Symbol, TradeId};
use types::now_nanos;
use types::trade::{Trade, ValidatedTrade};

/// Trade store held entirely in memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    index: Mutex<LedgerIndex>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerIndex>, StorageError> {
        self.index
            .lock()
            .map_err(|_| StorageError::permanent("memory store lock poisoned"))
    }
}

impl TradeStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn register_exchange(&self, exchange: &NewExchange) -> Result<Exchange, StorageError> {
        let mut index = self.lock()?;
        index.check_new_exchange(exchange)?;
        let created = Exchange {
            id: index.next_exchange_id(),
            name: exchange.name.trim().to_string(),
            credential_ref: exchange.credential_ref.clone(),
            active: exchange.active,
            created_at: now_nanos(),
        };
        index.insert_exchange(created.clone());
        Ok(created)
    }

    fn set_exchange_active(&self, id: ExchangeId, active: bool) -> Result<Exchange, StorageError> {
        self.lock()?.set_active(id, active)
    }

    fn exchange(&self, id: ExchangeId) -> Result<Option<Exchange>, StorageError> {
        Ok(self.lock()?.exchange(id).cloned())
    }

    fn exchanges(&self) -> Result<Vec<Exchange>, StorageError> {
        Ok(self.lock()?.exchanges())
    }

    fn register_user(&self, username: &str) -> Result<User, StorageError> {
        let mut index = self.lock()?;
        index.check_new_user(username)?;
        let user = User {
            id: index.next_user_id(),
            username: username.trim().to_string(),
            created_at: now_nanos(),
        };
        index.insert_user(user.clone());
        Ok(user)
    }

    fn insert_trade(
        &self,
        key: &DedupKey,
        trade: &ValidatedTrade,
    ) -> Result<InsertOutcome, StorageError> {
        let mut index = self.lock()?;
        if let Some(existing) = index.trade_by_key(key) {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }
        index.check_references(trade)?;

        let sequence = index.latest_sequence() + 1;
        let committed =
            Trade::from_validated(trade, TradeId::new(), sequence, key.clone(), now_nanos());
        index.insert_trade(committed.clone())?;
        Ok(InsertOutcome::Inserted(committed))
    }

    fn trade_by_key(&self, key: &DedupKey) -> Result<Option<Trade>, StorageError> {
        Ok(self.lock()?.trade_by_key(key).cloned())
    }

    fn trades_after(&self, after: u64, limit: usize) -> Result<Vec<Trade>, StorageError> {
        Ok(self.lock()?.trades_after(after, limit))
    }

    fn recent_trades(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Trade>, StorageError> {
        Ok(self.lock()?.recent_trades(symbol, limit))
    }

    fn latest_sequence(&self) -> Result<u64, StorageError> {
        Ok(self.lock()?.latest_sequence())
    }
}
