//! Trade Store: durable home of exchanges, users and committed trades
//!
//! Three backends share one contract:
//! - `MemoryStore`: process-local, for tests and dry runs
//! - `JournalStore`: the CRC-framed journal, single-process owner
//! - `SqliteStore`: relational schema with FK and UNIQUE constraints
//!
//! Every backend enforces at most one trade per dedup key and assigns commit
//! sequences that strictly increase in commit order.

pub mod index;
pub mod journal_store;
pub mod memory;
pub mod sqlite;

use crate::journal::JournalError;
use crate::reader::ReaderError;
use std::io;
use types::errors::StorageError;
use types::exchange::{Exchange, NewExchange, User};
use types::ids::{DedupKey, ExchangeId, Symbol};
use types::trade::{Trade, ValidatedTrade};

pub use journal_store::JournalStore;
pub use memory::MemoryStore;
pub use sqlite::{SqliteConfig, SqliteStore};

/// Result of persisting one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First delivery of the key; the trade is now committed
    Inserted(Trade),
    /// The key was already committed; carries the stored trade
    Duplicate(Trade),
}

impl InsertOutcome {
    pub fn trade(&self) -> &Trade {
        match self {
            InsertOutcome::Inserted(t) | InsertOutcome::Duplicate(t) => t,
        }
    }

    pub fn into_trade(self) -> Trade {
        match self {
            InsertOutcome::Inserted(t) | InsertOutcome::Duplicate(t) => t,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, InsertOutcome::Duplicate(_))
    }
}

/// Storage contract shared by every backend.
///
/// Implementations are shared across connector tasks, so every method takes
/// `&self` and uniqueness is checked and committed atomically inside.
pub trait TradeStore: Send + Sync {
    /// Backend name for logging
    fn backend(&self) -> &'static str;

    /// Register a venue. Names are unique.
    fn register_exchange(&self, exchange: &NewExchange) -> Result<Exchange, StorageError>;

    fn set_exchange_active(&self, id: ExchangeId, active: bool) -> Result<Exchange, StorageError>;

    fn exchange(&self, id: ExchangeId) -> Result<Option<Exchange>, StorageError>;

    /// All exchanges ordered by id
    fn exchanges(&self) -> Result<Vec<Exchange>, StorageError>;

    /// Register a user. Usernames are unique.
    fn register_user(&self, username: &str) -> Result<User, StorageError>;

    /// Commit `trade` under `key` unless the key is already present.
    ///
    /// A trade referencing an unregistered exchange or user is refused with
    /// a permanent error.
    fn insert_trade(
        &self,
        key: &DedupKey,
        trade: &ValidatedTrade,
    ) -> Result<InsertOutcome, StorageError>;

    fn trade_by_key(&self, key: &DedupKey) -> Result<Option<Trade>, StorageError>;

    /// Trades with `sequence > after`, ascending, at most `limit`.
    fn trades_after(&self, after: u64, limit: usize) -> Result<Vec<Trade>, StorageError>;

    /// Latest trades for a symbol, newest first.
    fn recent_trades(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Trade>, StorageError>;

    /// Highest committed trade sequence, 0 when empty.
    fn latest_sequence(&self) -> Result<u64, StorageError>;
}

// ── Error Mapping ───────────────────────────────────────────────────

/// Interrupted or timed-out IO may succeed on retry; anything else may not.
pub(crate) fn io_error(err: &io::Error) -> StorageError {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            StorageError::transient(err.to_string())
        }
        _ => StorageError::permanent(err.to_string()),
    }
}

impl From<JournalError> for StorageError {
    fn from(err: JournalError) -> Self {
        match &err {
            JournalError::Io(io) => io_error(io),
            _ => StorageError::permanent(err.to_string()),
        }
    }
}

impl From<ReaderError> for StorageError {
    fn from(err: ReaderError) -> Self {
        match &err {
            ReaderError::Io(io) => io_error(io),
            _ => StorageError::permanent(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let busy = io::Error::new(io::ErrorKind::Interrupted, "signal");
        assert!(io_error(&busy).is_retryable());

        let full = io::Error::new(io::ErrorKind::Other, "No space left on device");
        assert!(!io_error(&full).is_retryable());
    }

    #[test]
    fn test_journal_error_mapping() {
        let err: StorageError = JournalError::SizeLimitExceeded {
            current: 10,
            limit: 10,
        }
        .into();
        assert!(!err.is_retryable());

        let err: StorageError =
            JournalError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow disk")).into();
        assert!(err.is_retryable());
    }
}
