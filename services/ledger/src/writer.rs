//! Idempotent Writer
//!
//! Persists validated trades under their dedup key. Exactly-once comes from
//! the store's uniqueness check; the writer holds no lock of its own and is
//! shared by every connector task.

use persistence::store::{InsertOutcome, TradeStore};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use types::errors::StorageError;
use types::ids::DedupKey;
use types::trade::{Trade, ValidatedTrade};

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// New trade, now committed
    Committed(Trade),
    /// Redelivery of a committed key; carries the stored trade
    Duplicate(Trade),
}

impl WriteOutcome {
    pub fn trade(&self) -> &Trade {
        match self {
            WriteOutcome::Committed(t) | WriteOutcome::Duplicate(t) => t,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, WriteOutcome::Duplicate(_))
    }
}

#[derive(Clone)]
pub struct IdempotentWriter {
    store: Arc<dyn TradeStore>,
    commits: Arc<Notify>,
}

impl IdempotentWriter {
    pub fn new(store: Arc<dyn TradeStore>) -> Self {
        Self {
            store,
            commits: Arc::new(Notify::new()),
        }
    }

    /// Signalled after every new commit. Hand it to the aggregation consumer.
    pub fn commit_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.commits)
    }

    pub fn store(&self) -> &Arc<dyn TradeStore> {
        &self.store
    }

    /// Persist `trade` under `key` unless the key was already committed.
    ///
    /// Blocking: callers on the async runtime go through `spawn_blocking`.
    pub fn write(&self, key: &DedupKey, trade: &ValidatedTrade) -> Result<WriteOutcome, StorageError> {
        match self.store.insert_trade(key, trade)? {
            InsertOutcome::Inserted(committed) => {
                info!(
                    sequence = committed.sequence,
                    dedup_key = %key,
                    exchange_id = %committed.exchange_id,
                    symbol = %committed.symbol,
                    side = %committed.side,
                    quantity = %committed.quantity,
                    price = %committed.price,
                    "Trade committed"
                );
                self.commits.notify_one();
                Ok(WriteOutcome::Committed(committed))
            }
            InsertOutcome::Duplicate(existing) => {
                if existing.same_payload(trade) {
                    debug!(dedup_key = %key, sequence = existing.sequence, "Duplicate delivery");
                } else {
                    warn!(
                        dedup_key = %key,
                        sequence = existing.sequence,
                        "Redelivered payload differs from committed trade; keeping committed"
                    );
                }
                Ok(WriteOutcome::Duplicate(existing))
            }
        }
    }
}

impl std::fmt::Debug for IdempotentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotentWriter")
            .field("backend", &self.store.backend())
            .finish()
    }
}
