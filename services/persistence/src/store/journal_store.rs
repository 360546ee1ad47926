//! Journal-backed trade store
//!
//! The journal is the store: every registration, activation toggle and
//! trade commit is one entry, and the in-memory index is rebuilt by reading
//! the journal on open. A commit is acknowledged only after the entry is
//! appended (and fsynced under the default policy).
//!
//! One process owns a journal directory at a time.

use super::index::LedgerIndex;
use super::{InsertOutcome, TradeStore};
use crate::journal::{EntryKind, JournalConfig, JournalEntry, JournalWriter};
use crate::reader::{CorruptionKind, JournalReader};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use types::errors::StorageError;
use types::exchange::{Exchange, NewExchange, User};
use types::ids::{DedupKey, ExchangeId, Symbol, TradeId};
use types::now_nanos;
use types::trade::{Trade, ValidatedTrade};

/// Payload of an `ExchangeActivation` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub exchange_id: ExchangeId,
    pub active: bool,
}

struct Inner {
    index: LedgerIndex,
    writer: JournalWriter,
}

pub struct JournalStore {
    inner: Mutex<Inner>,
}

impl JournalStore {
    /// Open the journal in `config.dir`, replaying it into memory.
    ///
    /// A torn final write is cut off before appending resumes. Checksum
    /// failures, malformed entries anywhere else and sequence gaps refuse
    /// to open.
    pub fn open(config: JournalConfig) -> Result<Self, StorageError> {
        let mut reader = JournalReader::open(&config.dir)?;
        let entries = reader.read_all()?;
        JournalReader::validate_sequences(&entries)?;
        Self::cut_torn_tail(&reader)?;

        let mut index = LedgerIndex::new();
        for entry in &entries {
            Self::apply_entry(&mut index, entry)?;
        }

        let mut writer = JournalWriter::open(config)?;
        let next_sequence = reader.last_sequence().map_or(1, |seq| seq + 1);
        writer.set_next_sequence(next_sequence);

        info!(
            entries = entries.len(),
            trades = index.trade_count(),
            next_sequence,
            "Journal store opened"
        );

        Ok(Self {
            inner: Mutex::new(Inner { index, writer }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| StorageError::permanent("journal store lock poisoned"))
    }

    fn cut_torn_tail(reader: &JournalReader) -> Result<(), StorageError> {
        for record in reader.corruption_log() {
            if record.kind != CorruptionKind::TruncatedEntry {
                continue;
            }
            warn!(
                file = %record.file.display(),
                file_offset = record.file_offset,
                "Cutting torn journal tail"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&record.file)
                .map_err(|e| super::io_error(&e))?;
            file.set_len(record.file_offset)
                .map_err(|e| super::io_error(&e))?;
            file.sync_all().map_err(|e| super::io_error(&e))?;
        }
        Ok(())
    }

    fn apply_entry(index: &mut LedgerIndex, entry: &JournalEntry) -> Result<(), StorageError> {
        match entry.kind {
            EntryKind::ExchangeRegistered => index.insert_exchange(entry.decode::<Exchange>()?),
            EntryKind::ExchangeActivation => {
                let record: ActivationRecord = entry.decode()?;
                index.set_active(record.exchange_id, record.active)?;
            }
            EntryKind::UserRegistered => index.insert_user(entry.decode::<User>()?),
            EntryKind::TradeCommitted => {
                let trade: Trade = entry.decode()?;
                if trade.sequence != entry.sequence {
                    return Err(StorageError::permanent(format!(
                        "trade sequence {} does not match entry sequence {}",
                        trade.sequence, entry.sequence
                    )));
                }
                index.insert_trade(trade)?;
            }
        }
        Ok(())
    }
}

impl Drop for JournalStore {
    /// Flush entries still buffered under relaxed policies
    fn drop(&mut self) {
        let Ok(inner) = self.inner.get_mut() else {
            return;
        };
        if inner.writer.is_failed() {
            return;
        }
        if let Err(e) = inner.writer.sync() {
            warn!(error = %e, "Journal sync on close failed");
        }
    }
}

impl TradeStore for JournalStore {
    fn backend(&self) -> &'static str {
        "journal"
    }

    fn register_exchange(&self, exchange: &NewExchange) -> Result<Exchange, StorageError> {
        let mut inner = self.lock()?;
        inner.index.check_new_exchange(exchange)?;

        let now = now_nanos();
        let created = Exchange {
            id: inner.index.next_exchange_id(),
            name: exchange.name.trim().to_string(),
            credential_ref: exchange.credential_ref.clone(),
            active: exchange.active,
            created_at: now,
        };
        inner
            .writer
            .append_record(now, EntryKind::ExchangeRegistered, &created)?;
        inner.index.insert_exchange(created.clone());

        info!(exchange_id = %created.id, name = %created.name, "Exchange registered");
        Ok(created)
    }

    fn set_exchange_active(&self, id: ExchangeId, active: bool) -> Result<Exchange, StorageError> {
        let mut inner = self.lock()?;
        if inner.index.exchange(id).is_none() {
            return Err(StorageError::permanent(format!("unknown exchange {}", id)));
        }
        let record = ActivationRecord {
            exchange_id: id,
            active,
        };
        inner
            .writer
            .append_record(now_nanos(), EntryKind::ExchangeActivation, &record)?;
        inner.index.set_active(id, active)
    }

    fn exchange(&self, id: ExchangeId) -> Result<Option<Exchange>, StorageError> {
        Ok(self.lock()?.index.exchange(id).cloned())
    }

    fn exchanges(&self) -> Result<Vec<Exchange>, StorageError> {
        Ok(self.lock()?.index.exchanges())
    }

    fn register_user(&self, username: &str) -> Result<User, StorageError> {
        let mut inner = self.lock()?;
        inner.index.check_new_user(username)?;

        let now = now_nanos();
        let user = User {
            id: inner.index.next_user_id(),
            username: username.trim().to_string(),
            created_at: now,
        };
        inner
            .writer
            .append_record(now, EntryKind::UserRegistered, &user)?;
        inner.index.insert_user(user.clone());
        Ok(user)
    }

    fn insert_trade(
        &self,
        key: &DedupKey,
        trade: &ValidatedTrade,
    ) -> Result<InsertOutcome, StorageError> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.index.trade_by_key(key) {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }
        inner.index.check_references(trade)?;

        let now = now_nanos();
        let sequence = inner.writer.next_sequence();
        let committed = Trade::from_validated(trade, TradeId::new(), sequence, key.clone(), now);
        inner
            .writer
            .append_record(now, EntryKind::TradeCommitted, &committed)?;
        inner.index.insert_trade(committed.clone())?;
        Ok(InsertOutcome::Inserted(committed))
    }

    fn trade_by_key(&self, key: &DedupKey) -> Result<Option<Trade>, StorageError> {
        Ok(self.lock()?.index.trade_by_key(key).cloned())
    }

    fn trades_after(&self, after: u64, limit: usize) -> Result<Vec<Trade>, StorageError> {
        Ok(self.lock()?.index.trades_after(after, limit))
    }

    fn recent_trades(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Trade>, StorageError> {
        Ok(self.lock()?.index.recent_trades(symbol, limit))
    }

    fn latest_sequence(&self) -> Result<u64, StorageError> {
        Ok(self.lock()?.index.latest_sequence())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::list_journal_files;
    use rust_decimal::Decimal;
    use std::fs;
    use tempfile::TempDir;
    use types::numeric::{Price, Quantity};
    use types::side::Side;

    fn validated(exchange_id: ExchangeId, qty: u64) -> ValidatedTrade {
        ValidatedTrade {
            exchange_id,
            user_id: None,
            symbol: Symbol::new("BTC"),
            side: Side::BUY,
            quantity: Quantity::from_u64(qty),
            price: Price::from_u64(100),
            fee: Decimal::ZERO,
            timestamp: None,
        }
    }

    fn key(k: &str) -> DedupKey {
        DedupKey::try_new(k).unwrap()
    }

    #[test]
    fn test_state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let written = {
            let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
            let ex = store.register_exchange(&NewExchange::new("binance")).unwrap();
            store.set_exchange_active(ex.id, false).unwrap();
            store.register_user("alice").unwrap();
            store.insert_trade(&key("fill-1"), &validated(ex.id, 1)).unwrap();
            store.insert_trade(&key("fill-2"), &validated(ex.id, 2)).unwrap();
            store.trades_after(0, 10).unwrap()
        };

        let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
        assert_eq!(store.trades_after(0, 10).unwrap(), written);
        let ex = store.exchange(ExchangeId::new(1)).unwrap().unwrap();
        assert!(!ex.active);

        // Duplicate detection survives the restart
        let again = store.insert_trade(&key("fill-1"), &validated(ex.id, 1)).unwrap();
        assert!(again.is_duplicate());

        let next = store.insert_trade(&key("fill-3"), &validated(ex.id, 3)).unwrap();
        assert!(next.trade().sequence > written[1].sequence);
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let tmp = TempDir::new().unwrap();
        let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
        let ex = store.register_exchange(&NewExchange::new("binance")).unwrap();
        for i in 0..5 {
            store
                .insert_trade(&key(&format!("fill-{i}")), &validated(ex.id, 1))
                .unwrap();
        }
        let seqs: Vec<u64> = store.trades_after(0, 10).unwrap().iter().map(|t| t.sequence).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(store.latest_sequence().unwrap(), *seqs.last().unwrap());
    }

    #[test]
    fn test_torn_tail_is_cut_on_open() {
        let tmp = TempDir::new().unwrap();
        {
            let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
            let ex = store.register_exchange(&NewExchange::new("binance")).unwrap();
            store.insert_trade(&key("fill-1"), &validated(ex.id, 1)).unwrap();
        }

        let path = list_journal_files(tmp.path()).unwrap().last().unwrap().1.clone();
        let intact = fs::metadata(&path).unwrap().len();
        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(&[0x40, 0x00, 0x00, 0x00, 0x01]);
        fs::write(&path, &data).unwrap();

        let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        store
            .insert_trade(&key("fill-2"), &validated(ExchangeId::new(1), 2))
            .unwrap();
        drop(store);

        let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
        assert_eq!(store.trades_after(0, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_exchange_refused() {
        let tmp = TempDir::new().unwrap();
        let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
        let err = store
            .insert_trade(&key("fill-1"), &validated(ExchangeId::new(3), 1))
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(store.latest_sequence().unwrap(), 0);
    }

    #[test]
    fn test_buffered_entries_flushed_on_close() {
        let tmp = TempDir::new().unwrap();
        let config = JournalConfig {
            flush_policy: crate::journal::FlushPolicy::EveryN(1_000),
            fsync_policy: crate::journal::FsyncPolicy::OnRotation,
            ..JournalConfig::new(tmp.path())
        };
        {
            let store = JournalStore::open(config.clone()).unwrap();
            let ex = store.register_exchange(&NewExchange::new("binance")).unwrap();
            store.insert_trade(&key("fill-1"), &validated(ex.id, 1)).unwrap();
        }
        let store = JournalStore::open(config).unwrap();
        assert_eq!(store.trades_after(0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_mid_file_damage_refuses_to_open() {
        let tmp = TempDir::new().unwrap();
        {
            let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
            let ex = store.register_exchange(&NewExchange::new("binance")).unwrap();
            for i in 0..3 {
                store
                    .insert_trade(&key(&format!("fill-{i}")), &validated(ex.id, 1))
                    .unwrap();
            }
        }

        let path = list_journal_files(tmp.path()).unwrap()[0].1.clone();
        let mut data = fs::read(&path).unwrap();
        let before = data.len() as u64;
        let first = JournalEntry::declared_frame_len(&data).unwrap().unwrap();
        // Kind byte of the second entry
        data[first + 4 + 16] = 0x7F;
        fs::write(&path, &data).unwrap();

        let err = JournalStore::open(JournalConfig::new(tmp.path())).err().unwrap();
        assert!(!err.is_retryable());
        assert_eq!(fs::metadata(&path).unwrap().len(), before);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_append_never_duplicates_key() {
        let full = std::path::Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let config = JournalConfig {
            max_file_size: 1,
            ..JournalConfig::new(tmp.path())
        };
        let next_file = crate::journal::journal_path(tmp.path(), 1);
        {
            let store = JournalStore::open(config.clone()).unwrap();
            let ex = store.register_exchange(&NewExchange::new("binance")).unwrap();

            // The next append rotates onto a device that rejects every write
            std::os::unix::fs::symlink(full, &next_file).unwrap();
            assert!(store.insert_trade(&key("fill-1"), &validated(ex.id, 1)).is_err());

            // Redelivery is refused instead of appending a second copy
            let err = store
                .insert_trade(&key("fill-1"), &validated(ex.id, 1))
                .unwrap_err();
            assert!(!err.is_retryable());
            assert!(store.trades_after(0, 10).unwrap().is_empty());
            assert!(store.register_user("alice").is_err());
        }
        fs::remove_file(&next_file).unwrap();

        let store = JournalStore::open(config.clone()).unwrap();
        let outcome = store
            .insert_trade(&key("fill-1"), &validated(ExchangeId::new(1), 1))
            .unwrap();
        assert!(!outcome.is_duplicate());
        drop(store);

        let store = JournalStore::open(config).unwrap();
        assert_eq!(store.trades_after(0, 10).unwrap().len(), 1);
    }
}
