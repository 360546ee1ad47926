//! SQLite-backed trade store
//!
//! Uniqueness and referential integrity live in the schema (`UNIQUE
//! dedup_key`, `REFERENCES exchanges(id)`), so several processes may write
//! the same database file. `trades.id` is the commit sequence.

use super::{InsertOutcome, TradeStore};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};
use rust_decimal::Decimal;
use types::errors::StorageError;
use types::exchange::{Exchange, NewExchange, User};
use types::ids::{DedupKey, ExchangeId, Symbol, TradeId, UserId};
use types::now_nanos;
use types::numeric::{Price, Quantity};
use types::side::Side;
use types::trade::{Trade, ValidatedTrade};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../sql/schema.sql");

const TRADE_COLUMNS: &str = "id, trade_id, dedup_key, exchange_id, user_id, symbol, side, \
                             quantity, price, fee, timestamp, recorded_at";

/// Configuration for the SQLite backend.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    pub path: PathBuf,
    /// How long a writer waits on another connection's lock
    pub busy_timeout: Duration,
    pub wal: bool,
}

impl SqliteConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
            wal: true,
        }
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(config: &SqliteConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| super::io_error(&e))?;
            }
        }
        let conn = Connection::open(&config.path).map_err(sqlite_error)?;
        Self::init(conn, config, &config.path)
    }

    /// Private in-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(sqlite_error)?;
        let config = SqliteConfig {
            wal: false,
            ..SqliteConfig::new(":memory:")
        };
        Self::init(conn, &config, Path::new(":memory:"))
    }

    fn init(conn: Connection, config: &SqliteConfig, path: &Path) -> Result<Self, StorageError> {
        conn.busy_timeout(config.busy_timeout).map_err(sqlite_error)?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(sqlite_error)?;
        if config.wal {
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .map_err(sqlite_error)?;
            debug!(journal_mode = %mode, "SQLite journal mode set");
        }
        conn.execute_batch(SCHEMA).map_err(sqlite_error)?;

        info!(path = %path.display(), wal = config.wal, "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::permanent("sqlite connection lock poisoned"))
    }

    fn select_exchange(conn: &Connection, id: ExchangeId) -> Result<Option<Exchange>, StorageError> {
        conn.query_row(
            "SELECT id, name, credential_ref, active, created_at FROM exchanges WHERE id = ?1",
            params![id.value()],
            row_to_exchange,
        )
        .optional()
        .map_err(sqlite_error)
    }

    fn select_trade_by_key(conn: &Connection, key: &DedupKey) -> Result<Option<Trade>, StorageError> {
        conn.query_row(
            &format!("SELECT {} FROM trades WHERE dedup_key = ?1", TRADE_COLUMNS),
            params![key.as_str()],
            row_to_trade,
        )
        .optional()
        .map_err(sqlite_error)
    }
}

impl TradeStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn register_exchange(&self, exchange: &NewExchange) -> Result<Exchange, StorageError> {
        let name = exchange.name.trim();
        if name.is_empty() {
            return Err(StorageError::permanent("exchange name must not be blank"));
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO exchanges (name, credential_ref, active, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, exchange.credential_ref, exchange.active, now_nanos()],
        )
        .map_err(sqlite_error)?;

        let id = ExchangeId::new(conn.last_insert_rowid());
        let created = Self::select_exchange(&conn, id)?
            .ok_or_else(|| StorageError::permanent(format!("exchange {} vanished after insert", id)))?;
        info!(exchange_id = %created.id, name = %created.name, "Exchange registered");
        Ok(created)
    }

    fn set_exchange_active(&self, id: ExchangeId, active: bool) -> Result<Exchange, StorageError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE exchanges SET active = ?1 WHERE id = ?2",
                params![active, id.value()],
            )
            .map_err(sqlite_error)?;
        if changed == 0 {
            return Err(StorageError::permanent(format!("unknown exchange {}", id)));
        }
        Self::select_exchange(&conn, id)?
            .ok_or_else(|| StorageError::permanent(format!("unknown exchange {}", id)))
    }

    fn exchange(&self, id: ExchangeId) -> Result<Option<Exchange>, StorageError> {
        let conn = self.lock()?;
        Self::select_exchange(&conn, id)
    }

    fn exchanges(&self) -> Result<Vec<Exchange>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, name, credential_ref, active, created_at FROM exchanges ORDER BY id")
            .map_err(sqlite_error)?;
        let rows = stmt.query_map([], row_to_exchange).map_err(sqlite_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sqlite_error)
    }

    fn register_user(&self, username: &str) -> Result<User, StorageError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(StorageError::permanent("username must not be blank"));
        }
        let conn = self.lock()?;
        let created_at = now_nanos();
        conn.execute(
            "INSERT INTO users (username, created_at) VALUES (?1, ?2)",
            params![username, created_at],
        )
        .map_err(sqlite_error)?;
        Ok(User {
            id: UserId::new(conn.last_insert_rowid()),
            username: username.to_string(),
            created_at,
        })
    }

    fn insert_trade(
        &self,
        key: &DedupKey,
        trade: &ValidatedTrade,
    ) -> Result<InsertOutcome, StorageError> {
        let conn = self.lock()?;
        let trade_id = TradeId::new();
        let recorded_at = now_nanos();
        let timestamp = trade.timestamp.unwrap_or(recorded_at);

        let inserted = conn
            .execute(
                "INSERT INTO trades (trade_id, dedup_key, exchange_id, user_id, symbol, side, \
                 quantity, price, fee, timestamp, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(dedup_key) DO NOTHING",
                params![
                    trade_id.to_string(),
                    key.as_str(),
                    trade.exchange_id.value(),
                    trade.user_id.map(|u| u.value()),
                    trade.symbol.as_str(),
                    trade.side.as_str(),
                    trade.quantity.to_string(),
                    trade.price.to_string(),
                    trade.fee.to_string(),
                    timestamp,
                    recorded_at,
                ],
            )
            .map_err(sqlite_error)?;

        if inserted == 1 {
            let sequence = conn.last_insert_rowid() as u64;
            debug!(sequence, dedup_key = %key, "Trade row inserted");
            return Ok(InsertOutcome::Inserted(Trade::from_validated(
                trade,
                trade_id,
                sequence,
                key.clone(),
                recorded_at,
            )));
        }

        let existing = Self::select_trade_by_key(&conn, key)?.ok_or_else(|| {
            StorageError::permanent(format!("insert of {} ignored but no row holds the key", key))
        })?;
        Ok(InsertOutcome::Duplicate(existing))
    }

    fn trade_by_key(&self, key: &DedupKey) -> Result<Option<Trade>, StorageError> {
        let conn = self.lock()?;
        Self::select_trade_by_key(&conn, key)
    }

    fn trades_after(&self, after: u64, limit: usize) -> Result<Vec<Trade>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM trades WHERE id > ?1 ORDER BY id LIMIT ?2",
                TRADE_COLUMNS
            ))
            .map_err(sqlite_error)?;
        let rows = stmt
            .query_map(params![after as i64, limit as i64], row_to_trade)
            .map_err(sqlite_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sqlite_error)
    }

    fn recent_trades(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Trade>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM trades WHERE symbol = ?1 ORDER BY id DESC LIMIT ?2",
                TRADE_COLUMNS
            ))
            .map_err(sqlite_error)?;
        let rows = stmt
            .query_map(params![symbol.as_str(), limit as i64], row_to_trade)
            .map_err(sqlite_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sqlite_error)
    }

    fn latest_sequence(&self) -> Result<u64, StorageError> {
        let conn = self.lock()?;
        let max: i64 = conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM trades", [], |row| row.get(0))
            .map_err(sqlite_error)?;
        Ok(max as u64)
    }
}

// ── Row Mapping ─────────────────────────────────────────────────────

fn row_to_exchange(row: &Row<'_>) -> rusqlite::Result<Exchange> {
    Ok(Exchange {
        id: ExchangeId::new(row.get(0)?),
        name: row.get(1)?,
        credential_ref: row.get(2)?,
        active: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_trade(row: &Row<'_>) -> rusqlite::Result<Trade> {
    let id: i64 = row.get(0)?;
    let trade_id: String = row.get(1)?;
    let dedup_key: String = row.get(2)?;
    let user_id: Option<i64> = row.get(4)?;
    let symbol: String = row.get(5)?;
    let side: String = row.get(6)?;
    let quantity: String = row.get(7)?;
    let price: String = row.get(8)?;
    let fee: String = row.get(9)?;

    Ok(Trade {
        trade_id: TradeId::from_uuid(
            Uuid::parse_str(&trade_id).map_err(|e| conversion(1, e))?,
        ),
        sequence: id as u64,
        dedup_key: DedupKey::try_new(&dedup_key)
            .ok_or_else(|| conversion(2, format!("invalid dedup key {:?}", dedup_key)))?,
        exchange_id: ExchangeId::new(row.get(3)?),
        user_id: user_id.map(UserId::new),
        symbol: Symbol::try_new(&symbol).ok_or_else(|| conversion(5, "blank symbol"))?,
        side: Side::parse(&side).ok_or_else(|| conversion(6, format!("invalid side {:?}", side)))?,
        quantity: Quantity::from_str(&quantity).map_err(|e| conversion(7, e))?,
        price: Price::from_str(&price).map_err(|e| conversion(8, e))?,
        fee: Decimal::from_str(&fee).map_err(|e| conversion(9, e))?,
        timestamp: row.get(10)?,
        recorded_at: row.get(11)?,
    })
}

fn conversion<E>(column: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, err.into())
}

/// BUSY and LOCKED clear once the other writer commits; the rest do not.
fn sqlite_error(err: rusqlite::Error) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StorageError::transient(err.to_string())
        }
        _ => StorageError::permanent(err.to_string()),
    }
}
