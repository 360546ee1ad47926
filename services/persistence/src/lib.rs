//! Persistence for the trade ledger
//!
//! Provides append-only journal writing, sequential reading with corruption
//! detection, position-view snapshots, and the `TradeStore` backends the
//! ingest path commits through.
//!
//! # Modules
//! - `journal`: CRC32C-framed entries, rotation, flush/fsync policies
//! - `reader`: replay with checksum validation and torn-tail detection
//! - `snapshot`: `LedgerState` snapshots (SHA-256, optional zstd)
//! - `store`: `TradeStore` trait with memory, journal and SQLite backends

pub mod journal;
pub mod reader;
pub mod snapshot;
pub mod store;

pub use snapshot::{LedgerState, StreamFault};
pub use store::{InsertOutcome, JournalStore, MemoryStore, SqliteConfig, SqliteStore, TradeStore};
