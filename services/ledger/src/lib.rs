//! Trade ingestion and ledger consistency service
//!
//! Connectors hand trades to the `IngestService`, which validates them and
//! commits each dedup key at most once. The `AggregationConsumer` tails the
//! store in commit order and maintains the position view, snapshotting it so
//! a restart only replays the tail.
//!
//! # Modules
//! - `config`: `LedgerConfig` from JSON + `LEDGER_*` environment
//! - `validator`: admission rules and the exchange registry
//! - `writer`: idempotent commit through a `TradeStore`
//! - `retry`: exponential backoff for transient storage faults
//! - `ingest`: connector-facing service
//! - `aggregator`: the position fold and its queries
//! - `consumer`: batched, partitioned, parallel aggregation task
//! - `recovery`: snapshot + replay boot and full-replay verification

pub mod aggregator;
pub mod config;
pub mod consumer;
pub mod ingest;
pub mod recovery;
pub mod retry;
pub mod validator;
pub mod writer;

pub use aggregator::{Applied, FoldStats, PositionView};
pub use config::{ConfigError, JournalOptions, LedgerConfig, StoreConfig};
pub use consumer::{AggregationConsumer, ConsumerConfig, ConsumerError};
pub use ingest::{IngestService, IngestStats};
pub use recovery::{DivergenceReport, RecoveryEngine, RecoveryError};
pub use validator::{validate, ExchangeLookup, ExchangeRegistry};
pub use writer::{IdempotentWriter, WriteOutcome};
