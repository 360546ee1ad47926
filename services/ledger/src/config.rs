//! Service configuration
//!
//! Loaded from a JSON file, then overridden by `LEDGER_*` environment
//! variables. Every field has a default, so an empty file (or none) is a
//! valid configuration.

use crate::retry::RetryPolicy;
use persistence::journal::{FlushPolicy, FsyncPolicy, JournalConfig};
use persistence::store::{JournalStore, MemoryStore, SqliteConfig, SqliteStore, TradeStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use types::errors::StorageError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Journal file sizing and durability.
///
/// The defaults fsync every commit before it is acknowledged. Relaxing
/// either policy trades the durability of the newest commits for
/// throughput: an acknowledged commit still in the page cache is lost on
/// power failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalOptions {
    /// Rotate to a new file past this many bytes
    pub max_file_size: u64,
    /// Refuse appends past this many bytes in total (0 = unlimited)
    pub max_total_size: u64,
    pub flush_policy: FlushPolicy,
    pub fsync_policy: FsyncPolicy,
}

impl Default for JournalOptions {
    fn default() -> Self {
        let base = JournalConfig::new(PathBuf::new());
        Self {
            max_file_size: base.max_file_size,
            max_total_size: base.max_total_size,
            flush_policy: base.flush_policy,
            fsync_policy: base.fsync_policy,
        }
    }
}

impl JournalOptions {
    pub fn journal_config(&self, dir: &Path) -> JournalConfig {
        JournalConfig {
            max_file_size: self.max_file_size,
            max_total_size: self.max_total_size,
            flush_policy: self.flush_policy,
            fsync_policy: self.fsync_policy,
            ..JournalConfig::new(dir)
        }
    }
}

/// Which `TradeStore` backend to open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    Journal {
        dir: PathBuf,
        #[serde(default)]
        options: JournalOptions,
    },
    Sqlite {
        path: PathBuf,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Journal {
            dir: PathBuf::from("data/journal"),
            options: JournalOptions::default(),
        }
    }
}

impl StoreConfig {
    /// Open the configured backend.
    pub fn open(&self) -> Result<Arc<dyn TradeStore>, StorageError> {
        let store: Arc<dyn TradeStore> = match self {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::Journal { dir, options } => {
                Arc::new(JournalStore::open(options.journal_config(dir))?)
            }
            StoreConfig::Sqlite { path } => Arc::new(SqliteStore::open(&SqliteConfig::new(path))?),
        };
        Ok(store)
    }
}

/// Backoff for transient storage faults on the ingest path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 50,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.initial_delay_ms,
            self.max_delay_ms,
            self.backoff_multiplier,
            self.jitter_factor,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub store: StoreConfig,
    /// Where position snapshots go; `None` disables snapshots
    pub snapshot_dir: Option<PathBuf>,
    /// Snapshot every N commit sequences (0 disables)
    pub snapshot_interval: u64,
    pub snapshot_compress: bool,
    /// Snapshots kept on disk
    pub snapshot_retain: usize,
    /// Trades fetched per consumer poll
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub retry: RetryConfig,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            snapshot_dir: Some(PathBuf::from("data/snapshots")),
            snapshot_interval: 10_000,
            snapshot_compress: true,
            snapshot_retain: 3,
            batch_size: 1_000,
            poll_interval_ms: 250,
            retry: RetryConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Apply `LEDGER_*` overrides read through `lookup`.
    ///
    /// `LEDGER_STORE` selects the backend (`memory`, `journal`, `sqlite`) and
    /// `LEDGER_STORE_PATH` its directory or database file.
    /// `LEDGER_JOURNAL_FSYNC_EVERY` sets the journal fsync cadence: 1 every
    /// commit, N every N commits, 0 only on rotation.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let store_path = lookup("LEDGER_STORE_PATH").map(PathBuf::from);
        if let Some(backend) = lookup("LEDGER_STORE") {
            self.store = match backend.to_ascii_lowercase().as_str() {
                "memory" => StoreConfig::Memory,
                "journal" => StoreConfig::Journal {
                    dir: store_path.clone().unwrap_or_else(|| PathBuf::from("data/journal")),
                    options: JournalOptions::default(),
                },
                "sqlite" => StoreConfig::Sqlite {
                    path: store_path.clone().unwrap_or_else(|| PathBuf::from("data/ledger.db")),
                },
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "LEDGER_STORE".into(),
                        value: backend,
                    })
                }
            };
        } else if let Some(path) = store_path {
            match &mut self.store {
                StoreConfig::Journal { dir, .. } => *dir = path,
                StoreConfig::Sqlite { path: db } => *db = path,
                StoreConfig::Memory => {}
            }
        }

        if let Some(dir) = lookup("LEDGER_SNAPSHOT_DIR") {
            self.snapshot_dir = if dir.is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
        if let Some(v) = parse_env(&lookup, "LEDGER_SNAPSHOT_INTERVAL")? {
            self.snapshot_interval = v;
        }
        if let Some(v) = parse_env(&lookup, "LEDGER_BATCH_SIZE")? {
            self.batch_size = v;
        }
        if let Some(v) = parse_env(&lookup, "LEDGER_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "LEDGER_MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        if let Some(v) = parse_env::<_, usize>(&lookup, "LEDGER_JOURNAL_FSYNC_EVERY")? {
            if let StoreConfig::Journal { options, .. } = &mut self.store {
                options.fsync_policy = match v {
                    0 => FsyncPolicy::OnRotation,
                    1 => FsyncPolicy::EveryWrite,
                    n => FsyncPolicy::EveryN(n),
                };
            }
        }
        if let Some(filter) = lookup("LEDGER_LOG") {
            self.log_filter = filter;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if let StoreConfig::Journal { options, .. } = &self.store {
            if options.max_file_size == 0 {
                return Err(ConfigError::Invalid("store.options.max_file_size must be positive".into()));
            }
            if matches!(options.flush_policy, FlushPolicy::EveryN(0))
                || matches!(options.fsync_policy, FsyncPolicy::EveryN(0))
            {
                return Err(ConfigError::Invalid("journal policy interval must be positive".into()));
            }
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::Invalid(
                "retry.jitter_factor must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_env<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
    }
}
