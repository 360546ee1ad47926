//! Snapshot System: Position view snapshots with integrity and compression
//!
//! A snapshot captures the aggregated position view at a commit marker, so a
//! restart only replays trades committed after it.
//!
//! Features:
//! - BTreeMap-based state for deterministic serialization
//! - SHA-256 integrity hash over serialized state
//! - Optional zstd compression
//! - Snapshot versioning for forward compatibility
//! - Interval policy (every N commits)
//! - Cleanup policy (keep last N snapshots)

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use types::ids::ExchangeId;
use types::position::{Position, PositionKey};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },

    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u32),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("No snapshots found")]
    NoSnapshots,
}

// ── Ledger State ────────────────────────────────────────────────────

/// A position stream that stopped folding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFault {
    /// Commit sequence of the trade that could not be applied
    pub sequence: u64,
    pub exchange_id: ExchangeId,
    pub reason: String,
    /// Later trades for the key that were refused while halted
    pub blocked: u64,
}

/// Aggregated state of the whole ledger.
///
/// `BTreeMap` keeps serialization (and so the hash) independent of the
/// order positions were created in.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerState {
    pub positions: BTreeMap<PositionKey, Position>,
    /// Highest commit sequence the view has consumed
    pub commit_marker: u64,
    pub faults: BTreeMap<PositionKey, StreamFault>,
}

impl LedgerState {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compute a deterministic SHA-256 hash of the state.
    pub fn compute_hash(&self) -> String {
        let bytes = bincode::serialize(self).expect("LedgerState serialization should never fail");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// The ledger state at a given commit marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Commit marker of the captured state
    pub sequence: u64,
    /// Unix nanosecond timestamp when snapshot was taken.
    pub timestamp: i64,
    pub state: LedgerState,
    /// SHA-256 hash of the serialized state.
    pub checksum: String,
    pub compressed: bool,
}

impl Snapshot {
    /// Create a new snapshot with computed integrity hash.
    pub fn new(timestamp: i64, state: LedgerState, compressed: bool) -> Self {
        let checksum = state.compute_hash();
        Self {
            version: SNAPSHOT_VERSION,
            sequence: state.commit_marker,
            timestamp,
            state,
            checksum,
            compressed,
        }
    }

    /// Verify the snapshot's integrity hash.
    pub fn verify_integrity(&self) -> bool {
        self.checksum == self.state.compute_hash()
    }
}

// ── Snapshot Writer ─────────────────────────────────────────────────

/// Writes snapshots to disk with optional zstd compression.
pub struct SnapshotWriter {
    dir: PathBuf,
    compress: bool,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            dir: dir.into(),
            compress,
        }
    }

    /// Write a snapshot atomically: write to tmp, fsync, rename.
    pub fn write(&self, snapshot: &Snapshot) -> Result<PathBuf, SnapshotError> {
        fs::create_dir_all(&self.dir)?;

        let data = bincode::serialize(snapshot)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        let (final_data, ext) = if self.compress {
            let compressed = zstd::encode_all(data.as_slice(), 3)
                .map_err(|e| SnapshotError::Compression(e.to_string()))?;
            (compressed, "snap.zst")
        } else {
            (data, "snap")
        };

        let filename = format!("snapshot-{:012}.{}", snapshot.sequence, ext);
        let path = self.dir.join(&filename);
        let tmp_path = self.dir.join(format!("{}.tmp", filename));

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&final_data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        info!(
            path = %path.display(),
            commit_marker = snapshot.sequence,
            positions = snapshot.state.positions.len(),
            bytes = final_data.len(),
            "Snapshot written"
        );
        Ok(path)
    }
}

// ── Snapshot Loader ─────────────────────────────────────────────────

/// Loads snapshots from disk, verifying integrity.
pub struct SnapshotLoader {
    dir: PathBuf,
}

impl SnapshotLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load a specific snapshot file.
    pub fn load(&self, path: &Path) -> Result<Snapshot, SnapshotError> {
        let data = fs::read(path)?;

        let is_compressed = path.extension().map(|e| e == "zst").unwrap_or(false);
        let decompressed = if is_compressed {
            zstd::decode_all(data.as_slice())
                .map_err(|e| SnapshotError::Compression(e.to_string()))?
        } else {
            data
        };

        let snapshot: Snapshot = bincode::deserialize(&decompressed)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        if snapshot.version > SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }

        if !snapshot.verify_integrity() {
            return Err(SnapshotError::IntegrityFailure {
                expected: snapshot.checksum.clone(),
                actual: snapshot.state.compute_hash(),
            });
        }

        debug!(path = %path.display(), commit_marker = snapshot.sequence, "Snapshot loaded");
        Ok(snapshot)
    }

    /// Load the latest snapshot (highest commit marker).
    pub fn load_latest(&self) -> Result<Snapshot, SnapshotError> {
        let path = self.find_latest()?;
        self.load(&path)
    }

    pub fn find_latest(&self) -> Result<PathBuf, SnapshotError> {
        self.list_snapshots()?
            .pop()
            .map(|(_, path)| path)
            .ok_or(SnapshotError::NoSnapshots)
    }

    /// List all snapshots as (sequence, path) pairs, ascending.
    pub fn list_snapshots(&self) -> Result<Vec<(u64, PathBuf)>, SnapshotError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(seq) = Self::parse_sequence(&name) {
                results.push((seq, entry.path()));
            }
        }
        results.sort_by_key(|(seq, _)| *seq);
        Ok(results)
    }

    fn parse_sequence(filename: &str) -> Option<u64> {
        let rest = filename.strip_prefix("snapshot-")?;
        let digits = rest
            .strip_suffix(".snap.zst")
            .or_else(|| rest.strip_suffix(".snap"))?;
        digits.parse::<u64>().ok()
    }
}

// ── Snapshot Interval Policy ────────────────────────────────────────

/// Decides when the consumer takes the next snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotIntervalPolicy {
    /// Snapshot every N commit sequences (0 disables).
    pub interval: u64,
    pub last_snapshot_seq: u64,
}

impl SnapshotIntervalPolicy {
    pub fn with_interval(interval: u64) -> Self {
        Self {
            interval,
            last_snapshot_seq: 0,
        }
    }

    pub fn should_snapshot(&self, current_seq: u64) -> bool {
        self.interval > 0 && current_seq >= self.last_snapshot_seq + self.interval
    }

    pub fn record_snapshot(&mut self, seq: u64) {
        self.last_snapshot_seq = seq;
    }
}

// ── Snapshot Cleanup Policy ─────────────────────────────────────────

/// Keeps only the most recent snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotCleanupPolicy {
    pub max_snapshots: usize,
}

impl SnapshotCleanupPolicy {
    pub fn new(max_snapshots: usize) -> Self {
        Self { max_snapshots }
    }

    /// Remove old snapshots, keeping only the most recent `max_snapshots`.
    pub fn cleanup(&self, dir: &Path) -> Result<Vec<PathBuf>, SnapshotError> {
        let snapshots = SnapshotLoader::new(dir).list_snapshots()?;

        let mut removed = Vec::new();
        if snapshots.len() > self.max_snapshots {
            let to_remove = snapshots.len() - self.max_snapshots;
            for (_, path) in snapshots.iter().take(to_remove) {
                fs::remove_file(path)?;
                removed.push(path.clone());
            }
        }
        Ok(removed)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
