//! Recovery Flow: Boot the position view from snapshot + trade replay
//!
//! Recovery process:
//! 1. List snapshots, newest first
//! 2. Load the newest one that passes its integrity check
//! 3. Replay every committed trade after its commit marker
//! 4. Optionally compare against a full replay from the first trade
//!
//! A corrupted snapshot is never trusted: recovery falls back to an older
//! one, or to an empty view.

use crate::aggregator::{FoldStats, PositionView};
use crate::validator::ExchangeRegistry;
use persistence::snapshot::{
    LedgerState, Snapshot, SnapshotCleanupPolicy, SnapshotError, SnapshotLoader, SnapshotWriter,
};
use persistence::store::TradeStore;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};
use types::errors::{LedgerError, StorageError};
use types::position::PositionKey;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("State hash divergence at commit marker {commit_marker}: {detail}")]
    HashDivergence { commit_marker: u64, detail: String },
}

// ── Recovery Metrics ────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RecoveryMetrics {
    pub snapshot_load_time_ms: u64,
    /// Commit marker of the loaded snapshot (0 if none)
    pub snapshot_sequence: u64,
    /// Snapshots skipped because they failed to load
    pub snapshots_rejected: u64,
    pub replay_count: u64,
    pub replay_time_ms: u64,
    pub total_recovery_time_ms: u64,
    pub fold: FoldStats,
    pub final_state_hash: String,
    pub final_sequence: u64,
}

// ── Recovery Log ────────────────────────────────────────────────────

/// Structured recovery log entry for diagnostics.
#[derive(Debug, Clone)]
pub struct RecoveryLogEntry {
    pub stage: RecoveryStage,
    pub message: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStage {
    Start,
    SnapshotSearch,
    SnapshotLoad,
    SnapshotRejected,
    Replay,
    Validation,
    Complete,
}

// ── Divergence Report ───────────────────────────────────────────────

/// Comparison of two views that should be identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivergenceReport {
    pub hash_a: String,
    pub hash_b: String,
    pub positions_match: bool,
    pub faults_match: bool,
    pub marker_match: bool,
    /// Keys whose position or fault differs, ordered
    pub differing_keys: Vec<PositionKey>,
    pub detail: String,
}

impl DivergenceReport {
    pub fn compare(a: &LedgerState, b: &LedgerState) -> Self {
        let positions_match = a.positions == b.positions;
        let faults_match = a.faults == b.faults;
        let marker_match = a.commit_marker == b.commit_marker;

        let keys: BTreeSet<&PositionKey> = a
            .positions
            .keys()
            .chain(b.positions.keys())
            .chain(a.faults.keys())
            .chain(b.faults.keys())
            .collect();
        let differing_keys: Vec<PositionKey> = keys
            .into_iter()
            .filter(|k| a.positions.get(*k) != b.positions.get(*k) || a.faults.get(*k) != b.faults.get(*k))
            .cloned()
            .collect();

        let mut details = Vec::new();
        if !positions_match {
            details.push(format!(
                "Positions differ: {} vs {} entries",
                a.positions.len(),
                b.positions.len()
            ));
        }
        if !faults_match {
            details.push(format!(
                "Faults differ: {} vs {} entries",
                a.faults.len(),
                b.faults.len()
            ));
        }
        if !marker_match {
            details.push(format!(
                "Commit markers differ: {} vs {}",
                a.commit_marker, b.commit_marker
            ));
        }
        if !differing_keys.is_empty() {
            let keys: Vec<String> = differing_keys.iter().map(|k| k.to_string()).collect();
            details.push(format!("Keys: {}", keys.join(", ")));
        }

        Self {
            hash_a: a.compute_hash(),
            hash_b: b.compute_hash(),
            positions_match,
            faults_match,
            marker_match,
            differing_keys,
            detail: if details.is_empty() {
                "States are identical".to_string()
            } else {
                details.join("; ")
            },
        }
    }

    pub fn is_match(&self) -> bool {
        self.hash_a == self.hash_b
    }
}

// ── Recovery Engine ─────────────────────────────────────────────────

/// Orchestrates snapshot loading and trade replay.
pub struct RecoveryEngine {
    snapshot_dir: Option<PathBuf>,
    compress: bool,
    log: Vec<RecoveryLogEntry>,
}

impl RecoveryEngine {
    /// `snapshot_dir: None` always replays from the first trade.
    pub fn new(snapshot_dir: Option<PathBuf>, compress: bool) -> Self {
        Self {
            snapshot_dir,
            compress,
            log: Vec::new(),
        }
    }

    /// Restore the view: newest valid snapshot plus every trade after it.
    pub fn recover(
        &mut self,
        store: &dyn TradeStore,
        exchanges: &mut ExchangeRegistry,
        batch_size: usize,
    ) -> Result<(PositionView, RecoveryMetrics), RecoveryError> {
        let total_start = Instant::now();
        let mut metrics = RecoveryMetrics::default();
        self.log_stage(RecoveryStage::Start, "Recovery started", 0);

        let view = self.load_snapshot(&mut metrics);
        let view = self.replay_tail(view, store, exchanges, batch_size, &mut metrics)?;

        metrics.total_recovery_time_ms = total_start.elapsed().as_millis() as u64;
        metrics.final_state_hash = view.state_hash();
        metrics.final_sequence = view.commit_marker();

        self.log_stage(
            RecoveryStage::Complete,
            &format!(
                "Recovery complete: {} trades in {}ms, commit marker={}",
                metrics.replay_count, metrics.total_recovery_time_ms, metrics.final_sequence
            ),
            metrics.total_recovery_time_ms,
        );
        info!(
            snapshot_sequence = metrics.snapshot_sequence,
            replayed = metrics.replay_count,
            commit_marker = metrics.final_sequence,
            faults = view.faults().len(),
            elapsed_ms = metrics.total_recovery_time_ms,
            "Position view recovered"
        );
        Ok((view, metrics))
    }

    /// Recover, then check the result against a full replay.
    pub fn recover_verified(
        &mut self,
        store: &dyn TradeStore,
        exchanges: &mut ExchangeRegistry,
        batch_size: usize,
    ) -> Result<(PositionView, RecoveryMetrics), RecoveryError> {
        let (view, metrics) = self.recover(store, exchanges, batch_size)?;
        self.log_stage(RecoveryStage::Validation, "Comparing against full replay", 0);

        let report = self.verify(&view, store, exchanges, batch_size)?;
        if !report.is_match() {
            return Err(RecoveryError::HashDivergence {
                commit_marker: view.commit_marker(),
                detail: report.detail,
            });
        }
        Ok((view, metrics))
    }

    /// Full replay from the first committed trade, ignoring snapshots.
    pub fn rebuild(
        &mut self,
        store: &dyn TradeStore,
        exchanges: &mut ExchangeRegistry,
        batch_size: usize,
    ) -> Result<PositionView, RecoveryError> {
        let mut metrics = RecoveryMetrics::default();
        self.replay_tail(PositionView::new(), store, exchanges, batch_size, &mut metrics)
    }

    /// Compare `view` with a full replay up to the same commit marker.
    pub fn verify(
        &mut self,
        view: &PositionView,
        store: &dyn TradeStore,
        exchanges: &mut ExchangeRegistry,
        batch_size: usize,
    ) -> Result<DivergenceReport, RecoveryError> {
        let mut replayed = PositionView::new();
        let mut after = 0;
        let target = view.commit_marker();

        while after < target {
            let batch = store.trades_after(after, batch_size)?;
            let Some(last) = batch.last().map(|t| t.sequence) else {
                break;
            };
            let upto: Vec<_> = batch.into_iter().filter(|t| t.sequence <= target).collect();
            exchanges.refresh_for(&upto, store)?;
            replayed.fold_all(&upto, exchanges)?;
            after = last;
        }
        replayed.advance_marker(target.min(after));

        let report = DivergenceReport::compare(view.state(), replayed.state());
        if report.is_match() {
            info!(commit_marker = target, hash = %report.hash_a, "View matches full replay");
        } else {
            warn!(commit_marker = target, detail = %report.detail, "View diverges from full replay");
        }
        Ok(report)
    }

    /// Write a snapshot of `view` and prune old ones.
    pub fn take_snapshot(
        &self,
        view: &PositionView,
        timestamp: i64,
        retain: usize,
    ) -> Result<Option<PathBuf>, RecoveryError> {
        let Some(dir) = &self.snapshot_dir else {
            return Ok(None);
        };
        let snapshot = Snapshot::new(timestamp, view.state().clone(), self.compress);
        let path = SnapshotWriter::new(dir, self.compress).write(&snapshot)?;
        if retain > 0 {
            SnapshotCleanupPolicy::new(retain).cleanup(dir)?;
        }
        Ok(Some(path))
    }

    pub fn log(&self) -> &[RecoveryLogEntry] {
        &self.log
    }

    // ── Internal ────────────────────────────────────────────────────

    fn load_snapshot(&mut self, metrics: &mut RecoveryMetrics) -> PositionView {
        let Some(dir) = self.snapshot_dir.clone() else {
            return PositionView::new();
        };
        self.log_stage(RecoveryStage::SnapshotSearch, "Searching for snapshots", 0);
        let loader = SnapshotLoader::new(&dir);

        let candidates = match loader.list_snapshots() {
            Ok(list) => list,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot list snapshots, replaying from start");
                return PositionView::new();
            }
        };

        for (sequence, path) in candidates.into_iter().rev() {
            let start = Instant::now();
            match loader.load(&path) {
                Ok(snapshot) => {
                    metrics.snapshot_load_time_ms = start.elapsed().as_millis() as u64;
                    metrics.snapshot_sequence = snapshot.sequence;
                    self.log_stage(
                        RecoveryStage::SnapshotLoad,
                        &format!(
                            "Snapshot loaded: seq={}, hash={}",
                            snapshot.sequence,
                            snapshot.checksum.get(..16).unwrap_or(&snapshot.checksum)
                        ),
                        metrics.snapshot_load_time_ms,
                    );
                    return PositionView::from_state(snapshot.state);
                }
                Err(e) => {
                    metrics.snapshots_rejected += 1;
                    warn!(path = %path.display(), sequence, error = %e, "Snapshot rejected");
                    self.log_stage(
                        RecoveryStage::SnapshotRejected,
                        &format!("Snapshot {} rejected: {}", path.display(), e),
                        0,
                    );
                }
            }
        }

        self.log_stage(
            RecoveryStage::SnapshotSearch,
            "No usable snapshot, starting from empty view",
            0,
        );
        PositionView::new()
    }

    fn replay_tail(
        &mut self,
        mut view: PositionView,
        store: &dyn TradeStore,
        exchanges: &mut ExchangeRegistry,
        batch_size: usize,
        metrics: &mut RecoveryMetrics,
    ) -> Result<PositionView, RecoveryError> {
        let start = Instant::now();
        self.log_stage(
            RecoveryStage::Replay,
            &format!("Replaying trades after {}", view.commit_marker()),
            0,
        );

        loop {
            let batch = store.trades_after(view.commit_marker(), batch_size.max(1))?;
            let Some(last) = batch.last().map(|t| t.sequence) else {
                break;
            };
            exchanges.refresh_for(&batch, store)?;
            let stats = view.fold_all(&batch, exchanges)?;
            view.advance_marker(last);
            metrics.fold.merge(stats);
            metrics.replay_count += batch.len() as u64;
        }

        metrics.replay_time_ms = start.elapsed().as_millis() as u64;
        self.log_stage(
            RecoveryStage::Replay,
            &format!(
                "Replayed {} trades in {}ms",
                metrics.replay_count, metrics.replay_time_ms
            ),
            metrics.replay_time_ms,
        );
        Ok(view)
    }

    fn log_stage(&mut self, stage: RecoveryStage, message: &str, elapsed_ms: u64) {
        self.log.push(RecoveryLogEntry {
            stage,
            message: message.to_string(),
            elapsed_ms,
        });
    }
}
