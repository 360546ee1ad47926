//! Aggregation consumer
//!
//! Tails the trade store in commit order and keeps the published position
//! view current. Each batch is partitioned by (exchange, symbol); partitions
//! fold in parallel on the blocking pool, then merge, and only then does the
//! commit marker move. A failed batch leaves the published view untouched.

use crate::aggregator::{FoldStats, PositionView};
use crate::config::LedgerConfig;
use crate::recovery::{RecoveryEngine, RecoveryError, RecoveryMetrics};
use crate::validator::ExchangeRegistry;
use persistence::snapshot::SnapshotIntervalPolicy;
use persistence::store::TradeStore;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use types::errors::{LedgerError, StorageError};
use types::position::PositionKey;
use types::trade::Trade;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Fold task failed: {0}")]
    Join(#[from] JoinError),
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Trades fetched per step
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub snapshot_dir: Option<PathBuf>,
    /// Snapshot every N commit sequences (0 disables)
    pub snapshot_interval: u64,
    pub snapshot_compress: bool,
    pub snapshot_retain: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            poll_interval: Duration::from_millis(250),
            snapshot_dir: None,
            snapshot_interval: 0,
            snapshot_compress: true,
            snapshot_retain: 3,
        }
    }
}

impl From<&LedgerConfig> for ConsumerConfig {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
            snapshot_dir: config.snapshot_dir.clone(),
            snapshot_interval: config.snapshot_interval,
            snapshot_compress: config.snapshot_compress,
            snapshot_retain: config.snapshot_retain,
        }
    }
}

/// What one `step` consumed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    pub fetched: usize,
    pub partitions: usize,
    pub stats: FoldStats,
    pub commit_marker: u64,
}

pub struct AggregationConsumer {
    store: Arc<dyn TradeStore>,
    registry: Arc<ExchangeRegistry>,
    config: ConsumerConfig,
    view: Arc<PositionView>,
    snapshots: SnapshotIntervalPolicy,
    publisher: watch::Sender<Arc<PositionView>>,
    commits: Arc<Notify>,
}

impl AggregationConsumer {
    /// Recover the view (snapshot + tail) and get ready to consume.
    pub async fn start(
        store: Arc<dyn TradeStore>,
        commits: Arc<Notify>,
        config: ConsumerConfig,
    ) -> Result<(Self, RecoveryMetrics), ConsumerError> {
        let registry = load_registry(&store).await?;

        let (view, metrics, registry) = {
            let store = Arc::clone(&store);
            let dir = config.snapshot_dir.clone();
            let compress = config.snapshot_compress;
            let batch_size = config.batch_size;
            tokio::task::spawn_blocking(move || {
                let mut registry = registry;
                RecoveryEngine::new(dir, compress)
                    .recover(store.as_ref(), &mut registry, batch_size)
                    .map(|(view, metrics)| (view, metrics, registry))
            })
            .await??
        };

        let mut snapshots = SnapshotIntervalPolicy::with_interval(config.snapshot_interval);
        snapshots.record_snapshot(metrics.snapshot_sequence);

        let view = Arc::new(view);
        let (publisher, _) = watch::channel(Arc::clone(&view));

        let mut consumer = Self {
            store,
            registry: Arc::new(registry),
            config,
            view,
            snapshots,
            publisher,
            commits,
        };
        // The replayed tail counts toward the interval like any other batch
        consumer.maybe_snapshot().await;
        Ok((consumer, metrics))
    }

    /// Receive every published view.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PositionView>> {
        self.publisher.subscribe()
    }

    pub fn view(&self) -> Arc<PositionView> {
        Arc::clone(&self.view)
    }

    pub fn commit_marker(&self) -> u64 {
        self.view.commit_marker()
    }

    /// Consume one batch of committed trades.
    pub async fn step(&mut self) -> Result<StepReport, ConsumerError> {
        let after = self.view.commit_marker();
        let batch = {
            let store = Arc::clone(&self.store);
            let limit = self.config.batch_size.max(1);
            tokio::task::spawn_blocking(move || store.trades_after(after, limit)).await??
        };
        let Some(last) = batch.last().map(|t| t.sequence) else {
            return Ok(StepReport {
                commit_marker: after,
                ..StepReport::default()
            });
        };
        let fetched = batch.len();

        if batch.iter().any(|t| !self.registry.contains(t.exchange_id)) {
            self.registry = Arc::new(load_registry(&self.store).await?);
        }

        let mut partitions: BTreeMap<PositionKey, Vec<Trade>> = BTreeMap::new();
        for trade in batch {
            partitions.entry(PositionKey::of(&trade)).or_default().push(trade);
        }
        let partition_count = partitions.len();

        let mut next = PositionView::clone(&self.view);
        let mut tasks = JoinSet::new();
        for (key, trades) in partitions {
            let mut part = next.split_off(&key);
            let registry = Arc::clone(&self.registry);
            tasks.spawn_blocking(move || {
                let result = part.fold_all(&trades, registry.as_ref());
                (part, result)
            });
        }

        let mut stats = FoldStats::default();
        while let Some(joined) = tasks.join_next().await {
            let (part, result) = joined?;
            stats.merge(result?);
            next.absorb(part);
        }
        next.advance_marker(last);

        self.view = Arc::new(next);
        self.publisher.send_replace(Arc::clone(&self.view));

        debug!(
            fetched,
            partitions = partition_count,
            folded = stats.folded,
            faulted = stats.faulted,
            commit_marker = last,
            "Batch folded"
        );

        self.maybe_snapshot().await;

        Ok(StepReport {
            fetched,
            partitions: partition_count,
            stats,
            commit_marker: last,
        })
    }

    /// Step until the store has nothing newer than the commit marker.
    pub async fn catch_up(&mut self) -> Result<u64, ConsumerError> {
        let mut consumed = 0u64;
        loop {
            let report = self.step().await?;
            if report.fetched == 0 {
                return Ok(consumed);
            }
            consumed += report.fetched as u64;
        }
    }

    /// Consume until `shutdown` flips to true or its sender is dropped.
    ///
    /// Wakes on commit notifications and on the poll interval. Transient
    /// storage faults are logged and retried on the next wake-up.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let commits = Arc::clone(&self.commits);

        info!(
            backend = self.store.backend(),
            commit_marker = self.commit_marker(),
            "Aggregation consumer running"
        );

        loop {
            match self.catch_up().await {
                Ok(0) => {}
                Ok(consumed) => info!(consumed, commit_marker = self.commit_marker(), "Caught up"),
                Err(ConsumerError::Storage(e)) if e.is_retryable() => {
                    warn!(error = %e, "Transient storage fault, retrying on next poll");
                }
                Err(e) => return Err(e),
            }

            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = commits.notified() => {}
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if self.snapshots.last_snapshot_seq < self.commit_marker() {
            self.write_snapshot().await;
        }
        info!(commit_marker = self.commit_marker(), "Aggregation consumer stopped");
        Ok(())
    }

    /// Write a snapshot now, regardless of the interval.
    pub async fn snapshot_now(&mut self) -> Option<PathBuf> {
        self.write_snapshot().await
    }

    async fn maybe_snapshot(&mut self) {
        if self.snapshots.should_snapshot(self.view.commit_marker()) {
            self.write_snapshot().await;
        }
    }

    async fn write_snapshot(&mut self) -> Option<PathBuf> {
        self.config.snapshot_dir.as_ref()?;

        let view = Arc::clone(&self.view);
        let dir = self.config.snapshot_dir.clone();
        let compress = self.config.snapshot_compress;
        let retain = self.config.snapshot_retain;
        let marker = view.commit_marker();

        let written = tokio::task::spawn_blocking(move || {
            RecoveryEngine::new(dir, compress).take_snapshot(&view, types::now_nanos(), retain)
        })
        .await;

        match written {
            Ok(Ok(path)) => {
                self.snapshots.record_snapshot(marker);
                path
            }
            Ok(Err(e)) => {
                warn!(commit_marker = marker, error = %e, "Snapshot failed");
                None
            }
            Err(e) => {
                warn!(commit_marker = marker, error = %e, "Snapshot task failed");
                None
            }
        }
    }
}

async fn load_registry(store: &Arc<dyn TradeStore>) -> Result<ExchangeRegistry, ConsumerError> {
    let store = Arc::clone(store);
    let registry = tokio::task::spawn_blocking(move || ExchangeRegistry::load(store.as_ref())).await??;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::IdempotentWriter;
    use persistence::store::MemoryStore;
    use persistence::snapshot::SnapshotLoader;
    use rust_decimal::Decimal;
    use tempfile::TempDir;
    use types::exchange::NewExchange;
    use types::ids::{DedupKey, ExchangeId, Symbol};
    use types::numeric::{Price, Quantity};
    use types::side::Side;
    use types::trade::ValidatedTrade;

    fn trade(exchange_id: ExchangeId, symbol: &str, side: Side, qty: u64, price: u64) -> ValidatedTrade {
        ValidatedTrade {
            exchange_id,
            user_id: None,
            symbol: Symbol::new(symbol),
            side,
            quantity: Quantity::from_u64(qty),
            price: Price::from_u64(price),
            fee: Decimal::ZERO,
            timestamp: None,
        }
    }

    fn key(n: u64) -> DedupKey {
        DedupKey::try_new(format!("fill-{n}")).unwrap()
    }

    fn setup() -> (IdempotentWriter, ExchangeId) {
        let store = Arc::new(MemoryStore::new());
        let ex = store.register_exchange(&NewExchange::new("binance")).unwrap();
        (IdempotentWriter::new(store), ex.id)
    }

    fn config(batch_size: usize) -> ConsumerConfig {
        ConsumerConfig {
            batch_size,
            poll_interval: Duration::from_millis(10),
            ..ConsumerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_catch_up_folds_commits() {
        let (writer, ex) = setup();
        writer.write(&key(1), &trade(ex, "BTC", Side::BUY, 10, 100)).unwrap();
        writer.write(&key(2), &trade(ex, "BTC", Side::SELL, 4, 110)).unwrap();

        let (mut consumer, metrics) =
            AggregationConsumer::start(writer.store().clone(), writer.commit_signal(), config(2))
                .await
                .unwrap();
        assert_eq!(metrics.replay_count, 2);
        assert_eq!(consumer.commit_marker(), 2);

        writer.write(&key(3), &trade(ex, "ETH", Side::BUY, 1, 10)).unwrap();
        writer.write(&key(4), &trade(ex, "ETH", Side::BUY, 3, 14)).unwrap();
        writer.write(&key(5), &trade(ex, "ETH", Side::SELL, 2, 20)).unwrap();
        consumer.catch_up().await.unwrap();

        let view = consumer.view();
        assert_eq!(view.commit_marker(), 5);
        let btc = view.position(ex, &Symbol::new("BTC")).unwrap();
        assert_eq!(btc.quantity, Decimal::from(6));
        assert_eq!(btc.realized_pnl, Decimal::from(40));
        let eth = view.position(ex, &Symbol::new("ETH")).unwrap();
        assert_eq!(eth.quantity, Decimal::from(2));
        assert_eq!(eth.average_price, Decimal::from(13));
        assert_eq!(eth.realized_pnl, Decimal::from(14));
    }

    #[tokio::test]
    async fn test_overflowing_trade_halts_its_stream_only() {
        let (writer, ex) = setup();
        writer.write(&key(1), &trade(ex, "ETH", Side::BUY, 1, 10)).unwrap();
        let huge = ValidatedTrade {
            quantity: Quantity::from_str("1000000000000000").unwrap(),
            price: Price::from_str("1000000000000000").unwrap(),
            ..trade(ex, "BTC", Side::BUY, 1, 1)
        };
        writer.write(&key(2), &huge).unwrap();

        let (mut consumer, metrics) =
            AggregationConsumer::start(writer.store().clone(), writer.commit_signal(), config(10))
                .await
                .unwrap();
        assert_eq!(metrics.fold.faulted, 1);

        writer.write(&key(3), &trade(ex, "ETH", Side::BUY, 1, 20)).unwrap();
        writer.write(&key(4), &trade(ex, "BTC", Side::BUY, 1, 20)).unwrap();
        let report = consumer.step().await.unwrap();
        assert_eq!(report.stats.folded, 1);
        assert_eq!(report.stats.faulted, 1);

        let view = consumer.view();
        assert_eq!(view.commit_marker(), 4);
        assert!(view.is_halted(&PositionKey::new(ex, Symbol::new("BTC"))));
        assert_eq!(view.position(ex, &Symbol::new("ETH")).unwrap().quantity, Decimal::from(2));
    }

    #[tokio::test]
    async fn test_parallel_fold_matches_replay() {
        let (writer, ex) = setup();
        for n in 1..=40u64 {
            let symbol = ["BTC", "ETH", "SOL"][(n % 3) as usize];
            let side = if n % 4 == 0 { Side::SELL } else { Side::BUY };
            writer.write(&key(n), &trade(ex, symbol, side, n % 7 + 1, 100 + n)).unwrap();
        }

        let (mut consumer, _) =
            AggregationConsumer::start(writer.store().clone(), writer.commit_signal(), config(9))
                .await
                .unwrap();
        consumer.catch_up().await.unwrap();

        let store = writer.store();
        let trades = store.trades_after(0, 100).unwrap();
        let registry = ExchangeRegistry::load(store.as_ref()).unwrap();
        let replayed = PositionView::replay(&trades, &registry).unwrap();
        assert_eq!(consumer.view().state_hash(), replayed.state_hash());
    }

    #[tokio::test]
    async fn test_subscribers_see_new_views() {
        let (writer, ex) = setup();
        let (mut consumer, _) =
            AggregationConsumer::start(writer.store().clone(), writer.commit_signal(), config(10))
                .await
                .unwrap();
        let mut rx = consumer.subscribe();

        writer.write(&key(1), &trade(ex, "BTC", Side::BUY, 1, 100)).unwrap();
        consumer.step().await.unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().commit_marker(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_at_interval_and_resume() {
        let tmp = TempDir::new().unwrap();
        let (writer, ex) = setup();
        for n in 1..=10u64 {
            writer.write(&key(n), &trade(ex, "BTC", Side::BUY, 1, 100 + n)).unwrap();
        }

        let cfg = ConsumerConfig {
            snapshot_dir: Some(tmp.path().to_path_buf()),
            snapshot_interval: 5,
            snapshot_compress: false,
            ..config(5)
        };
        let (mut consumer, _) =
            AggregationConsumer::start(writer.store().clone(), writer.commit_signal(), cfg.clone())
                .await
                .unwrap();
        consumer.catch_up().await.unwrap();
        let hash = consumer.view().state_hash();

        let latest = SnapshotLoader::new(tmp.path()).load_latest().unwrap();
        assert_eq!(latest.sequence, 10);

        let (resumed, metrics) =
            AggregationConsumer::start(writer.store().clone(), writer.commit_signal(), cfg)
                .await
                .unwrap();
        assert_eq!(metrics.snapshot_sequence, 10);
        assert_eq!(metrics.replay_count, 0);
        assert_eq!(resumed.view().state_hash(), hash);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (writer, ex) = setup();
        let (consumer, _) =
            AggregationConsumer::start(writer.store().clone(), writer.commit_signal(), config(10))
                .await
                .unwrap();
        let mut views = consumer.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(consumer.run(stop_rx));

        writer.write(&key(1), &trade(ex, "BTC", Side::BUY, 2, 100)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                views.changed().await.unwrap();
                if views.borrow().commit_marker() >= 1 {
                    break;
                }
            }
        })
        .await
        .unwrap();

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
