//! Ingest service
//!
//! The connector-facing entry point: dedup key check, validation against
//! the exchange registry, then an idempotent write with retry on transient
//! storage faults. Shared by every connector task through an `Arc`.

use crate::retry::{execute_with_retry, RetryPolicy};
use crate::validator::{validate, ExchangeRegistry};
use crate::writer::{IdempotentWriter, WriteOutcome};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};
use types::errors::{IngestError, StorageError, ValidationError};
use types::ids::DedupKey;
use types::trade::{InboundTrade, TradeCandidate, ValidatedTrade};

/// Point-in-time ingest counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub committed: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    committed: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug)]
pub struct IngestService {
    writer: IdempotentWriter,
    registry: RwLock<ExchangeRegistry>,
    retry: RetryPolicy,
    counters: Counters,
}

impl IngestService {
    /// Build the service with a registry loaded from the writer's store.
    pub async fn new(writer: IdempotentWriter, retry: RetryPolicy) -> Result<Self, StorageError> {
        let service = Self {
            writer,
            registry: RwLock::new(ExchangeRegistry::new()),
            retry,
            counters: Counters::default(),
        };
        service.refresh_registry().await?;
        Ok(service)
    }

    pub fn writer(&self) -> &IdempotentWriter {
        &self.writer
    }

    pub fn commit_signal(&self) -> Arc<Notify> {
        self.writer.commit_signal()
    }

    /// Reload exchanges from the store.
    pub async fn refresh_registry(&self) -> Result<(), StorageError> {
        let store = Arc::clone(self.writer.store());
        let loaded = tokio::task::spawn_blocking(move || ExchangeRegistry::load(store.as_ref()))
            .await
            .map_err(|e| StorageError::permanent(format!("registry load task failed: {e}")))??;
        *self.registry.write().await = loaded;
        Ok(())
    }

    /// Ingest one connector delivery.
    pub async fn ingest(&self, inbound: &InboundTrade) -> Result<WriteOutcome, IngestError> {
        let key = match DedupKey::try_new(&inbound.dedup_key) {
            Some(key) => key,
            None => {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                let err = ValidationError::InvalidDedupKey(inbound.dedup_key.clone());
                warn!(error = %err, "Trade rejected");
                return Err(err.into());
            }
        };
        self.submit(key, &inbound.trade).await
    }

    /// Validate and persist a candidate under `key`.
    pub async fn submit(
        &self,
        key: DedupKey,
        candidate: &TradeCandidate,
    ) -> Result<WriteOutcome, IngestError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let validated = match self.admit(candidate).await {
            Ok(v) => v,
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    dedup_key = %key,
                    exchange_id = %candidate.exchange_id,
                    error = %e,
                    "Trade rejected"
                );
                return Err(e);
            }
        };

        let result = execute_with_retry(&self.retry, || {
            let writer = self.writer.clone();
            let key = key.clone();
            let trade = validated.clone();
            async move {
                match tokio::task::spawn_blocking(move || writer.write(&key, &trade)).await {
                    Ok(written) => written,
                    Err(e) => Err(StorageError::permanent(format!("write task failed: {e}"))),
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => {
                if outcome.is_duplicate() {
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.committed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(outcome)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(dedup_key = %key, attempts = e.attempts(), error = %e, "Trade write failed");
                Err(IngestError::Storage(e.into_inner()))
            }
        }
    }

    /// Validate, refreshing the registry once if the exchange is unknown.
    async fn admit(&self, candidate: &TradeCandidate) -> Result<ValidatedTrade, IngestError> {
        let first = validate(candidate, &*self.registry.read().await);
        match first {
            Err(ValidationError::UnknownExchange(id)) => {
                debug!(exchange_id = %id, "Unknown exchange, refreshing registry");
                self.refresh_registry().await?;
                Ok(validate(candidate, &*self.registry.read().await)?)
            }
            other => Ok(other?),
        }
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            received: self.counters.received.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let s = self.stats();
        info!(
            received = s.received,
            committed = s.committed,
            duplicates = s.duplicates,
            rejected = s.rejected,
            failed = s.failed,
            "Ingest stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistence::store::{MemoryStore, TradeStore};
    use types::exchange::NewExchange;
    use types::ids::ExchangeId;

    async fn service() -> (IngestService, Arc<dyn TradeStore>, ExchangeId) {
        let store: Arc<dyn TradeStore> = Arc::new(MemoryStore::new());
        let ex = store.register_exchange(&NewExchange::new("binance")).unwrap();
        let service = IngestService::new(IdempotentWriter::new(Arc::clone(&store)), RetryPolicy::no_retry())
            .await
            .unwrap();
        (service, store, ex.id)
    }

    fn inbound(key: &str, exchange_id: ExchangeId, qty: &str) -> InboundTrade {
        serde_json::from_value(serde_json::json!({
            "dedup_key": key,
            "exchange_id": exchange_id.value(),
            "symbol": "btc/usdt",
            "side": "buy",
            "quantity": qty,
            "price": "64000.5",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_ingest_commits_and_dedups() {
        let (service, store, ex) = service().await;

        let first = service.ingest(&inbound("fill-1", ex, "0.25")).await.unwrap();
        let second = service.ingest(&inbound("fill-1", ex, "0.25")).await.unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(store.latest_sequence().unwrap(), 1);

        let stats = service.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[tokio::test]
    async fn test_rejections_are_counted() {
        let (service, _, ex) = service().await;

        let err = service.ingest(&inbound("fill-1", ex, "0")).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Rejected(ValidationError::NonPositiveQuantity(_))
        ));

        let err = service.ingest(&inbound("  ", ex, "1")).await.unwrap_err();
        assert!(matches!(err, IngestError::Rejected(ValidationError::InvalidDedupKey(_))));
        assert!(!err.is_retryable());

        assert_eq!(service.stats().rejected, 2);
    }

    #[tokio::test]
    async fn test_exchange_registered_after_start_is_found() {
        let (service, store, _) = service().await;
        let late = store.register_exchange(&NewExchange::new("kraken")).unwrap();

        let outcome = service.ingest(&inbound("kr-1", late.id, "2")).await.unwrap();
        assert_eq!(outcome.trade().exchange_id, late.id);
    }

    #[tokio::test]
    async fn test_unknown_exchange_rejected() {
        let (service, _, _) = service().await;
        let err = service
            .ingest(&inbound("x-1", ExchangeId::new(999), "2"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            IngestError::Rejected(ValidationError::UnknownExchange(ExchangeId::new(999)))
        );
    }
}
