//! Exactly-once ingestion across every store backend
//!
//! - Repeated delivery of one key yields one committed trade
//! - Concurrent delivery from many connector tasks yields one committed trade
//! - A committed trade reads back equal to what was validated

use ledger::retry::RetryPolicy;
use ledger::{IdempotentWriter, IngestService};
use persistence::journal::JournalConfig;
use persistence::store::{JournalStore, MemoryStore, SqliteConfig, SqliteStore, TradeStore};
use std::sync::Arc;
use tempfile::TempDir;
use types::exchange::NewExchange;
use types::ids::{DedupKey, ExchangeId};
use types::trade::InboundTrade;

fn backends(tmp: &TempDir) -> Vec<Arc<dyn TradeStore>> {
    vec![
        Arc::new(MemoryStore::new()),
        Arc::new(JournalStore::open(JournalConfig::new(tmp.path().join("journal"))).unwrap()),
        Arc::new(SqliteStore::open(&SqliteConfig::new(tmp.path().join("ledger.db"))).unwrap()),
    ]
}

fn inbound(key: &str, exchange_id: ExchangeId) -> InboundTrade {
    serde_json::from_value(serde_json::json!({
        "dedup_key": key,
        "exchange_id": exchange_id.value(),
        "symbol": "ETH/USDT",
        "side": "sell",
        "quantity": "1.25",
        "price": "3120.40",
        "fee": "0.0031",
        "timestamp": 1_708_123_456_789_000_000i64,
    }))
    .unwrap()
}

async fn service(store: &Arc<dyn TradeStore>) -> (Arc<IngestService>, ExchangeId) {
    let ex = store.register_exchange(&NewExchange::new("okx")).unwrap();
    let service = IngestService::new(IdempotentWriter::new(Arc::clone(store)), RetryPolicy::default())
        .await
        .unwrap();
    (Arc::new(service), ex.id)
}

#[tokio::test]
async fn test_repeated_delivery_commits_once() {
    let tmp = TempDir::new().unwrap();
    for store in backends(&tmp) {
        let (service, ex) = service(&store).await;

        for _ in 0..5 {
            service.ingest(&inbound("okx-fill-7", ex)).await.unwrap();
        }

        assert_eq!(store.trades_after(0, 100).unwrap().len(), 1, "backend {}", store.backend());
        let stats = service.stats();
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.duplicates, 4);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_delivery_commits_once() {
    let tmp = TempDir::new().unwrap();
    for store in backends(&tmp) {
        let (service, ex) = service(&store).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = Arc::clone(&service);
            handles.push(tokio::spawn(async move {
                service.ingest(&inbound("okx-fill-42", ex)).await
            }));
        }

        let mut sequences = Vec::new();
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            sequences.push(outcome.trade().sequence);
        }

        sequences.dedup();
        assert_eq!(sequences.len(), 1, "backend {}", store.backend());
        assert_eq!(store.trades_after(0, 100).unwrap().len(), 1);
        assert_eq!(service.stats().committed, 1);
    }
}

#[tokio::test]
async fn test_read_back_equals_validated() {
    let tmp = TempDir::new().unwrap();
    for store in backends(&tmp) {
        let (service, ex) = service(&store).await;
        let outcome = service.ingest(&inbound("okx-fill-1", ex)).await.unwrap();

        let key = DedupKey::try_new("okx-fill-1").unwrap();
        let stored = store.trade_by_key(&key).unwrap().unwrap();
        assert_eq!(&stored, outcome.trade(), "backend {}", store.backend());
        assert_eq!(stored.quantity.to_string(), "1.25");
        assert_eq!(stored.price.to_string(), "3120.4");
        assert_eq!(stored.fee.to_string(), "0.0031");
        assert_eq!(stored.timestamp, 1_708_123_456_789_000_000);
    }
}

#[tokio::test]
async fn test_distinct_keys_get_increasing_sequences() {
    let tmp = TempDir::new().unwrap();
    for store in backends(&tmp) {
        let (service, ex) = service(&store).await;
        let mut last = 0;
        for n in 0..10 {
            let outcome = service.ingest(&inbound(&format!("okx-{n}"), ex)).await.unwrap();
            assert!(outcome.trade().sequence > last, "backend {}", store.backend());
            last = outcome.trade().sequence;
        }
    }
}
