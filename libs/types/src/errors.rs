//! Error types for the trade ledger
//!
//! Taxonomy using thiserror:
//! - `ValidationError`: input rejected, never retried
//! - `StorageError`: persistence fault, transient (retry with backoff) or
//!   permanent (surface to the operator)
//! - `LedgerError`: aggregation fault, fatal to one position stream
//! - `IngestError`: what a connector sees from the ingest path
//!
//! A duplicate delivery is not an error anywhere in this taxonomy.

use crate::ids::ExchangeId;
use crate::position::PositionKey;
use rust_decimal::Decimal;
use thiserror::Error;

/// Reasons a candidate trade is refused admission
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing symbol")]
    MissingSymbol,

    #[error("Invalid side: {0:?}")]
    InvalidSide(String),

    #[error("Quantity must be positive, got {0}")]
    NonPositiveQuantity(Decimal),

    #[error("Price must be positive, got {0}")]
    NonPositivePrice(Decimal),

    #[error("Unknown exchange: {0}")]
    UnknownExchange(ExchangeId),

    #[error("Invalid dedup key: {0:?}")]
    InvalidDedupKey(String),
}

/// Whether a storage fault is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Lock contention, interrupted IO, timeouts
    Transient,
    /// Constraint violations, corruption, unrecoverable IO
    Permanent,
}

/// Storage fault raised by a trade store backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?} storage error: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Transient faults may succeed on retry
    pub fn is_retryable(&self) -> bool {
        self.kind == StorageErrorKind::Transient
    }
}

/// Aggregation faults. Each one halts the affected position stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Trade seq={sequence} references unknown exchange {exchange_id}")]
    UnknownExchange { exchange_id: ExchangeId, sequence: u64 },

    #[error("Position stream {key} is halted: {reason}")]
    StreamHalted { key: PositionKey, reason: String },

    #[error("Sequence regression on {key}: last applied {last}, got {got}")]
    SequenceRegression { key: PositionKey, last: u64, got: u64 },

    #[error("Arithmetic overflow folding seq={sequence} into {key}")]
    ArithmeticOverflow { key: PositionKey, sequence: u64 },
}

/// Outcome errors of the ingest path, after retries
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("Rejected: {0}")]
    Rejected(#[from] ValidationError),

    #[error("Storage: {0}")]
    Storage(#[from] StorageError),
}

impl IngestError {
    /// Whether the connector should redeliver later
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Storage(e) if e.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Symbol;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::NonPositivePrice(Decimal::ZERO);
        assert_eq!(err.to_string(), "Price must be positive, got 0");
    }

    #[test]
    fn test_storage_error_retryable() {
        assert!(StorageError::transient("database is locked").is_retryable());
        assert!(!StorageError::permanent("FOREIGN KEY constraint failed").is_retryable());
    }

    #[test]
    fn test_ingest_error_from_validation() {
        let err: IngestError = ValidationError::MissingSymbol.into();
        assert!(matches!(err, IngestError::Rejected(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_ingest_error_retryable_only_when_transient() {
        let err: IngestError = StorageError::transient("busy").into();
        assert!(err.is_retryable());
        let err: IngestError = StorageError::permanent("disk").into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_ledger_error_mentions_key() {
        let err = LedgerError::StreamHalted {
            key: PositionKey::new(ExchangeId::new(3), Symbol::new("ETH")),
            reason: "unknown exchange".into(),
        };
        assert!(err.to_string().contains("3:ETH"));
    }
}
