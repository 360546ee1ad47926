//! Trade records through the ingestion path
//!
//! `TradeCandidate` is what a connector hands in, `ValidatedTrade` is what the
//! validator admits, and `Trade` is the immutable fact the store persisted.

use crate::ids::{DedupKey, ExchangeId, Symbol, TradeId, UserId};
use crate::numeric::{Price, Quantity};
use crate::side::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Unchecked trade record as delivered by an exchange connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeCandidate {
    pub exchange_id: ExchangeId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: String,
    pub quantity: Decimal,
    pub price: Decimal,
    /// Commission charged; negative for maker rebates
    #[serde(default)]
    pub fee: Option<Decimal>,
    /// Execution time in Unix nanos; insertion time when absent
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// One delivery from a connector: the upstream event id plus the record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundTrade {
    pub dedup_key: String,
    #[serde(flatten)]
    pub trade: TradeCandidate,
}

/// Trade admitted by the validator, normalized and not yet persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedTrade {
    pub exchange_id: ExchangeId,
    pub user_id: Option<UserId>,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub price: Price,
    pub fee: Decimal,
    pub timestamp: Option<i64>,
}

/// Persisted trade. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    pub sequence: u64, // Commit sequence, strictly increasing
    pub dedup_key: DedupKey,
    pub exchange_id: ExchangeId,
    pub user_id: Option<UserId>,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub price: Price,
    pub fee: Decimal,
    pub timestamp: i64,   // Unix nanos
    pub recorded_at: i64, // Unix nanos, insertion time
}

impl Trade {
    /// Materialize a validated trade at commit time.
    ///
    /// A missing execution timestamp defaults to the insertion time.
    pub fn from_validated(
        trade: &ValidatedTrade,
        trade_id: TradeId,
        sequence: u64,
        dedup_key: DedupKey,
        recorded_at: i64,
    ) -> Self {
        Self {
            trade_id,
            sequence,
            dedup_key,
            exchange_id: trade.exchange_id,
            user_id: trade.user_id,
            symbol: trade.symbol.clone(),
            side: trade.side,
            quantity: trade.quantity,
            price: trade.price,
            fee: trade.fee,
            timestamp: trade.timestamp.unwrap_or(recorded_at),
            recorded_at,
        }
    }

    /// Calculate trade value (price × quantity)
    pub fn notional(&self) -> Decimal {
        self.quantity.as_decimal() * self.price.as_decimal()
    }

    /// Signed quantity: positive for buys, negative for sells
    pub fn signed_quantity(&self) -> Decimal {
        self.side.sign() * self.quantity.as_decimal()
    }

    /// Whether a redelivered payload carries the same business fields.
    ///
    /// A candidate without a timestamp matches any stored timestamp, since
    /// the stored one was defaulted at insertion.
    pub fn same_payload(&self, other: &ValidatedTrade) -> bool {
        self.exchange_id == other.exchange_id
            && self.user_id == other.user_id
            && self.symbol == other.symbol
            && self.side == other.side
            && self.quantity == other.quantity
            && self.price == other.price
            && self.fee == other.fee
            && other.timestamp.map_or(true, |ts| ts == self.timestamp)
    }

    /// The validated view of this trade, with its resolved timestamp
    pub fn to_validated(&self) -> ValidatedTrade {
        ValidatedTrade {
            exchange_id: self.exchange_id,
            user_id: self.user_id,
            symbol: self.symbol.clone(),
            side: self.side,
            quantity: self.quantity,
            price: self.price,
            fee: self.fee,
            timestamp: Some(self.timestamp),
        }
    }
}
