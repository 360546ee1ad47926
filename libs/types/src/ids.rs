//! Identifier types for ledger entities
//!
//! Trade ids use UUID v7 so they sort by creation time. Exchange and user ids
//! mirror the integer primary keys of the `exchanges` and `users` tables.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a persisted trade
///
/// Uses UUID v7 for time-based sorting. Assigned by the store at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(Uuid);

impl TradeId {
    /// Create a new TradeId with current timestamp
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create from existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TradeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a registered exchange (`exchanges.id`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(i64);

impl ExchangeId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a registered user (`users.id`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Traded instrument symbol, normalized to trimmed upper case
///
/// No format is imposed beyond being non-blank: exchanges disagree on
/// `BTC/USDT` versus `BTCUSDT`, and the ledger keys positions on whatever
/// the connector sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Create a new Symbol
    ///
    /// # Panics
    /// Panics if the symbol is blank
    pub fn new(symbol: impl AsRef<str>) -> Self {
        Self::try_new(symbol).expect("Symbol must not be blank")
    }

    /// Try to create a Symbol, returning None if blank
    pub fn try_new(symbol: impl AsRef<str>) -> Option<Self> {
        let s = symbol.as_ref().trim();
        if s.is_empty() {
            None
        } else {
            Some(Self(s.to_uppercase()))
        }
    }

    /// Get the symbol string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Upstream event identifier used to detect redelivery
///
/// Exchanges assign these (fill ids, execution ids). The store keeps at most
/// one trade per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    /// Longest key accepted, matching the `dedup_key` column width.
    pub const MAX_LEN: usize = 255;

    /// Try to create a key; blank or over-long keys are rejected.
    pub fn try_new(key: impl AsRef<str>) -> Option<Self> {
        let k = key.as_ref().trim();
        if k.is_empty() || k.len() > Self::MAX_LEN {
            None
        } else {
            Some(Self(k.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
