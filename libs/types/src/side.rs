//! Trade side

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trade side (buyer or seller), from the account's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Bought base asset: position grows
    BUY,
    /// Sold base asset: position shrinks
    SELL,
}

impl Side {
    /// Parse a side as sent by connectors. Case-insensitive, surrounding
    /// whitespace ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(Side::BUY),
            "sell" => Some(Side::SELL),
            _ => None,
        }
    }

    /// Column value used by the `trades.side` check constraint
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::BUY => "buy",
            Side::SELL => "sell",
        }
    }

    /// Sign applied to quantity when folding into a position
    pub fn sign(&self) -> Decimal {
        match self {
            Side::BUY => Decimal::ONE,
            Side::SELL => Decimal::NEGATIVE_ONE,
        }
    }

    /// Get the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::BUY => Side::SELL,
            Side::SELL => Side::BUY,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
