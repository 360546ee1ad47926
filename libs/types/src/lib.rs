//! Types library for the trade ledger
//!
//! This library provides the core type definitions shared by the persistence
//! layer and the ledger service, keeping arithmetic deterministic and the
//! persisted shapes stable.
//!
//! # Modules
//! - `ids`: Identifiers (TradeId, ExchangeId, UserId, Symbol, DedupKey)
//! - `numeric`: Fixed-point decimal types (Price, Quantity)
//! - `side`: Trade side
//! - `exchange`: Exchange and user registry records
//! - `trade`: Candidate, validated and persisted trades
//! - `position`: Derived position state and the fold rule
//! - `errors`: Error taxonomy

pub mod ids;
pub mod numeric;
pub mod side;
pub mod exchange;
pub mod trade;
pub mod position;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Current time as Unix nanoseconds.
///
/// Saturates at `i64::MAX` instead of failing past the year 2262.
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::side::*;
    pub use crate::exchange::*;
    pub use crate::trade::*;
    pub use crate::position::*;
    pub use crate::errors::*;
}
