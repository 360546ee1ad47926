//! Trade Validator
//!
//! Admission check for connector deliveries. Pure: no IO, no state changes.
//! A candidate is admitted iff it names a symbol, a valid side, a positive
//! quantity and price, and a registered exchange.

use persistence::store::TradeStore;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use types::errors::{StorageError, ValidationError};
use types::exchange::Exchange;
use types::ids::{ExchangeId, Symbol};
use types::numeric::{Price, Quantity};
use types::side::Side;
use types::trade::{Trade, TradeCandidate, ValidatedTrade};

/// Read access to registered exchanges.
pub trait ExchangeLookup {
    fn find_exchange(&self, id: ExchangeId) -> Option<&Exchange>;
}

/// In-memory copy of the exchange registry, refreshed from the store.
#[derive(Debug, Clone, Default)]
pub struct ExchangeRegistry {
    exchanges: BTreeMap<ExchangeId, Exchange>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_exchanges(exchanges: impl IntoIterator<Item = Exchange>) -> Self {
        Self {
            exchanges: exchanges.into_iter().map(|e| (e.id, e)).collect(),
        }
    }

    pub fn load(store: &dyn TradeStore) -> Result<Self, StorageError> {
        Ok(Self::from_exchanges(store.exchanges()?))
    }

    /// Replace the contents with the store's current registry.
    pub fn refresh(&mut self, store: &dyn TradeStore) -> Result<(), StorageError> {
        *self = Self::load(store)?;
        debug!(exchanges = self.len(), "Exchange registry refreshed");
        Ok(())
    }

    /// Reload if any trade names an exchange this copy has not seen.
    ///
    /// Returns whether a reload happened.
    pub fn refresh_for(&mut self, trades: &[Trade], store: &dyn TradeStore) -> Result<bool, StorageError> {
        if trades.iter().all(|t| self.contains(t.exchange_id)) {
            return Ok(false);
        }
        self.refresh(store)?;
        Ok(true)
    }

    pub fn insert(&mut self, exchange: Exchange) {
        self.exchanges.insert(exchange.id, exchange);
    }

    pub fn contains(&self, id: ExchangeId) -> bool {
        self.exchanges.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Exchange> {
        self.exchanges.values()
    }
}

impl ExchangeLookup for ExchangeRegistry {
    fn find_exchange(&self, id: ExchangeId) -> Option<&Exchange> {
        self.exchanges.get(&id)
    }
}

/// Validate and normalize a candidate trade.
///
/// Checks run in a fixed order, so a candidate with several defects always
/// reports the same one: symbol, side, quantity, price, exchange.
///
/// A trade from an inactive exchange is admitted with a warning: it
/// happened, and the ledger records facts.
pub fn validate<L>(candidate: &TradeCandidate, exchanges: &L) -> Result<ValidatedTrade, ValidationError>
where
    L: ExchangeLookup + ?Sized,
{
    let symbol = candidate
        .symbol
        .as_deref()
        .and_then(Symbol::try_new)
        .ok_or(ValidationError::MissingSymbol)?;

    let side = Side::parse(&candidate.side)
        .ok_or_else(|| ValidationError::InvalidSide(candidate.side.clone()))?;

    let quantity = Quantity::try_new(candidate.quantity)
        .ok_or(ValidationError::NonPositiveQuantity(candidate.quantity))?;

    let price =
        Price::try_new(candidate.price).ok_or(ValidationError::NonPositivePrice(candidate.price))?;

    let exchange = exchanges
        .find_exchange(candidate.exchange_id)
        .ok_or(ValidationError::UnknownExchange(candidate.exchange_id))?;

    if !exchange.is_active() {
        warn!(
            exchange_id = %exchange.id,
            exchange = %exchange.name,
            symbol = %symbol,
            "Trade from inactive exchange admitted"
        );
    }

    Ok(ValidatedTrade {
        exchange_id: candidate.exchange_id,
        user_id: candidate.user_id,
        symbol,
        side,
        quantity,
        price,
        fee: candidate.fee.unwrap_or(Decimal::ZERO).normalize(),
        timestamp: candidate.timestamp,
    })
}
