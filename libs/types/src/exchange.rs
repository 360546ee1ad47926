//! Exchange and user registry records
//!
//! Exchanges are registered by an admin process before any trade may
//! reference them. After registration only the activation flag changes.

use crate::ids::{ExchangeId, UserId};
use serde::{Deserialize, Serialize};

/// A registered trading venue (`exchanges` row)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub id: ExchangeId,
    /// Unique venue name, e.g. "binance"
    pub name: String,
    /// Reference to the API credential in the secret store. Never the secret.
    pub credential_ref: Option<String>,
    pub active: bool,
    pub created_at: i64, // Unix nanos
}

impl Exchange {
    /// Whether new trades are expected from this venue
    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Registration request for a new exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExchange {
    pub name: String,
    pub credential_ref: Option<String>,
    pub active: bool,
}

impl NewExchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credential_ref: None,
            active: true,
        }
    }

    pub fn with_credential_ref(mut self, credential_ref: impl Into<String>) -> Self {
        self.credential_ref = Some(credential_ref.into());
        self
    }
}

/// A registered user (`users` row)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub created_at: i64,
}
