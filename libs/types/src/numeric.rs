//! Fixed-point decimal types for prices and quantities
//!
//! Uses rust_decimal for deterministic arithmetic (no floating-point errors).
//! Both types are strictly positive; zero is a rejected value, not a default.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when constructing a numeric value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericError {
    #[error("Not a decimal: {0}")]
    Parse(String),

    #[error("Value must be positive, got {0}")]
    NotPositive(Decimal),
}

macro_rules! positive_decimal {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "Decimal", into = "Decimal")]
        pub struct $name(Decimal);

        impl $name {
            /// Create a value, returning None unless it is strictly positive.
            ///
            /// Trailing zeros are stripped so equal amounts compare and
            /// serialize identically.
            pub fn try_new(value: Decimal) -> Option<Self> {
                if value > Decimal::ZERO {
                    Some(Self(value.normalize()))
                } else {
                    None
                }
            }

            /// Create from a whole number.
            ///
            /// # Panics
            /// Panics on zero.
            pub fn from_u64(value: u64) -> Self {
                Self::try_new(Decimal::from(value))
                    .expect(concat!(stringify!($name), " must be positive"))
            }

            /// Parse from a decimal string such as `"0.25"`.
            #[allow(clippy::should_implement_trait)]
            pub fn from_str(s: &str) -> Result<Self, NumericError> {
                let value = Decimal::from_str(s.trim())
                    .map_err(|_| NumericError::Parse(s.to_string()))?;
                Self::try_new(value).ok_or(NumericError::NotPositive(value))
            }

            /// Get the underlying decimal.
            pub fn as_decimal(&self) -> Decimal {
                self.0
            }
        }

        impl TryFrom<Decimal> for $name {
            type Error = NumericError;

            fn try_from(value: Decimal) -> Result<Self, Self::Error> {
                Self::try_new(value).ok_or(NumericError::NotPositive(value))
            }
        }

        impl From<$name> for Decimal {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

positive_decimal!(
    /// Execution price in quote currency (> 0)
    Price
);

positive_decimal!(
    /// Traded amount in base currency (> 0)
    Quantity
);
