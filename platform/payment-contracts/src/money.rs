use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ContractError;

/// A non-negative amount in an ISO 4217 currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: String,
}

impl Money {
    /// Build a money value, upper-casing the currency code.
    pub fn new(amount: Decimal, currency: &str) -> Result<Self, ContractError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(ContractError::NegativeAmount(amount.to_string()));
        }

        let currency = currency.trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ContractError::InvalidCurrency(currency));
        }

        Ok(Self { amount, currency })
    }

    /// Build from an integer amount in minor units (kobo, cents, ...).
    pub fn from_minor(minor: i64, currency: &str) -> Result<Self, ContractError> {
        Self::new(Decimal::new(minor, 2), currency)
    }

    pub fn zero(currency: &str) -> Result<Self, ContractError> {
        Self::new(Decimal::ZERO, currency)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:.2}", self.currency, self.amount)
    }
}
