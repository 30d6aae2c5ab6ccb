//! Account balances for the escrow model.
//!
//! Every `(owner, currency)` pair has an `available` balance (spendable now)
//! and a `locked` balance (committed to an in-flight trade or withdrawal).
//! The total is always derived, never stored.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{LedgerError, OwnerId, Result};

/// Currency code (e.g. "BTC", "USDT").
pub type Currency = String;

/// Key of an account row.
pub type AccountKey = (OwnerId, Currency);

/// Balance record for one `(owner, currency)` pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    /// Spendable now.
    pub available: Decimal,
    /// Committed to an active escrow lock.
    pub locked: Decimal,
}

impl Account {
    /// Create a zero balance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
        }
    }

    /// Total balance (available + locked).
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }

    /// Whether this account holds nothing.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.available.is_zero() && self.locked.is_zero()
    }

    /// `available >= 0 && locked >= 0`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        !self.available.is_sign_negative() && !self.locked.is_sign_negative()
    }
}

impl Default for Account {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view returned by balance queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceView {
    pub available: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
}

impl From<Account> for BalanceView {
    fn from(account: Account) -> Self {
        Self {
            available: account.available,
            locked: account.locked,
            total: account.total(),
        }
    }
}

/// Reject non-positive amounts before any mutation.
pub fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount { amount });
    }
    Ok(())
}

/// Currency codes are 2..=16 ASCII alphanumerics.
pub fn validate_currency(currency: &str) -> Result<()> {
    let valid = (2..=16).contains(&currency.len())
        && currency.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidCurrency(currency.to_string()))
    }
}
