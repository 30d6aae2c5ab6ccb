//! Liquidity pre-flight check result.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Currency, LedgerError};

/// Outcome of comparing a payout against the pool's available balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityCheckResult {
    pub currency: Currency,
    pub can_execute: bool,
    pub available_liquidity: Decimal,
    pub required_liquidity: Decimal,
    /// Zero when `can_execute`.
    pub shortage: Decimal,
}

impl LiquidityCheckResult {
    #[must_use]
    pub fn evaluate(currency: &str, available: Decimal, required: Decimal) -> Self {
        let can_execute = available >= required;
        Self {
            currency: currency.to_string(),
            can_execute,
            available_liquidity: available,
            required_liquidity: required,
            shortage: if can_execute {
                Decimal::ZERO
            } else {
                required - available
            },
        }
    }

    /// The rejection error for a failed check.
    #[must_use]
    pub fn to_error(&self) -> LedgerError {
        LedgerError::InsufficientPoolLiquidity {
            currency: self.currency.clone(),
            required: self.required_liquidity,
            available: self.available_liquidity,
            shortage: self.shortage,
        }
    }
}
