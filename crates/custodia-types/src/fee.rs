//! Fee and referral-commission types.
//!
//! All percentage math rounds toward zero at [`AMOUNT_PRECISION`] decimal
//! places. The admin share is always derived by subtraction, so
//! `admin_amount + commission_amount == gross_fee` holds exactly.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::constants::AMOUNT_PRECISION;
use crate::{LedgerError, Result, UserId};

/// Commission tier of a referring user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralTier {
    Standard,
    Golden,
}

impl std::fmt::Display for ReferralTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Golden => write!(f, "golden"),
        }
    }
}

/// The referrer of the user paying a fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferrerContext {
    pub referrer_id: UserId,
    pub tier: ReferralTier,
}

impl ReferrerContext {
    #[must_use]
    pub fn new(referrer_id: UserId, tier: ReferralTier) -> Self {
        Self { referrer_id, tier }
    }
}

/// How a gross fee is divided between the platform and a referrer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub gross_fee: Decimal,
    pub referrer_id: Option<UserId>,
    pub referrer_tier: Option<ReferralTier>,
    pub commission_percent: Decimal,
    pub commission_amount: Decimal,
    pub admin_amount: Decimal,
}

impl FeeSplit {
    /// Split with no referrer: everything goes to the platform.
    #[must_use]
    pub fn admin_only(gross_fee: Decimal) -> Self {
        Self {
            gross_fee,
            referrer_id: None,
            referrer_tier: None,
            commission_percent: Decimal::ZERO,
            commission_amount: Decimal::ZERO,
            admin_amount: gross_fee,
        }
    }

    /// Total fee taken from the payer (`admin_amount + commission_amount`).
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.admin_amount + self.commission_amount
    }

    /// `admin_amount + commission_amount == gross_fee`.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.total() == self.gross_fee
    }
}

/// Truncate an amount to the engine precision.
#[must_use]
pub fn round_amount(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(AMOUNT_PRECISION, RoundingStrategy::ToZero)
}

/// `amount * percent / 100`, truncated to the engine precision.
///
/// # Errors
/// Returns `InvalidPercent` if `percent` is outside `0..=100`.
pub fn percent_of(amount: Decimal, percent: Decimal) -> Result<Decimal> {
    ensure_percent(percent)?;
    let raw = amount
        .checked_mul(percent)
        .ok_or_else(|| LedgerError::Internal(format!("overflow computing {percent}% of {amount}")))?
        / Decimal::ONE_HUNDRED;
    Ok(round_amount(raw))
}

/// Percent values must lie in `0..=100`.
pub fn ensure_percent(percent: Decimal) -> Result<()> {
    if percent.is_sign_negative() || percent > Decimal::ONE_HUNDRED {
        return Err(LedgerError::InvalidPercent { percent });
    }
    Ok(())
}
