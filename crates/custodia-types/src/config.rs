//! Fee and commission configuration.
//!
//! Every value is a percentage keyed by name, so an external configuration
//! provider can hot-reload individual settings:
//!
//! | key | meaning |
//! |---|---|
//! | `p2p_fee_percent` | fee on P2P escrow releases |
//! | `withdrawal_fee_percent` | fee on withdrawals |
//! | `dispute_fee_percent` | fee on releases decided by dispute |
//! | `referral_standard_commission_percent` | standard referrer's share of a fee |
//! | `referral_golden_commission_percent` | golden referrer's share of a fee |

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{LedgerError, ReferralTier, Result, constants, fee::ensure_percent};

/// Percent-valued fee schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub p2p_fee_percent: Decimal,
    pub withdrawal_fee_percent: Decimal,
    pub dispute_fee_percent: Decimal,
    pub referral_standard_commission_percent: Decimal,
    pub referral_golden_commission_percent: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            p2p_fee_percent: Decimal::from(constants::DEFAULT_P2P_FEE_PERCENT),
            withdrawal_fee_percent: Decimal::from(constants::DEFAULT_WITHDRAWAL_FEE_PERCENT),
            dispute_fee_percent: Decimal::from(constants::DEFAULT_DISPUTE_FEE_PERCENT),
            referral_standard_commission_percent: Decimal::from(
                constants::DEFAULT_STANDARD_COMMISSION_PERCENT,
            ),
            referral_golden_commission_percent: Decimal::from(
                constants::DEFAULT_GOLDEN_COMMISSION_PERCENT,
            ),
        }
    }
}

impl FeeConfig {
    /// Commission percent for a referral tier.
    #[must_use]
    pub fn commission_percent(&self, tier: ReferralTier) -> Decimal {
        match tier {
            ReferralTier::Standard => self.referral_standard_commission_percent,
            ReferralTier::Golden => self.referral_golden_commission_percent,
        }
    }

    /// Check ranges and tier ordering.
    ///
    /// # Errors
    /// Returns `Configuration` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in self.entries() {
            ensure_percent(value)
                .map_err(|_| LedgerError::Configuration(format!("{key}={value} not in 0..=100")))?;
        }
        if self.referral_golden_commission_percent <= self.referral_standard_commission_percent {
            return Err(LedgerError::Configuration(format!(
                "golden commission {} must exceed standard commission {}",
                self.referral_golden_commission_percent, self.referral_standard_commission_percent
            )));
        }
        Ok(())
    }

    /// Build from named settings, starting from the defaults.
    ///
    /// # Errors
    /// Returns `Configuration` for unknown keys or invalid values.
    pub fn from_settings<'a, I>(settings: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, Decimal)>,
    {
        let mut cfg = Self::default();
        for (key, value) in settings {
            cfg.set(key, value)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a JSON object of named settings.
    ///
    /// # Errors
    /// Returns `Serialization` for malformed JSON, `Configuration` for bad values.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Update one named setting.
    ///
    /// # Errors
    /// Returns `Configuration` if the key is unknown.
    pub fn set(&mut self, key: &str, value: Decimal) -> Result<()> {
        let slot = match key {
            "p2p_fee_percent" => &mut self.p2p_fee_percent,
            "withdrawal_fee_percent" => &mut self.withdrawal_fee_percent,
            "dispute_fee_percent" => &mut self.dispute_fee_percent,
            "referral_standard_commission_percent" => {
                &mut self.referral_standard_commission_percent
            }
            "referral_golden_commission_percent" => &mut self.referral_golden_commission_percent,
            other => {
                return Err(LedgerError::Configuration(format!(
                    "unknown setting {other:?}"
                )));
            }
        };
        *slot = value;
        Ok(())
    }

    /// All settings by name.
    #[must_use]
    pub fn entries(&self) -> BTreeMap<&'static str, Decimal> {
        BTreeMap::from([
            ("p2p_fee_percent", self.p2p_fee_percent),
            ("withdrawal_fee_percent", self.withdrawal_fee_percent),
            ("dispute_fee_percent", self.dispute_fee_percent),
            (
                "referral_standard_commission_percent",
                self.referral_standard_commission_percent,
            ),
            (
                "referral_golden_commission_percent",
                self.referral_golden_commission_percent,
            ),
        ])
    }
}
