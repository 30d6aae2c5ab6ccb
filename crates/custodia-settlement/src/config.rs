//! Fee configuration providers.
//!
//! Settlement code reads the fee schedule through [`ConfigProvider`] on
//! every call and never caches it, so a reload takes effect on the next
//! settlement.

use std::sync::{PoisonError, RwLock};

use custodia_types::{FeeConfig, Result};
use rust_decimal::Decimal;

/// Source of the current fee schedule.
pub trait ConfigProvider: Send + Sync {
    /// Snapshot of the current configuration.
    fn fee_config(&self) -> FeeConfig;
}

/// Fixed configuration, set at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(FeeConfig);

impl StaticConfig {
    /// # Errors
    /// Returns `Configuration` if `config` does not validate.
    pub fn new(config: FeeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self(config))
    }
}

impl ConfigProvider for StaticConfig {
    fn fee_config(&self) -> FeeConfig {
        self.0.clone()
    }
}

/// Outcome of a reload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigReloadResult {
    /// New configuration is live.
    Success,
    /// Source could not be read or parsed; old configuration kept.
    ReadError(String),
    /// New configuration failed validation; old configuration kept.
    ValidationError(String),
}

/// Configuration that can be swapped at runtime.
///
/// Invalid input never replaces a working configuration.
#[derive(Debug, Default)]
pub struct HotReloadConfig {
    current: RwLock<FeeConfig>,
}

impl HotReloadConfig {
    /// # Errors
    /// Returns `Configuration` if `initial` does not validate.
    pub fn new(initial: FeeConfig) -> Result<Self> {
        initial.validate()?;
        Ok(Self {
            current: RwLock::new(initial),
        })
    }

    /// Replace the whole configuration if it validates.
    pub fn reload(&self, next: FeeConfig) -> ConfigReloadResult {
        if let Err(e) = next.validate() {
            tracing::error!(
                target: "CONFIG",
                error = %e,
                "Invalid fee config, keeping old configuration"
            );
            return ConfigReloadResult::ValidationError(e.to_string());
        }
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        tracing::info!(target: "CONFIG", "Fee config reloaded");
        ConfigReloadResult::Success
    }

    /// Reload from a JSON document.
    pub fn reload_json(&self, json: &str) -> ConfigReloadResult {
        match serde_json::from_str::<FeeConfig>(json) {
            Ok(next) => self.reload(next),
            Err(e) => {
                tracing::error!(
                    target: "CONFIG",
                    error = %e,
                    "Failed to parse fee config, keeping old configuration"
                );
                ConfigReloadResult::ReadError(e.to_string())
            }
        }
    }

    /// Change one named setting, keeping the rest.
    pub fn set(&self, key: &str, value: Decimal) -> ConfigReloadResult {
        let mut next = self.fee_config();
        if let Err(e) = next.set(key, value) {
            tracing::error!(target: "CONFIG", key, error = %e, "Unknown fee setting");
            return ConfigReloadResult::ReadError(e.to_string());
        }
        self.reload(next)
    }
}

impl ConfigProvider for HotReloadConfig {
    fn fee_config(&self) -> FeeConfig {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_rejects_invalid() {
        let cfg = FeeConfig {
            p2p_fee_percent: Decimal::new(101, 0),
            ..FeeConfig::default()
        };
        assert!(StaticConfig::new(cfg).is_err());
    }

    #[test]
    fn reload_swaps_valid_config() {
        let hot = HotReloadConfig::new(FeeConfig::default()).unwrap();
        let result = hot.set("p2p_fee_percent", Decimal::new(15, 1));
        assert_eq!(result, ConfigReloadResult::Success);
        assert_eq!(hot.fee_config().p2p_fee_percent, Decimal::new(15, 1));
    }

    #[test]
    fn invalid_reload_keeps_old_config() {
        let hot = HotReloadConfig::new(FeeConfig::default()).unwrap();
        let before = hot.fee_config();

        // Golden must stay above standard.
        let result = hot.set("referral_golden_commission_percent", Decimal::new(10, 0));
        assert!(matches!(result, ConfigReloadResult::ValidationError(_)));
        assert_eq!(hot.fee_config(), before);

        let result = hot.reload_json("{not json");
        assert!(matches!(result, ConfigReloadResult::ReadError(_)));
        assert_eq!(hot.fee_config(), before);

        let result = hot.set("maker_rebate_percent", Decimal::ONE);
        assert!(matches!(result, ConfigReloadResult::ReadError(_)));
    }

    #[test]
    fn reload_json_partial_uses_defaults() {
        let hot = HotReloadConfig::new(FeeConfig::default()).unwrap();
        let result = hot.reload_json(r#"{"withdrawal_fee_percent": "0.5"}"#);
        assert_eq!(result, ConfigReloadResult::Success);
        let cfg = hot.fee_config();
        assert_eq!(cfg.withdrawal_fee_percent, Decimal::new(5, 1));
        assert_eq!(cfg.p2p_fee_percent, FeeConfig::default().p2p_fee_percent);
    }
}
