//! # custodia-settlement
//!
//! **Settlement plane**: escrow lifecycle, fee distribution and
//! withdrawals on top of [`custodia_ledger`].
//!
//! ## Architecture
//!
//! An escrowed trade moves through:
//! 1. [`EscrowManager::lock`]: available → locked for one `(reference, owner)`
//! 2. External condition (payment confirmed, dispute decided, deadline passed)
//! 3. [`EscrowManager::release`]: locked → recipient net of fee, with the fee
//!    split by [`FeeDistributionEngine`] between admin revenue and the referrer
//! 4. or [`EscrowManager::unlock`]: locked → available
//!
//! Fee percentages come from a [`ConfigProvider`] read on every call.
//! Every settled fee leaves a [`CommissionRecord`] in the [`CommissionLog`].

pub mod commission;
pub mod config;
pub mod escrow;
pub mod fee;
pub mod withdrawal;

pub use commission::{CommissionLog, CommissionRecord, InMemoryCommissionLog, ReferralStats};
pub use config::{ConfigProvider, ConfigReloadResult, HotReloadConfig, StaticConfig};
pub use escrow::{AdminDirectory, EscrowManager, ReleaseRequest, StaticAdminDirectory};
pub use fee::FeeDistributionEngine;
pub use withdrawal::{WithdrawalDesk, WithdrawalReceipt};
