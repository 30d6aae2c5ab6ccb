//! # custodia-types
//!
//! Shared types, errors, and configuration for the **Custodia** ledger and
//! escrow engine.
//!
//! This crate is the leaf dependency of the workspace. It defines:
//!
//! - **Identifiers**: [`UserId`], [`OwnerId`], [`ReferenceId`], [`EntryId`], [`LockId`], [`ActorId`]
//! - **Balances**: [`Account`], [`BalanceView`], [`Currency`]
//! - **Journal**: [`LedgerEntry`], [`EntryKind`]
//! - **Escrow**: [`EscrowLock`], [`LockStatus`], [`ReleaseResult`], [`DisputeResolution`]
//! - **Fees**: [`FeeSplit`], [`ReferralTier`], [`ReferrerContext`]
//! - **Liquidity**: [`LiquidityCheckResult`]
//! - **Configuration**: [`FeeConfig`]
//! - **Errors**: [`LedgerError`] with `CL_ERR_` prefix codes
//! - **Constants**: precision, defaults, journal operation types

pub mod account;
pub mod config;
pub mod constants;
pub mod entry;
pub mod error;
pub mod escrow;
pub mod fee;
pub mod ids;
pub mod liquidity;

pub use account::*;
pub use config::*;
pub use entry::*;
pub use error::*;
pub use escrow::*;
pub use fee::*;
pub use ids::*;
pub use liquidity::*;

// Constants are accessed via `custodia_types::constants::FOO`
// (not re-exported to avoid name collisions).
