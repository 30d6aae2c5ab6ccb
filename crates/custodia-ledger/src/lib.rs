//! # custodia-ledger
//!
//! **Balance plane**: the only code that writes balances.
//!
//! ## Architecture
//!
//! Every balance change goes through [`LedgerService`]:
//! 1. Validates amount and currency before touching anything
//! 2. Applies one atomic conditional update through [`AccountStore`]
//! 3. Appends one [`LedgerEntry`](custodia_types::LedgerEntry) to the [`LedgerJournal`]
//! 4. Reverts the update if the journal refuses the entry
//!
//! Multi-account operations (transfers, pool payouts) are sequences of
//! single-account steps undone by a [`Compensation`] stack on failure.
//! Platform-funded payouts pass through [`LiquidityGuard`] before the
//! [`AdminLiquidityPool`] can be debited.

pub mod compensation;
pub mod guard;
pub mod idempotency;
pub mod journal;
pub mod pool;
pub mod service;
pub mod store;
pub mod supply;

pub use compensation::Compensation;
pub use guard::LiquidityGuard;
pub use idempotency::{IdempotencyRegistry, OperationKey};
pub use journal::{InMemoryJournal, LedgerJournal, rebuild_balances};
pub use pool::{AdminLiquidityPool, LiquidityClearance};
pub use service::{LedgerService, TransferReceipt};
pub use store::{AccountStore, BalanceMutation, InMemoryAccountStore};
pub use supply::{SupplyReport, SupplyTracker};
