//! Error types for the Custodia ledger and escrow engine.
//!
//! All errors use the `CL_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Validation errors (caller mistakes, rejected before any mutation)
//! - 2xx: Balance errors (expected business outcomes)
//! - 3xx: Escrow errors
//! - 4xx: Liquidity errors
//! - 5xx: Fee / configuration errors
//! - 6xx: Audit / consistency errors (page an operator)
//! - 9xx: General / internal errors

use rust_decimal::Decimal;
use thiserror::Error;

use crate::{LockStatus, OwnerId, ReferenceId};

/// Central error enum for all ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    // =================================================================
    // Validation Errors (1xx)
    // =================================================================
    /// Amount was zero or negative.
    #[error("CL_ERR_100: Invalid amount: {amount} (must be positive)")]
    InvalidAmount { amount: Decimal },

    /// Currency code is empty or malformed.
    #[error("CL_ERR_101: Invalid currency: {0:?}")]
    InvalidCurrency(String),

    /// Percent value outside `0..=100`.
    #[error("CL_ERR_102: Invalid percent: {percent}")]
    InvalidPercent { percent: Decimal },

    /// Source and destination of a transfer are the same account.
    #[error("CL_ERR_103: Transfer source and destination are the same: {0}")]
    SelfTransfer(OwnerId),

    // =================================================================
    // Balance Errors (2xx)
    // =================================================================
    /// Debit or lock exceeds the available balance.
    #[error(
        "CL_ERR_200: Insufficient available balance for {owner} {currency}: need {needed}, have {available}"
    )]
    InsufficientAvailableBalance {
        owner: OwnerId,
        currency: String,
        needed: Decimal,
        available: Decimal,
    },

    /// Release or unlock exceeds the locked balance.
    #[error(
        "CL_ERR_201: Insufficient locked balance for {owner} {currency}: need {needed}, have {locked}"
    )]
    InsufficientLockedBalance {
        owner: OwnerId,
        currency: String,
        needed: Decimal,
        locked: Decimal,
    },

    /// Another request holding the same idempotency key is still running.
    #[error("CL_ERR_202: Operation already in progress for reference {0}")]
    OperationInProgress(ReferenceId),

    // =================================================================
    // Escrow Errors (3xx)
    // =================================================================
    /// A live lock already exists for this (reference, owner).
    #[error("CL_ERR_300: Duplicate lock for reference {reference_id} owner {owner}")]
    DuplicateLock {
        reference_id: ReferenceId,
        owner: OwnerId,
    },

    /// No lock exists for this reference.
    #[error("CL_ERR_301: Lock not found for reference {0}")]
    LockNotFound(ReferenceId),

    /// The lock is in a state that does not allow the requested transition.
    #[error("CL_ERR_302: Lock {reference_id} cannot move from {from} to {to}")]
    InvalidLockTransition {
        reference_id: ReferenceId,
        from: LockStatus,
        to: LockStatus,
    },

    /// Several owners hold locks under this reference; the owner must be named.
    #[error("CL_ERR_303: Reference {0} has locks from several owners")]
    AmbiguousLock(ReferenceId),

    /// The acting identity is not an authenticated admin.
    #[error("CL_ERR_304: Unauthorized actor: {0}")]
    Unauthorized(String),

    /// The lock has not reached its expiry time yet.
    #[error("CL_ERR_305: Lock {0} has not expired")]
    LockNotExpired(ReferenceId),

    // =================================================================
    // Liquidity Errors (4xx)
    // =================================================================
    /// The admin liquidity pool cannot fund this payout.
    #[error(
        "CL_ERR_400: Insufficient pool liquidity for {currency}: required {required}, available {available}, shortage {shortage}"
    )]
    InsufficientPoolLiquidity {
        currency: String,
        required: Decimal,
        available: Decimal,
        shortage: Decimal,
    },

    /// Platform-wide solvency or conservation check failed.
    #[error("CL_ERR_401: Solvency violation: {reason}")]
    SolvencyViolation { reason: String },

    // =================================================================
    // Fee / Configuration Errors (5xx)
    // =================================================================
    /// Configuration error (invalid file, missing keys, bad values).
    #[error("CL_ERR_500: Configuration error: {0}")]
    Configuration(String),

    // =================================================================
    // Audit / Consistency Errors (6xx)
    // =================================================================
    /// A compensating step failed: funds are in an inconsistent state.
    #[error(
        "CL_ERR_600: Rollback failed for {owner} {currency} amount {amount} reference {reference_id}: {reason}"
    )]
    RollbackFailure {
        owner: OwnerId,
        currency: String,
        amount: Decimal,
        reference_id: ReferenceId,
        reason: String,
    },

    /// The journal rejected an entry; the balance change was reverted.
    #[error("CL_ERR_601: Audit write failed: {0}")]
    AuditWriteFailed(String),

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("CL_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("CL_ERR_901: Serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    /// Expected business outcomes the caller must branch on (and must not
    /// retry automatically).
    #[must_use]
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            Self::InsufficientAvailableBalance { .. }
                | Self::InsufficientLockedBalance { .. }
                | Self::InsufficientPoolLiquidity { .. }
                | Self::DuplicateLock { .. }
        )
    }

    /// Errors that leave funds in an inconsistent state and need an operator.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackFailure { .. })
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, LedgerError>;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
