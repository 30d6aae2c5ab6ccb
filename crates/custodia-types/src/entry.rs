//! Append-only journal entries.
//!
//! Every balance mutation produces exactly one [`LedgerEntry`]. Entries are
//! never mutated or deleted; they are the only answer to "why did this
//! balance change".

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Account, Currency, EntryId, OwnerId, ReferenceId};

/// The balance movement an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// `available += amount`
    Credit,
    /// `available -= amount`
    Debit,
    /// `available -= amount; locked += amount`
    Lock,
    /// `locked -= amount; available += amount`
    Unlock,
    /// `locked -= amount` (funds leave the account through settlement)
    Release,
    /// `locked += amount`; only written when a failed release is compensated.
    Relock,
}

impl EntryKind {
    /// Signed effect of this entry on the account's total.
    #[must_use]
    pub fn total_delta(&self, amount: Decimal) -> Decimal {
        match self {
            Self::Credit | Self::Relock => amount,
            Self::Debit | Self::Release => -amount,
            Self::Lock | Self::Unlock => Decimal::ZERO,
        }
    }

    /// Apply this movement to an account without any checks. Used when
    /// replaying history.
    pub fn replay(&self, account: &mut Account, amount: Decimal) {
        match self {
            Self::Credit => account.available += amount,
            Self::Debit => account.available -= amount,
            Self::Lock => {
                account.available -= amount;
                account.locked += amount;
            }
            Self::Unlock => {
                account.locked -= amount;
                account.available += amount;
            }
            Self::Release => account.locked -= amount,
            Self::Relock => account.locked += amount,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Credit => write!(f, "credit"),
            Self::Debit => write!(f, "debit"),
            Self::Lock => write!(f, "lock"),
            Self::Unlock => write!(f, "unlock"),
            Self::Release => write!(f, "release"),
            Self::Relock => write!(f, "relock"),
        }
    }
}

/// One immutable journal row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: EntryId,
    pub owner_id: OwnerId,
    pub currency: Currency,
    /// Signed: positive for credit/unlock/relock, negative for
    /// debit/lock/release (as seen from `available` or `locked`).
    pub amount: Decimal,
    pub kind: EntryKind,
    /// Business reason, e.g. `withdrawal_fee`, `p2p_release`, `rollback`.
    pub operation_type: String,
    pub reference_id: ReferenceId,
    pub resulting_available: Decimal,
    pub resulting_locked: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    /// The unsigned amount moved.
    #[must_use]
    pub fn magnitude(&self) -> Decimal {
        self.amount.abs()
    }

    /// Whether this entry was written by a compensation step.
    #[must_use]
    pub fn is_rollback(&self) -> bool {
        self.operation_type == crate::constants::OP_ROLLBACK
    }
}
