//! # EscrowLock: funds committed to a pending outcome
//!
//! ## State Machine
//!
//! ```text
//!   ┌────────┐   release   ┌──────────┐
//!   │ ACTIVE ├────────────▶│ RELEASED │◀──────┐
//!   └─┬────┬─┘             └──────────┘       │ resolve (winner)
//!     │    │ dispute      ┌──────────┐        │
//!     │    └─────────────▶│ DISPUTED ├────────┤
//!     │ unlock/expire     └──────────┘        │ resolve (refund)
//!     ▼                                       │
//!   ┌──────────┐                              │
//!   │ UNLOCKED │◀─────────────────────────────┘
//!   └──────────┘
//! ```
//!
//! Transitions are monotonic. RELEASED and UNLOCKED are terminal; a terminal
//! record is kept for audit but no longer blocks a new lock under the same
//! `(reference_id, owner)`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{ActorId, Currency, FeeSplit, LedgerError, LockId, OwnerId, ReferenceId, Result};

/// Lifecycle state of an escrow lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Active,
    Released,
    Unlocked,
    Disputed,
}

impl LockStatus {
    /// Can a lock in this state move to `target`?
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Active, Self::Released | Self::Unlocked | Self::Disputed)
                | (Self::Disputed, Self::Released | Self::Unlocked)
        )
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Unlocked)
    }

    /// Live locks hold funds and block a second lock on the same key.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Released => write!(f, "RELEASED"),
            Self::Unlocked => write!(f, "UNLOCKED"),
            Self::Disputed => write!(f, "DISPUTED"),
        }
    }
}

/// Outcome of releasing a lock. Stored on the lock so a retried release
/// returns it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResult {
    pub lock_id: LockId,
    pub reference_id: ReferenceId,
    pub currency: Currency,
    pub payer: OwnerId,
    /// `None` when the net amount left the platform (withdrawal).
    pub recipient: Option<OwnerId>,
    /// Amount taken out of the payer's locked balance.
    pub gross_amount: Decimal,
    /// Fee withheld from `gross_amount`.
    pub fee: FeeSplit,
    /// `gross_amount - fee.total()`, credited to the recipient if any.
    pub net_amount: Decimal,
    /// Part of the lock not consumed by the release, returned to the payer.
    pub returned_to_payer: Decimal,
    pub released_at: DateTime<Utc>,
}

/// Funds moved from `available` to `locked` for a specific purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowLock {
    pub lock_id: LockId,
    pub owner_id: OwnerId,
    pub currency: Currency,
    pub amount: Decimal,
    /// Free-text purpose, e.g. `p2p_trade`, `withdrawal`.
    pub purpose: String,
    pub reference_id: ReferenceId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub status: LockStatus,
    #[serde(default)]
    pub release: Option<ReleaseResult>,
    /// Admin who closed a dispute on this lock.
    #[serde(default)]
    pub resolved_by: Option<ActorId>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_reason: Option<String>,
}

impl EscrowLock {
    /// Create an ACTIVE lock record.
    #[must_use]
    pub fn new(
        owner_id: OwnerId,
        currency: &str,
        amount: Decimal,
        reference_id: ReferenceId,
        purpose: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            lock_id: LockId::new(),
            owner_id,
            currency: currency.to_string(),
            amount,
            purpose: purpose.to_string(),
            reference_id,
            created_at: Utc::now(),
            expires_at,
            status: LockStatus::Active,
            release: None,
            resolved_by: None,
            closed_at: None,
            close_reason: None,
        }
    }

    /// Whether the lock's deadline has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    /// Move to `target`, enforcing the state machine.
    ///
    /// # Errors
    /// Returns `InvalidLockTransition` for any edge not in the diagram.
    pub fn transition(&mut self, target: LockStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(LedgerError::InvalidLockTransition {
                reference_id: self.reference_id.clone(),
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        if target.is_terminal() {
            self.closed_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// How an admin closes a disputed lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DisputeResolution {
    /// Pay the locked funds to `winner`, minus the configured dispute fee.
    ReleaseTo { winner: OwnerId },
    /// Return the locked funds to the owner.
    Refund,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UserId;

    fn make_lock() -> EscrowLock {
        EscrowLock::new(
            OwnerId::User(UserId::new()),
            "BTC",
            Decimal::new(30, 0),
            ReferenceId::from("t1"),
            "p2p_trade",
            None,
        )
    }

    #[test]
    fn valid_transitions() {
        assert!(LockStatus::Active.can_transition_to(LockStatus::Released));
        assert!(LockStatus::Active.can_transition_to(LockStatus::Unlocked));
        assert!(LockStatus::Active.can_transition_to(LockStatus::Disputed));
        assert!(LockStatus::Disputed.can_transition_to(LockStatus::Released));
        assert!(LockStatus::Disputed.can_transition_to(LockStatus::Unlocked));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [LockStatus::Released, LockStatus::Unlocked] {
            for target in [
                LockStatus::Active,
                LockStatus::Released,
                LockStatus::Unlocked,
                LockStatus::Disputed,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
        assert!(!LockStatus::Disputed.can_transition_to(LockStatus::Active));
    }

    #[test]
    fn transition_records_close_time() {
        let mut lock = make_lock();
        lock.transition(LockStatus::Unlocked).unwrap();
        assert!(lock.closed_at.is_some());
        let err = lock.transition(LockStatus::Released).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidLockTransition { .. }));
    }

    #[test]
    fn expiry() {
        let mut lock = make_lock();
        let now = Utc::now();
        assert!(!lock.is_expired_at(now));
        lock.expires_at = Some(now - chrono::Duration::minutes(5));
        assert!(lock.is_expired_at(now));
    }
}
