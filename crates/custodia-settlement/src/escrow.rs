//! Escrow lifecycle: lock, release with fee split, unlock, expiry, disputes.
//!
//! ## Release sequence
//!
//! ```text
//! payer.locked   -= gross            (release_locked)
//! recipient      += gross - fee      (credit; internal releases)
//! pool           -= gross - fee      (cleared debit; external payouts)
//! payer          += lock - gross     (unlock remainder, if any)
//! admin/referrer += fee split        (FeeDistributionEngine)
//! lock.status     = RELEASED         (result stored on the lock)
//! ```
//!
//! Each step is recorded in a [`Compensation`] stack; any failure undoes
//! the completed steps before the error is returned.
//!
//! Each lock record sits behind its own mutex, held for the whole release
//! or unlock, so concurrent callers on one lock are serialized and a
//! retried release sees the stored result instead of moving money twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use custodia_ledger::{
    AdminLiquidityPool, BalanceMutation, Compensation, LedgerService, LiquidityClearance,
};
use custodia_types::{
    ActorId, DisputeResolution, EscrowLock, LedgerError, LockStatus, OwnerId, ReferenceId,
    ReferrerContext, ReleaseResult, Result, constants, ensure_percent, ensure_positive,
    validate_currency,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;

use crate::fee::FeeDistributionEngine;

/// Source of admin identities, authenticated outside the engine.
pub trait AdminDirectory: Send + Sync {
    fn is_admin(&self, actor: ActorId) -> bool;
}

/// Fixed set of admin actors.
#[derive(Debug, Clone, Default)]
pub struct StaticAdminDirectory {
    admins: HashSet<ActorId>,
}

impl StaticAdminDirectory {
    #[must_use]
    pub fn new(admins: impl IntoIterator<Item = ActorId>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }
}

impl AdminDirectory for StaticAdminDirectory {
    fn is_admin(&self, actor: ActorId) -> bool {
        self.admins.contains(&actor)
    }
}

/// Parameters of [`EscrowManager::release`].
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub reference_id: ReferenceId,
    /// Lock owner. Required only when several owners hold live locks
    /// under the same reference.
    pub owner: Option<OwnerId>,
    pub recipient: OwnerId,
    /// Amount to consume from the lock; the full lock amount when `None`.
    pub gross_amount: Option<Decimal>,
    pub fee_percent: Decimal,
    pub referrer: Option<ReferrerContext>,
    pub fee_type: String,
}

impl ReleaseRequest {
    #[must_use]
    pub fn new(reference_id: impl Into<ReferenceId>, recipient: OwnerId, fee_percent: Decimal) -> Self {
        Self {
            reference_id: reference_id.into(),
            owner: None,
            recipient,
            gross_amount: None,
            fee_percent,
            referrer: None,
            fee_type: "p2p".to_string(),
        }
    }

    #[must_use]
    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    #[must_use]
    pub fn gross_amount(mut self, amount: Decimal) -> Self {
        self.gross_amount = Some(amount);
        self
    }

    #[must_use]
    pub fn referrer(mut self, referrer: ReferrerContext) -> Self {
        self.referrer = Some(referrer);
        self
    }

    #[must_use]
    pub fn fee_type(mut self, fee_type: &str) -> Self {
        self.fee_type = fee_type.to_string();
        self
    }
}

type LockKey = (ReferenceId, OwnerId);
type LockSlot = Arc<Mutex<EscrowLock>>;

fn guard(slot: &LockSlot) -> MutexGuard<'_, EscrowLock> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fee-bearing release of a locked amount.
struct Settlement<'a> {
    recipient: Option<OwnerId>,
    gross: Decimal,
    fee_percent: Decimal,
    referrer: Option<ReferrerContext>,
    fee_type: &'a str,
}

/// Pool leg of an external release: the net amount leaves through the pool.
pub(crate) struct PoolPayout<'a> {
    pub pool: &'a AdminLiquidityPool,
    pub clearance: LiquidityClearance,
}

/// Owns every escrow lock and drives its state machine.
pub struct EscrowManager {
    ledger: Arc<LedgerService>,
    fees: Arc<FeeDistributionEngine>,
    admins: Arc<dyn AdminDirectory>,
    /// Latest lock per `(reference_id, owner)`, live or terminal.
    locks: DashMap<LockKey, LockSlot>,
    /// Terminal locks replaced by a newer lock on the same key.
    archive: Mutex<Vec<EscrowLock>>,
}

impl EscrowManager {
    #[must_use]
    pub fn new(
        ledger: Arc<LedgerService>,
        fees: Arc<FeeDistributionEngine>,
        admins: Arc<dyn AdminDirectory>,
    ) -> Self {
        Self {
            ledger,
            fees,
            admins,
            locks: DashMap::new(),
            archive: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<LedgerService> {
        &self.ledger
    }

    #[must_use]
    pub fn fees(&self) -> &Arc<FeeDistributionEngine> {
        &self.fees
    }

    /// Lock `amount` of the owner's available balance under `reference_id`.
    pub fn lock(
        &self,
        owner: OwnerId,
        currency: &str,
        amount: Decimal,
        reference_id: &ReferenceId,
        purpose: &str,
    ) -> Result<EscrowLock> {
        self.lock_until(owner, currency, amount, reference_id, purpose, None)
    }

    /// [`lock`](Self::lock) with an optional deadline, after which
    /// [`expire`](Self::expire) may return the funds.
    ///
    /// The balance is checked before the lock table, so of two racing
    /// locks on the same funds the loser sees `InsufficientAvailableBalance`.
    ///
    /// # Errors
    /// - `InvalidAmount` / `InvalidCurrency`
    /// - `InsufficientAvailableBalance`
    /// - `DuplicateLock` if a live lock exists for `(reference_id, owner)`;
    ///   the balance lock taken for it is rolled back
    pub fn lock_until(
        &self,
        owner: OwnerId,
        currency: &str,
        amount: Decimal,
        reference_id: &ReferenceId,
        purpose: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<EscrowLock> {
        validate_currency(currency)?;
        ensure_positive(amount)?;

        let key = (reference_id.clone(), owner);
        let entry = self.ledger.lock(
            owner,
            currency,
            amount,
            constants::OP_ESCROW_LOCK,
            reference_id,
        )?;
        let record = EscrowLock::new(
            owner,
            currency,
            amount,
            reference_id.clone(),
            purpose,
            expires_at,
        );

        match self.locks.entry(key) {
            Entry::Occupied(mut slot) => {
                let previous = guard(slot.get()).clone();
                if previous.status.is_live() {
                    drop(slot);
                    let mut compensation = Compensation::new(&self.ledger, reference_id.clone());
                    compensation.record(&entry);
                    return Err(compensation.rollback(LedgerError::DuplicateLock {
                        reference_id: reference_id.clone(),
                        owner,
                    }));
                }
                self.archive
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(previous);
                slot.insert(Arc::new(Mutex::new(record.clone())));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(record.clone())));
            }
        }

        tracing::info!(
            lock_id = %record.lock_id,
            owner = %owner,
            currency,
            amount = %amount,
            purpose,
            reference = %reference_id,
            "Escrow lock created"
        );
        Ok(record)
    }

    /// Consume a lock: pay the recipient net of fee and split the fee.
    ///
    /// A retry on a RELEASED lock returns the stored result and moves
    /// nothing.
    ///
    /// # Errors
    /// - `LockNotFound`, `AmbiguousLock`
    /// - `InvalidLockTransition` if the lock is unlocked or disputed
    /// - `InsufficientLockedBalance` if `gross_amount` exceeds the lock
    /// - any ledger error, after compensation
    pub fn release(&self, request: &ReleaseRequest) -> Result<ReleaseResult> {
        ensure_percent(request.fee_percent)?;
        let slot = self.find(&request.reference_id, request.owner)?;
        let mut lock = guard(&slot);

        match lock.status {
            LockStatus::Released => {
                return lock.release.clone().ok_or_else(|| {
                    LedgerError::Internal(format!(
                        "released lock {} has no stored result",
                        lock.lock_id
                    ))
                });
            }
            LockStatus::Active => {}
            from @ (LockStatus::Unlocked | LockStatus::Disputed) => {
                return Err(LedgerError::InvalidLockTransition {
                    reference_id: request.reference_id.clone(),
                    from,
                    to: LockStatus::Released,
                });
            }
        }

        let gross = request.gross_amount.unwrap_or(lock.amount);
        self.settle_locked(
            &mut lock,
            &Settlement {
                recipient: Some(request.recipient),
                gross,
                fee_percent: request.fee_percent,
                referrer: request.referrer,
                fee_type: &request.fee_type,
            },
            None,
        )
    }

    /// Return a lock's funds to the owner in full.
    pub fn unlock(&self, reference_id: &ReferenceId, reason: &str) -> Result<EscrowLock> {
        self.unlock_for(reference_id, None, reason)
    }

    /// [`unlock`](Self::unlock) for a specific owner's lock.
    ///
    /// Unlocking an UNLOCKED lock returns it unchanged.
    pub fn unlock_for(
        &self,
        reference_id: &ReferenceId,
        owner: Option<OwnerId>,
        reason: &str,
    ) -> Result<EscrowLock> {
        let slot = self.find(reference_id, owner)?;
        let mut lock = guard(&slot);
        match lock.status {
            LockStatus::Unlocked => Ok(lock.clone()),
            LockStatus::Active => {
                self.return_to_owner(&mut lock, reason)?;
                Ok(lock.clone())
            }
            from @ (LockStatus::Released | LockStatus::Disputed) => {
                Err(LedgerError::InvalidLockTransition {
                    reference_id: reference_id.clone(),
                    from,
                    to: LockStatus::Unlocked,
                })
            }
        }
    }

    /// Unlock an active lock whose deadline has passed at `now`.
    ///
    /// # Errors
    /// `LockNotExpired` if the lock has no deadline or it is still ahead.
    pub fn expire(&self, reference_id: &ReferenceId, now: DateTime<Utc>) -> Result<EscrowLock> {
        let slot = self.find(reference_id, None)?;
        let mut lock = guard(&slot);
        if lock.status != LockStatus::Active {
            return Err(LedgerError::InvalidLockTransition {
                reference_id: reference_id.clone(),
                from: lock.status,
                to: LockStatus::Unlocked,
            });
        }
        if !lock.is_expired_at(now) {
            return Err(LedgerError::LockNotExpired(reference_id.clone()));
        }
        self.return_to_owner(&mut lock, "expired")?;
        Ok(lock.clone())
    }

    /// Expire every active lock past its deadline. Returns the unlocked records.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Vec<EscrowLock> {
        let slots: Vec<LockSlot> = self.locks.iter().map(|r| r.value().clone()).collect();
        let mut expired = Vec::new();
        for slot in slots {
            let mut lock = guard(&slot);
            if lock.status != LockStatus::Active || !lock.is_expired_at(now) {
                continue;
            }
            match self.return_to_owner(&mut lock, "expired") {
                Ok(()) => expired.push(lock.clone()),
                Err(err) => tracing::error!(
                    lock_id = %lock.lock_id,
                    reference = %lock.reference_id,
                    error = %err,
                    "Failed to expire escrow lock"
                ),
            }
        }
        expired
    }

    /// Freeze an active lock pending admin resolution.
    pub fn open_dispute(
        &self,
        reference_id: &ReferenceId,
        owner: Option<OwnerId>,
        reason: &str,
    ) -> Result<EscrowLock> {
        let slot = self.find(reference_id, owner)?;
        let mut lock = guard(&slot);
        lock.transition(LockStatus::Disputed)?;
        lock.close_reason = Some(reason.to_string());
        tracing::warn!(
            lock_id = %lock.lock_id,
            owner = %lock.owner_id,
            reference = %reference_id,
            reason,
            "Escrow dispute opened"
        );
        Ok(lock.clone())
    }

    /// Close a disputed (or still active) lock by admin decision.
    ///
    /// `ReleaseTo` pays the winner the lock amount minus the configured
    /// dispute fee; `Refund` unlocks to the owner.
    ///
    /// Repeating a resolution that already took effect returns the stored
    /// lock.
    ///
    /// # Errors
    /// `Unauthorized` if `admin` is not known to the [`AdminDirectory`].
    pub fn resolve_dispute(
        &self,
        reference_id: &ReferenceId,
        resolution: DisputeResolution,
        admin: ActorId,
    ) -> Result<EscrowLock> {
        self.require_admin(admin, "resolve_dispute")?;
        let slot = self.find(reference_id, None)?;
        let mut lock = guard(&slot);

        let target = match resolution {
            DisputeResolution::ReleaseTo { .. } => LockStatus::Released,
            DisputeResolution::Refund => LockStatus::Unlocked,
        };
        let same_outcome = match resolution {
            DisputeResolution::ReleaseTo { winner } => lock
                .release
                .as_ref()
                .is_some_and(|r| r.recipient == Some(winner)),
            DisputeResolution::Refund => true,
        };
        if lock.status == target && same_outcome {
            return Ok(lock.clone());
        }
        if !lock.status.can_transition_to(target) {
            return Err(LedgerError::InvalidLockTransition {
                reference_id: reference_id.clone(),
                from: lock.status,
                to: target,
            });
        }

        tracing::info!(
            admin = %admin,
            lock_id = %lock.lock_id,
            reference = %reference_id,
            resolution = ?resolution,
            "Resolving escrow dispute"
        );

        match resolution {
            DisputeResolution::ReleaseTo { winner } => {
                let fee_percent = self.fees.config().dispute_fee_percent;
                let gross = lock.amount;
                self.settle_locked(
                    &mut lock,
                    &Settlement {
                        recipient: Some(winner),
                        gross,
                        fee_percent,
                        referrer: None,
                        fee_type: "dispute",
                    },
                    None,
                )?;
            }
            DisputeResolution::Refund => self.return_to_owner(&mut lock, "dispute refund")?,
        }
        lock.resolved_by = Some(admin);
        Ok(lock.clone())
    }

    /// Latest lock for `(reference_id, owner)`.
    #[must_use]
    pub fn get(&self, reference_id: &ReferenceId, owner: OwnerId) -> Option<EscrowLock> {
        self.locks
            .get(&(reference_id.clone(), owner))
            .map(|slot| guard(slot.value()).clone())
    }

    /// Every lock ever created under `reference_id`, archived ones first.
    #[must_use]
    pub fn history(&self, reference_id: &ReferenceId) -> Vec<EscrowLock> {
        let mut out: Vec<EscrowLock> = self
            .archive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|l| &l.reference_id == reference_id)
            .cloned()
            .collect();
        for slot in self.slots_for(reference_id) {
            out.push(guard(&slot).clone());
        }
        out
    }

    /// Number of live (active or disputed) locks.
    #[must_use]
    pub fn active_count(&self) -> usize {
        let slots: Vec<LockSlot> = self.locks.iter().map(|r| r.value().clone()).collect();
        slots
            .iter()
            .filter(|slot| guard(slot).status.is_live())
            .count()
    }

    /// Snapshot of the lock a reference resolves to.
    pub(crate) fn peek(&self, reference_id: &ReferenceId) -> Result<EscrowLock> {
        let slot = self.find(reference_id, None)?;
        let lock = guard(&slot).clone();
        Ok(lock)
    }

    pub(crate) fn require_admin(&self, actor: ActorId, action: &str) -> Result<()> {
        if self.admins.is_admin(actor) {
            return Ok(());
        }
        tracing::warn!(actor = %actor, action, "Rejected non-admin actor");
        Err(LedgerError::Unauthorized(actor.to_string()))
    }

    /// Release a lock whose net amount leaves the platform (withdrawal).
    ///
    /// A non-zero net amount needs `payout`, a clearance for exactly that
    /// amount; the pool is debited as part of the release. Returns the
    /// result and whether money moved in this call.
    pub(crate) fn release_external(
        &self,
        reference_id: &ReferenceId,
        fee_percent: Decimal,
        referrer: Option<ReferrerContext>,
        fee_type: &str,
        payout: Option<PoolPayout<'_>>,
    ) -> Result<(ReleaseResult, bool)> {
        let slot = self.find(reference_id, None)?;
        let mut lock = guard(&slot);
        match lock.status {
            LockStatus::Released => {
                let stored = lock.release.clone().ok_or_else(|| {
                    LedgerError::Internal(format!(
                        "released lock {} has no stored result",
                        lock.lock_id
                    ))
                })?;
                Ok((stored, false))
            }
            LockStatus::Active => {
                let gross = lock.amount;
                let result = self.settle_locked(
                    &mut lock,
                    &Settlement {
                        recipient: None,
                        gross,
                        fee_percent,
                        referrer,
                        fee_type,
                    },
                    payout,
                )?;
                Ok((result, true))
            }
            from => Err(LedgerError::InvalidLockTransition {
                reference_id: reference_id.clone(),
                from,
                to: LockStatus::Released,
            }),
        }
    }

    fn slots_for(&self, reference_id: &ReferenceId) -> Vec<LockSlot> {
        self.locks
            .iter()
            .filter(|r| &r.key().0 == reference_id)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Resolve the lock a call refers to.
    ///
    /// Without an owner: the single live lock under the reference, or the
    /// single terminal one if none is live.
    fn find(&self, reference_id: &ReferenceId, owner: Option<OwnerId>) -> Result<LockSlot> {
        if let Some(owner) = owner {
            return self
                .locks
                .get(&(reference_id.clone(), owner))
                .map(|slot| slot.value().clone())
                .ok_or_else(|| LedgerError::LockNotFound(reference_id.clone()));
        }

        let slots = self.slots_for(reference_id);
        let (live, terminal): (Vec<_>, Vec<_>) = slots
            .into_iter()
            .partition(|slot| guard(slot).status.is_live());
        let candidates = if live.is_empty() { terminal } else { live };
        match candidates.len() {
            0 => Err(LedgerError::LockNotFound(reference_id.clone())),
            1 => candidates
                .into_iter()
                .next()
                .ok_or_else(|| LedgerError::LockNotFound(reference_id.clone())),
            _ => Err(LedgerError::AmbiguousLock(reference_id.clone())),
        }
    }

    fn return_to_owner(&self, lock: &mut EscrowLock, reason: &str) -> Result<()> {
        self.ledger.unlock(
            lock.owner_id,
            &lock.currency,
            lock.amount,
            constants::OP_ESCROW_UNLOCK,
            &lock.reference_id,
        )?;
        lock.transition(LockStatus::Unlocked)?;
        lock.close_reason = Some(reason.to_string());
        tracing::info!(
            lock_id = %lock.lock_id,
            owner = %lock.owner_id,
            currency = %lock.currency,
            amount = %lock.amount,
            reference = %lock.reference_id,
            reason,
            "Escrow lock returned to owner"
        );
        Ok(())
    }

    fn settle_locked(
        &self,
        lock: &mut EscrowLock,
        s: &Settlement<'_>,
        payout: Option<PoolPayout<'_>>,
    ) -> Result<ReleaseResult> {
        ensure_positive(s.gross)?;
        if !lock.status.can_transition_to(LockStatus::Released) {
            return Err(LedgerError::InvalidLockTransition {
                reference_id: lock.reference_id.clone(),
                from: lock.status,
                to: LockStatus::Released,
            });
        }
        if s.gross > lock.amount {
            return Err(LedgerError::InsufficientLockedBalance {
                owner: lock.owner_id,
                currency: lock.currency.clone(),
                needed: s.gross,
                locked: lock.amount,
            });
        }
        let fee = self.fees.compute_fee(s.gross, s.fee_percent)?;
        let split = self.fees.compute_split(fee, s.referrer)?;
        let net = s.gross - fee;
        let remainder = lock.amount - s.gross;
        if s.recipient.is_none() {
            let cleared = payout
                .as_ref()
                .map_or(Decimal::ZERO, |p| p.clearance.amount());
            let same_currency = payout
                .as_ref()
                .is_none_or(|p| p.clearance.currency() == lock.currency);
            if cleared != net || !same_currency {
                return Err(LedgerError::Internal(format!(
                    "payout of {net} {} for lock {} not covered by clearance of {cleared}",
                    lock.currency, lock.lock_id
                )));
            }
        }

        let payer = lock.owner_id;
        let currency = lock.currency.clone();
        let reference_id = lock.reference_id.clone();
        let mut compensation = Compensation::new(&self.ledger, reference_id.clone());

        let consumed = self.ledger.release_locked(
            payer,
            &currency,
            s.gross,
            constants::OP_ESCROW_RELEASE,
            &reference_id,
        )?;
        compensation.record(&consumed);

        if let Some(recipient) = s.recipient.filter(|_| net > Decimal::ZERO) {
            match self.ledger.post(
                recipient,
                &currency,
                BalanceMutation::Credit(net),
                constants::OP_ESCROW_RELEASE,
                &reference_id,
                None,
            ) {
                Ok(entry) => compensation.record(&entry),
                Err(err) => return Err(compensation.rollback(err)),
            }
        }

        if let Some(PoolPayout { pool, clearance }) = payout {
            match pool.debit(clearance, s.fee_type, &reference_id, None) {
                Ok(entry) => compensation.record(&entry),
                Err(err) => return Err(compensation.rollback(err)),
            }
        }

        if remainder > Decimal::ZERO {
            match self.ledger.unlock(
                payer,
                &currency,
                remainder,
                constants::OP_ESCROW_UNLOCK,
                &reference_id,
            ) {
                Ok(entry) => compensation.record(&entry),
                Err(err) => return Err(compensation.rollback(err)),
            }
        }

        // Last fallible step: the fee engine compensates its own credits.
        if let Err(err) = self.fees.book(&split, &currency, payer, s.fee_type, &reference_id) {
            return Err(compensation.rollback(err));
        }
        compensation.commit();
        lock.transition(LockStatus::Released)?;

        let result = ReleaseResult {
            lock_id: lock.lock_id,
            reference_id: reference_id.clone(),
            currency,
            payer,
            recipient: s.recipient,
            gross_amount: s.gross,
            fee: split,
            net_amount: net,
            returned_to_payer: remainder,
            released_at: Utc::now(),
        };
        lock.release = Some(result.clone());

        tracing::info!(
            lock_id = %lock.lock_id,
            payer = %payer,
            recipient = ?s.recipient,
            gross = %s.gross,
            fee = %fee,
            net = %net,
            commission = %split.commission_amount,
            reference = %reference_id,
            "Escrow released"
        );
        Ok(result)
    }
}

impl std::fmt::Debug for EscrowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowManager")
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commission::InMemoryCommissionLog;
    use crate::config::StaticConfig;
    use custodia_ledger::{InMemoryAccountStore, InMemoryJournal};
    use custodia_types::{ReferralTier, UserId};

    struct Fixture {
        ledger: Arc<LedgerService>,
        escrow: EscrowManager,
        admin: ActorId,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(LedgerService::new(
            Arc::new(InMemoryAccountStore::new()),
            Arc::new(InMemoryJournal::new()),
        ));
        let fees = Arc::new(FeeDistributionEngine::new(
            ledger.clone(),
            Arc::new(StaticConfig::default()),
            Arc::new(InMemoryCommissionLog::new()),
        ));
        let admin = ActorId::new();
        let escrow = EscrowManager::new(
            ledger.clone(),
            fees,
            Arc::new(StaticAdminDirectory::new([admin])),
        );
        Fixture {
            ledger,
            escrow,
            admin,
        }
    }

    fn funded(f: &Fixture, amount: i64) -> OwnerId {
        let owner = OwnerId::User(UserId::new());
        f.ledger
            .credit(
                owner,
                "BTC",
                Decimal::new(amount, 0),
                "deposit",
                &ReferenceId::new(format!("fund-{owner}")),
                None,
            )
            .unwrap();
        owner
    }

    fn dec(n: i64) -> Decimal {
        Decimal::new(n, 0)
    }

    #[test]
    fn lock_moves_funds() {
        let f = fixture();
        let a = funded(&f, 100);
        let lock = f
            .escrow
            .lock(a, "BTC", dec(30), &"t1".into(), "p2p_trade")
            .unwrap();
        assert_eq!(lock.status, LockStatus::Active);
        let b = f.ledger.balance(a, "BTC");
        assert_eq!((b.available, b.locked), (dec(70), dec(30)));
        assert_eq!(f.escrow.active_count(), 1);
    }

    #[test]
    fn duplicate_lock_rejected() {
        let f = fixture();
        let a = funded(&f, 100);
        f.escrow.lock(a, "BTC", dec(30), &"t1".into(), "p2p_trade").unwrap();
        let err = f
            .escrow
            .lock(a, "BTC", dec(10), &"t1".into(), "p2p_trade")
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateLock { .. }));
        assert_eq!(f.ledger.balance(a, "BTC").locked, dec(30));
    }

    #[test]
    fn relock_after_unlock_archives_previous() {
        let f = fixture();
        let a = funded(&f, 100);
        let r = ReferenceId::from("t1");
        f.escrow.lock(a, "BTC", dec(30), &r, "p2p_trade").unwrap();
        f.escrow.unlock(&r, "cancelled").unwrap();
        f.escrow.lock(a, "BTC", dec(20), &r, "p2p_trade").unwrap();
        let history = f.escrow.history(&r);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, LockStatus::Unlocked);
        assert_eq!(history[1].status, LockStatus::Active);
    }

    #[test]
    fn lock_insufficient_writes_nothing() {
        let f = fixture();
        let a = funded(&f, 10);
        let err = f
            .escrow
            .lock(a, "BTC", dec(11), &"t1".into(), "p2p_trade")
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientAvailableBalance { .. }));
        assert!(f.escrow.get(&"t1".into(), a).is_none());
    }

    #[test]
    fn release_splits_fee() {
        let f = fixture();
        let a = funded(&f, 100);
        let b = OwnerId::User(UserId::new());
        let referrer = UserId::new();
        f.escrow.lock(a, "BTC", dec(30), &"t1".into(), "p2p_trade").unwrap();

        let request = ReleaseRequest::new("t1", b, dec(10))
            .referrer(ReferrerContext::new(referrer, ReferralTier::Standard));
        let result = f.escrow.release(&request).unwrap();

        assert_eq!(result.fee.gross_fee, dec(3));
        assert_eq!(result.net_amount, dec(27));
        assert_eq!(f.ledger.balance(b, "BTC").available, dec(27));
        assert_eq!(
            f.ledger.balance(OwnerId::User(referrer), "BTC").available,
            Decimal::new(6, 1)
        );
        assert_eq!(
            f.ledger.balance(OwnerId::AdminRevenue, "BTC").available,
            Decimal::new(24, 1)
        );
        let a_after = f.ledger.balance(a, "BTC");
        assert_eq!((a_after.available, a_after.locked), (dec(70), dec(0)));
    }

    #[test]
    fn release_is_idempotent() {
        let f = fixture();
        let a = funded(&f, 100);
        let b = OwnerId::User(UserId::new());
        f.escrow.lock(a, "BTC", dec(30), &"t1".into(), "p2p_trade").unwrap();
        let request = ReleaseRequest::new("t1", b, dec(10));
        let first = f.escrow.release(&request).unwrap();
        let journal_len = f.ledger.journal().len();
        let second = f.escrow.release(&request).unwrap();
        assert_eq!(first, second);
        assert_eq!(f.ledger.journal().len(), journal_len);
        assert_eq!(f.ledger.balance(b, "BTC").available, dec(27));
    }

    #[test]
    fn partial_release_returns_remainder() {
        let f = fixture();
        let a = funded(&f, 100);
        let b = OwnerId::User(UserId::new());
        f.escrow.lock(a, "BTC", dec(30), &"t1".into(), "p2p_trade").unwrap();
        let result = f
            .escrow
            .release(&ReleaseRequest::new("t1", b, Decimal::ZERO).gross_amount(dec(20)))
            .unwrap();
        assert_eq!(result.returned_to_payer, dec(10));
        let a_after = f.ledger.balance(a, "BTC");
        assert_eq!((a_after.available, a_after.locked), (dec(80), dec(0)));
        assert_eq!(f.ledger.balance(b, "BTC").available, dec(20));
    }

    #[test]
    fn release_more_than_locked_rejected() {
        let f = fixture();
        let a = funded(&f, 100);
        f.escrow.lock(a, "BTC", dec(30), &"t1".into(), "p2p_trade").unwrap();
        let err = f
            .escrow
            .release(
                &ReleaseRequest::new("t1", OwnerId::AdminRevenue, Decimal::ONE)
                    .gross_amount(dec(31)),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientLockedBalance { .. }));
        assert_eq!(f.ledger.balance(a, "BTC").locked, dec(30));
    }

    #[test]
    fn release_unknown_reference() {
        let f = fixture();
        let err = f
            .escrow
            .release(&ReleaseRequest::new("nope", OwnerId::AdminRevenue, Decimal::ONE))
            .unwrap_err();
        assert!(matches!(err, LedgerError::LockNotFound(_)));
    }

    #[test]
    fn ambiguous_reference_needs_owner() {
        let f = fixture();
        let (a, c) = (funded(&f, 50), funded(&f, 50));
        let b = OwnerId::User(UserId::new());
        f.escrow.lock(a, "BTC", dec(10), &"t1".into(), "p2p_trade").unwrap();
        f.escrow.lock(c, "BTC", dec(10), &"t1".into(), "p2p_trade").unwrap();

        let err = f
            .escrow
            .release(&ReleaseRequest::new("t1", b, Decimal::ZERO))
            .unwrap_err();
        assert!(matches!(err, LedgerError::AmbiguousLock(_)));

        f.escrow
            .release(&ReleaseRequest::new("t1", b, Decimal::ZERO).owner(c))
            .unwrap();
        assert_eq!(f.ledger.balance(b, "BTC").available, dec(10));
    }

    #[test]
    fn unlock_returns_funds_and_blocks_release() {
        let f = fixture();
        let a = funded(&f, 100);
        let r = ReferenceId::from("t1");
        f.escrow.lock(a, "BTC", dec(30), &r, "p2p_trade").unwrap();
        let lock = f.escrow.unlock(&r, "buyer cancelled").unwrap();
        assert_eq!(lock.status, LockStatus::Unlocked);
        assert_eq!(lock.close_reason.as_deref(), Some("buyer cancelled"));
        assert_eq!(f.ledger.balance(a, "BTC").available, dec(100));

        // Second unlock is a no-op.
        f.escrow.unlock(&r, "again").unwrap();
        assert_eq!(f.ledger.balance(a, "BTC").available, dec(100));

        let err = f
            .escrow
            .release(&ReleaseRequest::new("t1", OwnerId::AdminRevenue, Decimal::ONE))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidLockTransition { .. }));
    }

    #[test]
    fn expiry() {
        let f = fixture();
        let a = funded(&f, 100);
        let r = ReferenceId::from("t1");
        let deadline = Utc::now() + chrono::Duration::minutes(15);
        f.escrow
            .lock_until(a, "BTC", dec(30), &r, "p2p_trade", Some(deadline))
            .unwrap();

        let err = f.escrow.expire(&r, Utc::now()).unwrap_err();
        assert!(matches!(err, LedgerError::LockNotExpired(_)));

        let later = deadline + chrono::Duration::seconds(1);
        assert_eq!(f.escrow.expire_due(later).len(), 1);
        assert_eq!(f.ledger.balance(a, "BTC").available, dec(100));
        assert_eq!(f.escrow.active_count(), 0);
    }

    #[test]
    fn dispute_blocks_release_until_resolved() {
        let f = fixture();
        let a = funded(&f, 100);
        let b = OwnerId::User(UserId::new());
        let r = ReferenceId::from("t1");
        f.escrow.lock(a, "BTC", dec(30), &r, "p2p_trade").unwrap();
        f.escrow.open_dispute(&r, None, "payment not received").unwrap();

        let err = f
            .escrow
            .release(&ReleaseRequest::new("t1", b, Decimal::ONE))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidLockTransition { .. }));
        assert!(f.escrow.unlock(&r, "cancel").is_err());

        let err = f
            .escrow
            .resolve_dispute(&r, DisputeResolution::ReleaseTo { winner: b }, ActorId::new())
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        let lock = f
            .escrow
            .resolve_dispute(&r, DisputeResolution::ReleaseTo { winner: b }, f.admin)
            .unwrap();
        assert_eq!(lock.status, LockStatus::Released);
        assert_eq!(lock.resolved_by, Some(f.admin));
        // Default dispute fee is zero.
        assert_eq!(f.ledger.balance(b, "BTC").available, dec(30));

        // A retried resolution returns the stored lock and moves nothing.
        let again = f
            .escrow
            .resolve_dispute(&r, DisputeResolution::ReleaseTo { winner: b }, f.admin)
            .unwrap();
        assert_eq!(again, lock);
        assert_eq!(f.ledger.balance(b, "BTC").available, dec(30));

        // A different outcome on a closed lock is still refused.
        let err = f
            .escrow
            .resolve_dispute(&r, DisputeResolution::ReleaseTo { winner: a }, f.admin)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidLockTransition { .. }));
        let err = f
            .escrow
            .resolve_dispute(&r, DisputeResolution::Refund, f.admin)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidLockTransition { .. }));
    }

    #[test]
    fn dispute_refund() {
        let f = fixture();
        let a = funded(&f, 100);
        let r = ReferenceId::from("t1");
        f.escrow.lock(a, "BTC", dec(30), &r, "p2p_trade").unwrap();
        f.escrow.open_dispute(&r, Some(a), "seller unresponsive").unwrap();
        let lock = f
            .escrow
            .resolve_dispute(&r, DisputeResolution::Refund, f.admin)
            .unwrap();
        assert_eq!(lock.status, LockStatus::Unlocked);
        assert_eq!(f.ledger.balance(a, "BTC").available, dec(100));

        let again = f
            .escrow
            .resolve_dispute(&r, DisputeResolution::Refund, f.admin)
            .unwrap();
        assert_eq!(again, lock);
        assert_eq!(f.ledger.balance(a, "BTC").available, dec(100));
    }
}
