//! Withdrawal desk: request → admin approval or rejection.
//!
//! A request locks the user's funds. Approval clears the on-chain payout
//! against the liquidity pool, then consumes the lock, debits the pool for
//! the net amount and books the withdrawal fee in one compensated sequence.
//! Rejection unlocks.

use std::sync::Arc;

use custodia_ledger::LiquidityGuard;
use custodia_types::{
    ActorId, Currency, EscrowLock, FeeSplit, LedgerError, LiquidityCheckResult, LockId,
    LockStatus, OwnerId, ReferenceId, ReferrerContext, Result, UserId, constants,
};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::escrow::{EscrowManager, PoolPayout};

const PURPOSE: &str = "withdrawal";

/// Outcome of an approved withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WithdrawalReceipt {
    pub lock_id: LockId,
    pub reference_id: ReferenceId,
    pub owner: OwnerId,
    pub currency: Currency,
    pub gross_amount: Decimal,
    pub fee: FeeSplit,
    /// Amount sent out of the platform from the liquidity pool.
    pub net_amount: Decimal,
    /// Guard result; `None` for a replay or when nothing is paid out.
    pub liquidity: Option<LiquidityCheckResult>,
    pub approved_by: ActorId,
}

/// Withdrawal workflow over escrow, fees and the liquidity guard.
#[derive(Debug)]
pub struct WithdrawalDesk {
    escrow: Arc<EscrowManager>,
    guard: Arc<LiquidityGuard>,
}

impl WithdrawalDesk {
    #[must_use]
    pub fn new(escrow: Arc<EscrowManager>, guard: Arc<LiquidityGuard>) -> Self {
        Self { escrow, guard }
    }

    /// Lock `amount` pending approval.
    pub fn request(
        &self,
        user: UserId,
        currency: &str,
        amount: Decimal,
        reference_id: &ReferenceId,
    ) -> Result<EscrowLock> {
        self.escrow
            .lock(OwnerId::User(user), currency, amount, reference_id, PURPOSE)
    }

    /// Pay out a pending withdrawal.
    ///
    /// # Errors
    /// - `Unauthorized` for a non-admin actor
    /// - `LockNotFound` if the reference is not a withdrawal
    /// - `InsufficientPoolLiquidity` if the platform cannot cover the net
    ///   payout; the request stays pending and nothing moves
    pub fn approve(
        &self,
        reference_id: &ReferenceId,
        admin: ActorId,
        referrer: Option<ReferrerContext>,
    ) -> Result<WithdrawalReceipt> {
        self.escrow.require_admin(admin, "approve_withdrawal")?;
        let pending = self.withdrawal(reference_id)?;
        let fees = self.escrow.fees();
        let fee_percent = fees.config().withdrawal_fee_percent;

        let clearance = if pending.status == LockStatus::Active {
            let fee = fees.compute_fee(pending.amount, fee_percent)?;
            let net = pending.amount - fee;
            if net > Decimal::ZERO {
                Some(self.guard.authorize(
                    &pending.currency,
                    net,
                    constants::OP_WITHDRAWAL,
                    pending.owner_id,
                    None,
                )?)
            } else {
                None
            }
        } else {
            None
        };
        let liquidity = clearance.as_ref().map(|c| c.check().clone());
        let payout = clearance.map(|clearance| PoolPayout {
            pool: self.guard.pool(),
            clearance,
        });

        let (release, fresh) = self.escrow.release_external(
            reference_id,
            fee_percent,
            referrer,
            constants::OP_WITHDRAWAL,
            payout,
        )?;
        if fresh && release.net_amount > Decimal::ZERO {
            let supply = self.escrow.ledger().supply();
            supply.record_withdrawal(&release.currency, release.net_amount);
            supply.record_reclaim(&release.currency, release.net_amount);
        }

        tracing::info!(
            admin = %admin,
            owner = %release.payer,
            currency = %release.currency,
            gross = %release.gross_amount,
            net = %release.net_amount,
            reference = %reference_id,
            replay = !fresh,
            "Withdrawal approved"
        );
        Ok(WithdrawalReceipt {
            lock_id: release.lock_id,
            reference_id: reference_id.clone(),
            owner: release.payer,
            currency: release.currency,
            gross_amount: release.gross_amount,
            fee: release.fee,
            net_amount: release.net_amount,
            liquidity: if fresh { liquidity } else { None },
            approved_by: admin,
        })
    }

    /// Cancel a pending withdrawal and return the funds.
    pub fn reject(
        &self,
        reference_id: &ReferenceId,
        admin: ActorId,
        reason: &str,
    ) -> Result<EscrowLock> {
        self.escrow.require_admin(admin, "reject_withdrawal")?;
        self.withdrawal(reference_id)?;
        let lock = self.escrow.unlock(reference_id, reason)?;
        tracing::info!(admin = %admin, reference = %reference_id, reason, "Withdrawal rejected");
        Ok(lock)
    }

    fn withdrawal(&self, reference_id: &ReferenceId) -> Result<EscrowLock> {
        let lock = self.escrow.peek(reference_id)?;
        if lock.purpose != PURPOSE {
            return Err(LedgerError::LockNotFound(reference_id.clone()));
        }
        Ok(lock)
    }
}
