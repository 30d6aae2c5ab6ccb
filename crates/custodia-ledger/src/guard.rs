//! Pre-flight liquidity check for platform-funded payouts.
//!
//! `check` is read-only. `authorize` turns a passing check into a
//! [`LiquidityClearance`], the only way to debit the pool, so every pool
//! debit is preceded by a check in the same request.

use std::sync::Arc;

use custodia_types::{
    EntryKind, LiquidityCheckResult, OwnerId, ReferenceId, Result, UserId, ensure_positive,
    validate_currency,
};
use rust_decimal::Decimal;

use crate::compensation::Compensation;
use crate::idempotency::OperationKey;
use crate::pool::{AdminLiquidityPool, LiquidityClearance};
use crate::service::{LedgerService, TransferReceipt};

/// Admission control in front of [`AdminLiquidityPool`].
#[derive(Debug, Clone)]
pub struct LiquidityGuard {
    pool: Arc<AdminLiquidityPool>,
}

impl LiquidityGuard {
    #[must_use]
    pub fn new(pool: Arc<AdminLiquidityPool>) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<AdminLiquidityPool> {
        &self.pool
    }

    fn ledger(&self) -> &LedgerService {
        self.pool.ledger()
    }

    /// Compare `amount` against the pool's available balance.
    ///
    /// A failing comparison is a normal result (`can_execute == false`),
    /// logged at warn with the requester and shortage. Invalid input is an
    /// error.
    pub fn check(
        &self,
        currency: &str,
        amount: Decimal,
        operation_type: &str,
        requester: OwnerId,
        metadata: Option<&serde_json::Value>,
    ) -> Result<LiquidityCheckResult> {
        validate_currency(currency)?;
        ensure_positive(amount)?;

        let result = LiquidityCheckResult::evaluate(currency, self.pool.available(currency), amount);
        if result.can_execute {
            tracing::debug!(
                currency,
                required = %amount,
                available = %result.available_liquidity,
                operation = operation_type,
                requester = %requester,
                "Liquidity check passed"
            );
        } else {
            tracing::warn!(
                currency,
                required = %amount,
                available = %result.available_liquidity,
                shortage = %result.shortage,
                operation = operation_type,
                requester = %requester,
                metadata = ?metadata,
                "Liquidity check rejected payout"
            );
        }
        Ok(result)
    }

    /// Run [`check`](Self::check) and issue a clearance if it passes.
    ///
    /// # Errors
    /// `InsufficientPoolLiquidity` (with the shortage) when the pool cannot
    /// cover `amount`. No state changes either way.
    pub fn authorize(
        &self,
        currency: &str,
        amount: Decimal,
        operation_type: &str,
        requester: OwnerId,
        metadata: Option<&serde_json::Value>,
    ) -> Result<LiquidityClearance> {
        let result = self.check(currency, amount, operation_type, requester, metadata)?;
        if !result.can_execute {
            return Err(result.to_error());
        }
        Ok(LiquidityClearance::new(result))
    }

    /// Platform-funded payout to a user: check, debit pool, credit user.
    ///
    /// If the user credit fails, the pool debit is compensated. A retry of a
    /// completed payout returns the original receipt without a new check,
    /// whatever the pool holds now.
    pub fn payout(
        &self,
        user: UserId,
        currency: &str,
        amount: Decimal,
        operation_type: &str,
        reference_id: &ReferenceId,
    ) -> Result<TransferReceipt> {
        let requester = OwnerId::User(user);
        if let Some(receipt) = self.prior_payout(requester, currency, operation_type, reference_id) {
            tracing::info!(
                user = %user,
                currency,
                operation = operation_type,
                reference = %reference_id,
                "Payout already executed, returning prior receipt"
            );
            return Ok(receipt);
        }

        let clearance = self.authorize(currency, amount, operation_type, requester, None)?;
        let pool_debit = self
            .pool
            .debit(clearance, operation_type, reference_id, None)?;

        let mut compensation = Compensation::new(self.ledger(), reference_id.clone());
        compensation.record(&pool_debit);
        match self
            .ledger()
            .credit(requester, currency, amount, operation_type, reference_id, None)
        {
            Ok(user_credit) => {
                compensation.commit();
                tracing::info!(
                    user = %user,
                    currency,
                    amount = %amount,
                    operation = operation_type,
                    reference = %reference_id,
                    pool_available = %pool_debit.resulting_available,
                    "Platform payout executed"
                );
                Ok(TransferReceipt {
                    debit: pool_debit,
                    credit: user_credit,
                })
            }
            Err(err) => Err(compensation.rollback(err)),
        }
    }

    fn prior_payout(
        &self,
        requester: OwnerId,
        currency: &str,
        operation_type: &str,
        reference_id: &ReferenceId,
    ) -> Option<TransferReceipt> {
        let leg = |owner, kind| OperationKey {
            owner,
            currency: currency.to_string(),
            kind,
            operation_type: operation_type.to_string(),
            reference_id: reference_id.clone(),
        };
        let debit = self
            .ledger()
            .prior_entry(&leg(OwnerId::LiquidityPool, EntryKind::Debit))?;
        let credit = self
            .ledger()
            .prior_entry(&leg(requester, EntryKind::Credit))?;
        Some(TransferReceipt { debit, credit })
    }

    /// User-funded sale to the platform: debit user, credit pool.
    pub fn absorb(
        &self,
        user: UserId,
        currency: &str,
        amount: Decimal,
        operation_type: &str,
        reference_id: &ReferenceId,
    ) -> Result<TransferReceipt> {
        let receipt = self.ledger().transfer(
            OwnerId::User(user),
            OwnerId::LiquidityPool,
            currency,
            amount,
            operation_type,
            reference_id,
        )?;
        tracing::info!(
            user = %user,
            currency,
            amount = %amount,
            operation = operation_type,
            reference = %reference_id,
            "Pool absorbed user funds"
        );
        Ok(receipt)
    }
}
