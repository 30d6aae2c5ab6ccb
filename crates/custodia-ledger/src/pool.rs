//! The platform's own reserves, one account per currency.
//!
//! Platform-funded payouts come out of the pool; user-funded sales go into
//! it. The pool can only be debited with a [`LiquidityClearance`] issued by
//! the guard, and the store refuses any debit that would take it negative.

use std::sync::Arc;

use custodia_types::{
    BalanceView, Currency, LedgerEntry, LedgerError, LiquidityCheckResult, OwnerId, ReferenceId,
    Result, constants,
};
use rust_decimal::Decimal;

use crate::service::LedgerService;
use crate::store::BalanceMutation;

/// Proof that a liquidity check passed for one pool debit.
///
/// Only [`LiquidityGuard::authorize`](crate::LiquidityGuard::authorize)
/// creates one, and [`AdminLiquidityPool::debit`] consumes it.
#[derive(Debug)]
#[must_use = "a clearance authorizes exactly one pool debit"]
pub struct LiquidityClearance {
    check: LiquidityCheckResult,
}

impl LiquidityClearance {
    pub(crate) fn new(check: LiquidityCheckResult) -> Self {
        Self { check }
    }

    pub fn currency(&self) -> &str {
        &self.check.currency
    }

    pub fn amount(&self) -> Decimal {
        self.check.required_liquidity
    }

    /// The passing check this clearance was issued for.
    pub fn check(&self) -> &LiquidityCheckResult {
        &self.check
    }
}

/// Liquidity pool accounts owned by [`OwnerId::LiquidityPool`].
#[derive(Debug, Clone)]
pub struct AdminLiquidityPool {
    ledger: Arc<LedgerService>,
}

impl AdminLiquidityPool {
    #[must_use]
    pub fn new(ledger: Arc<LedgerService>) -> Self {
        Self { ledger }
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<LedgerService> {
        &self.ledger
    }

    /// Spendable pool balance for `currency`.
    #[must_use]
    pub fn available(&self, currency: &str) -> Decimal {
        self.ledger
            .store()
            .get(OwnerId::LiquidityPool, currency)
            .available
    }

    #[must_use]
    pub fn balance(&self, currency: &str) -> BalanceView {
        self.ledger.balance(OwnerId::LiquidityPool, currency)
    }

    /// Fund the pool with platform reserves. Idempotent per reference.
    pub fn inject(
        &self,
        currency: &str,
        amount: Decimal,
        reference_id: &ReferenceId,
    ) -> Result<LedgerEntry> {
        let (entry, fresh) = self.ledger.post_once(
            OwnerId::LiquidityPool,
            currency,
            BalanceMutation::Credit(amount),
            constants::OP_POOL_INJECTION,
            reference_id,
            None,
        )?;
        if fresh {
            self.ledger.supply().record_injection(currency, amount);
            tracing::info!(
                currency,
                amount = %amount,
                pool_available = %entry.resulting_available,
                reference = %reference_id,
                "Liquidity injected"
            );
        }
        Ok(entry)
    }

    /// Credit the pool (user-funded operation).
    pub fn credit(
        &self,
        currency: &str,
        amount: Decimal,
        operation_type: &str,
        reference_id: &ReferenceId,
    ) -> Result<LedgerEntry> {
        self.ledger.credit(
            OwnerId::LiquidityPool,
            currency,
            amount,
            operation_type,
            reference_id,
            None,
        )
    }

    /// Debit the pool for a cleared payout.
    ///
    /// # Errors
    /// `InsufficientPoolLiquidity` if the pool was drained between the check
    /// and this debit; nothing is written in that case.
    pub fn debit(
        &self,
        clearance: LiquidityClearance,
        operation_type: &str,
        reference_id: &ReferenceId,
        metadata: Option<serde_json::Value>,
    ) -> Result<LedgerEntry> {
        let currency = clearance.currency().to_string();
        let amount = clearance.amount();
        self.ledger
            .debit(
                OwnerId::LiquidityPool,
                &currency,
                amount,
                operation_type,
                reference_id,
                metadata,
            )
            .map_err(|err| match err {
                LedgerError::InsufficientAvailableBalance { available, .. } => {
                    tracing::warn!(
                        currency = %currency,
                        required = %amount,
                        available = %available,
                        reference = %reference_id,
                        "Pool drained after liquidity check"
                    );
                    LiquidityCheckResult::evaluate(&currency, available, amount).to_error()
                }
                other => other,
            })
    }

    /// Currencies the pool holds a non-zero balance in.
    #[must_use]
    pub fn currencies(&self) -> Vec<Currency> {
        let mut out: Vec<Currency> = self
            .ledger
            .supply()
            .tracked_currencies()
            .into_iter()
            .filter(|c| !self.balance(c).total.is_zero())
            .collect();
        out.sort();
        out
    }
}
