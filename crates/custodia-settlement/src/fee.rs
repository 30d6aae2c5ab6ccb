//! Fee computation and multi-party fee settlement.
//!
//! ```text
//! gross_fee ──┬── commission_amount = trunc8(gross_fee × tier% / 100) ──▶ referrer
//!             └── admin_amount      = gross_fee − commission_amount   ──▶ admin revenue
//! ```
//!
//! Commission is always a share of the fee, never of the traded amount.
//! The engine reads the tier percentages from its [`ConfigProvider`] on
//! every call.

use std::sync::Arc;

use custodia_ledger::{BalanceMutation, Compensation, LedgerService};
use custodia_types::{
    FeeConfig, FeeSplit, LedgerError, OwnerId, ReferenceId, ReferrerContext, Result, constants,
    ensure_percent, percent_of,
};
use dashmap::DashSet;
use rust_decimal::Decimal;

use crate::commission::{CommissionLog, CommissionRecord};
use crate::config::ConfigProvider;

/// Splits fees between the platform and referrers and books the credits.
pub struct FeeDistributionEngine {
    ledger: Arc<LedgerService>,
    config: Arc<dyn ConfigProvider>,
    log: Arc<dyn CommissionLog>,
    /// `(reference_id, fee_type, payer)` settlements currently running.
    in_flight: DashSet<(ReferenceId, String, OwnerId)>,
}

impl FeeDistributionEngine {
    #[must_use]
    pub fn new(
        ledger: Arc<LedgerService>,
        config: Arc<dyn ConfigProvider>,
        log: Arc<dyn CommissionLog>,
    ) -> Self {
        Self {
            ledger,
            config,
            log,
            in_flight: DashSet::new(),
        }
    }

    /// Current fee schedule.
    #[must_use]
    pub fn config(&self) -> FeeConfig {
        self.config.fee_config()
    }

    #[must_use]
    pub fn commission_log(&self) -> &Arc<dyn CommissionLog> {
        &self.log
    }

    /// `amount * fee_percent / 100`, truncated to the amount precision.
    ///
    /// # Errors
    /// `InvalidAmount` for a negative amount, `InvalidPercent` outside `0..=100`.
    pub fn compute_fee(&self, amount: Decimal, fee_percent: Decimal) -> Result<Decimal> {
        if amount.is_sign_negative() {
            return Err(LedgerError::InvalidAmount { amount });
        }
        ensure_percent(fee_percent)?;
        percent_of(amount, fee_percent)
    }

    /// Divide `gross_fee` between admin revenue and an optional referrer.
    ///
    /// `admin_amount + commission_amount == gross_fee` exactly.
    pub fn compute_split(
        &self,
        gross_fee: Decimal,
        referrer: Option<ReferrerContext>,
    ) -> Result<FeeSplit> {
        if gross_fee.is_sign_negative() {
            return Err(LedgerError::InvalidAmount { amount: gross_fee });
        }
        let Some(referrer) = referrer else {
            return Ok(FeeSplit::admin_only(gross_fee));
        };

        let commission_percent = self.config().commission_percent(referrer.tier);
        let commission_amount = percent_of(gross_fee, commission_percent)?;
        Ok(FeeSplit {
            gross_fee,
            referrer_id: Some(referrer.referrer_id),
            referrer_tier: Some(referrer.tier),
            commission_percent,
            commission_amount,
            admin_amount: gross_fee - commission_amount,
        })
    }

    /// Book a computed split. The payer has already been charged.
    ///
    /// Credits admin revenue and, when a commission is due, the referrer;
    /// then writes one audit row. A repeated call for the same
    /// `(reference_id, fee_type)` returns the existing row.
    ///
    /// # Errors
    /// - `OperationInProgress` if the same settlement is running concurrently
    /// - ledger errors after compensating any credit already made
    /// - `RollbackFailure` if that compensation failed
    pub fn settle(
        &self,
        split: &FeeSplit,
        currency: &str,
        payer: OwnerId,
        fee_type: &str,
        reference_id: &ReferenceId,
    ) -> Result<CommissionRecord> {
        if !split.is_balanced() {
            return Err(LedgerError::Internal(format!(
                "unbalanced fee split for {reference_id}: {} + {} != {}",
                split.admin_amount, split.commission_amount, split.gross_fee
            )));
        }
        let claim = (reference_id.clone(), fee_type.to_string(), payer);
        if !self.in_flight.insert(claim.clone()) {
            return Err(LedgerError::OperationInProgress(reference_id.clone()));
        }
        let outcome = self.settle_claimed(split, currency, payer, fee_type, reference_id);
        self.in_flight.remove(&claim);
        outcome
    }

    fn settle_claimed(
        &self,
        split: &FeeSplit,
        currency: &str,
        payer: OwnerId,
        fee_type: &str,
        reference_id: &ReferenceId,
    ) -> Result<CommissionRecord> {
        if let Some(existing) = self
            .log
            .records_for(reference_id)
            .into_iter()
            .find(|r| r.fee_type == fee_type && r.payer == payer)
        {
            return Ok(existing);
        }
        self.book(split, currency, payer, fee_type, reference_id)
    }

    /// Credit the split and write the audit row, without the retry check.
    /// Callers must guarantee the fee is booked once.
    pub(crate) fn book(
        &self,
        split: &FeeSplit,
        currency: &str,
        payer: OwnerId,
        fee_type: &str,
        reference_id: &ReferenceId,
    ) -> Result<CommissionRecord> {
        let mut compensation = Compensation::new(&self.ledger, reference_id.clone());
        let metadata = serde_json::json!({ "fee_type": fee_type, "payer": payer.to_string() });

        if split.admin_amount > Decimal::ZERO {
            match self.ledger.post(
                OwnerId::AdminRevenue,
                currency,
                BalanceMutation::Credit(split.admin_amount),
                constants::OP_FEE_REVENUE,
                reference_id,
                Some(metadata.clone()),
            ) {
                Ok(entry) => compensation.record(&entry),
                Err(err) => return Err(compensation.rollback(err)),
            }
        }

        let referrer = split
            .referrer_id
            .filter(|_| split.commission_amount > Decimal::ZERO);
        if let Some(referrer) = referrer {
            match self.ledger.post(
                OwnerId::User(referrer),
                currency,
                BalanceMutation::Credit(split.commission_amount),
                constants::OP_REFERRAL_COMMISSION,
                reference_id,
                Some(metadata),
            ) {
                Ok(entry) => compensation.record(&entry),
                Err(err) => return Err(compensation.rollback(err)),
            }
        }

        let record = CommissionRecord::from_split(split, currency, payer, fee_type, reference_id);
        if let Err(err) = self.log.record(record.clone()) {
            tracing::error!(
                reference = %reference_id,
                error = %err,
                "Commission audit write failed"
            );
            return Err(compensation.rollback(err));
        }
        compensation.commit();

        tracing::debug!(
            currency,
            fee_type,
            gross_fee = %split.gross_fee,
            admin = %split.admin_amount,
            commission = %split.commission_amount,
            reference = %reference_id,
            "Fee settled"
        );
        Ok(record)
    }

    /// [`compute_split`](Self::compute_split) then [`settle`](Self::settle).
    pub fn compute_and_settle(
        &self,
        gross_fee: Decimal,
        currency: &str,
        payer: OwnerId,
        referrer: Option<ReferrerContext>,
        fee_type: &str,
        reference_id: &ReferenceId,
    ) -> Result<FeeSplit> {
        let split = self.compute_split(gross_fee, referrer)?;
        self.settle(&split, currency, payer, fee_type, reference_id)?;
        Ok(split)
    }

    /// Debit a standalone fee from the payer's available balance and settle it.
    ///
    /// The debit is compensated if settlement fails.
    pub fn charge_fee(
        &self,
        payer: OwnerId,
        currency: &str,
        gross_fee: Decimal,
        referrer: Option<ReferrerContext>,
        fee_type: &str,
        reference_id: &ReferenceId,
    ) -> Result<FeeSplit> {
        let split = self.compute_split(gross_fee, referrer)?;
        let debit = self.ledger.debit(
            payer,
            currency,
            gross_fee,
            constants::OP_FEE_CHARGE,
            reference_id,
            Some(serde_json::json!({ "fee_type": fee_type })),
        )?;
        let mut compensation = Compensation::new(&self.ledger, reference_id.clone());
        compensation.record(&debit);
        match self.settle(&split, currency, payer, fee_type, reference_id) {
            Ok(_) => {
                compensation.commit();
                Ok(split)
            }
            Err(err) => Err(compensation.rollback(err)),
        }
    }
}

impl std::fmt::Debug for FeeDistributionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeeDistributionEngine")
            .field("config", &self.config())
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
        log: Arc<InMemoryCommissionLog>,
        engine: FeeDistributionEngine,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(LedgerService::new(
            Arc::new(InMemoryAccountStore::new()),
            Arc::new(InMemoryJournal::new()),
        ));
        let log = Arc::new(InMemoryCommissionLog::new());
        let engine = FeeDistributionEngine::new(
            ledger.clone(),
            Arc::new(StaticConfig::default()),
            log.clone(),
        );
        Fixture {
            ledger,
            log,
            engine,
        }
    }

    #[test]
    fn standard_split() {
        let f = fixture();
        let referrer = ReferrerContext::new(UserId::new(), ReferralTier::Standard);
        let split = f.engine.compute_split(Decimal::new(3, 0), Some(referrer)).unwrap();
        assert_eq!(split.commission_amount, Decimal::new(6, 1));
        assert_eq!(split.admin_amount, Decimal::new(24, 1));
        assert!(split.is_balanced());
    }

    #[test]
    fn golden_split_truncates() {
        let f = fixture();
        let referrer = ReferrerContext::new(UserId::new(), ReferralTier::Golden);
        // 50% of 0.00000003 = 0.000000015 -> 0.00000001
        let split = f
            .engine
            .compute_split(Decimal::new(3, 8), Some(referrer))
            .unwrap();
        assert_eq!(split.commission_amount, Decimal::new(1, 8));
        assert_eq!(split.admin_amount, Decimal::new(2, 8));
    }

    #[test]
    fn split_is_exact_for_many_fees() {
        use rand::{Rng, SeedableRng, rngs::StdRng};
        let f = fixture();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1_000 {
            let gross = Decimal::new(rng.gen_range(0..10_000_000_000_i64), 8);
            let tier = if rng.gen_bool(0.5) {
                ReferralTier::Golden
            } else {
                ReferralTier::Standard
            };
            let split = f
                .engine
                .compute_split(gross, Some(ReferrerContext::new(UserId::new(), tier)))
                .unwrap();
            assert!(split.is_balanced(), "split of {gross} not exact");
            assert!(split.commission_amount <= split.gross_fee);
        }
    }

    #[test]
    fn negative_fee_rejected() {
        let f = fixture();
        assert!(matches!(
            f.engine.compute_split(Decimal::new(-1, 0), None),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(
            f.engine.compute_fee(Decimal::TEN, Decimal::new(101, 0)),
            Err(LedgerError::InvalidPercent { .. })
        ));
    }

    #[test]
    fn settle_credits_and_logs() {
        let f = fixture();
        let referrer = UserId::new();
        let payer = OwnerId::User(UserId::new());
        let reference = ReferenceId::from("t1");
        let split = f
            .engine
            .compute_and_settle(
                Decimal::new(3, 0),
                "BTC",
                payer,
                Some(ReferrerContext::new(referrer, ReferralTier::Standard)),
                "p2p",
                &reference,
            )
            .unwrap();

        assert_eq!(
            f.ledger.balance(OwnerId::AdminRevenue, "BTC").available,
            split.admin_amount
        );
        assert_eq!(
            f.ledger.balance(OwnerId::User(referrer), "BTC").available,
            Decimal::new(6, 1)
        );
        assert_eq!(f.log.len(), 1);

        // Retry does not pay twice.
        f.engine
            .settle(&split, "BTC", payer, "p2p", &reference)
            .unwrap();
        assert_eq!(f.log.len(), 1);
        assert_eq!(
            f.ledger.balance(OwnerId::AdminRevenue, "BTC").available,
            Decimal::new(24, 1)
        );
    }

    #[test]
    fn zero_fee_still_audited() {
        let f = fixture();
        let split = f
            .engine
            .compute_and_settle(
                Decimal::ZERO,
                "BTC",
                OwnerId::User(UserId::new()),
                None,
                "dispute",
                &ReferenceId::from("d1"),
            )
            .unwrap();
        assert_eq!(split.total(), Decimal::ZERO);
        assert_eq!(f.log.len(), 1);
        assert!(f.ledger.journal().is_empty());
    }

    #[test]
    fn charge_fee_debits_payer() {
        let f = fixture();
        let payer = OwnerId::User(UserId::new());
        f.ledger
            .credit(payer, "USDT", Decimal::new(10, 0), "deposit", &ReferenceId::from("d"), None)
            .unwrap();
        f.engine
            .charge_fee(payer, "USDT", Decimal::new(2, 0), None, "listing", &ReferenceId::from("l1"))
            .unwrap();
        assert_eq!(f.ledger.balance(payer, "USDT").available, Decimal::new(8, 0));
        assert_eq!(
            f.ledger.balance(OwnerId::AdminRevenue, "USDT").available,
            Decimal::new(2, 0)
        );

        let err = f
            .engine
            .charge_fee(payer, "USDT", Decimal::new(9, 0), None, "listing", &ReferenceId::from("l2"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientAvailableBalance { .. }));
    }
}
