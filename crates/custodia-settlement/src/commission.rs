//! Referral commission audit log.
//!
//! One [`CommissionRecord`] is written for every settled fee, including
//! fees with no referrer or a zero commission. Records where a commission
//! was actually paid are also published as `ReferralCommissionLogged`
//! events.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use custodia_types::{
    Currency, FeeSplit, LedgerError, OwnerId, ReferenceId, ReferralTier, Result, UserId,
    constants,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Audit row for one fee settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionRecord {
    pub reference_id: ReferenceId,
    pub fee_type: String,
    pub currency: Currency,
    pub payer: OwnerId,
    pub gross_fee: Decimal,
    pub admin_amount: Decimal,
    pub referrer_id: Option<UserId>,
    pub referrer_tier: Option<ReferralTier>,
    pub commission_percent: Decimal,
    pub commission_amount: Decimal,
    pub logged_at: DateTime<Utc>,
}

impl CommissionRecord {
    #[must_use]
    pub fn from_split(
        split: &FeeSplit,
        currency: &str,
        payer: OwnerId,
        fee_type: &str,
        reference_id: &ReferenceId,
    ) -> Self {
        Self {
            reference_id: reference_id.clone(),
            fee_type: fee_type.to_string(),
            currency: currency.to_string(),
            payer,
            gross_fee: split.gross_fee,
            admin_amount: split.admin_amount,
            referrer_id: split.referrer_id,
            referrer_tier: split.referrer_tier,
            commission_percent: split.commission_percent,
            commission_amount: split.commission_amount,
            logged_at: Utc::now(),
        }
    }

    /// Whether a referrer was credited.
    #[must_use]
    pub fn paid_commission(&self) -> bool {
        self.referrer_id.is_some() && self.commission_amount > Decimal::ZERO
    }
}

/// Per-referrer totals for dashboards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReferralStats {
    pub referrer_id: Option<UserId>,
    /// Number of fees that paid this referrer.
    pub commissions: usize,
    pub total_by_currency: BTreeMap<Currency, Decimal>,
}

/// Storage for commission audit rows.
pub trait CommissionLog: Send + Sync {
    /// Persist one row.
    fn record(&self, record: CommissionRecord) -> Result<()>;

    /// Rows written for `reference`.
    fn records_for(&self, reference: &ReferenceId) -> Vec<CommissionRecord>;

    /// Aggregate paid commissions of one referrer.
    fn stats_for(&self, referrer: UserId) -> ReferralStats;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory commission log with an event stream.
#[derive(Debug)]
pub struct InMemoryCommissionLog {
    records: RwLock<Vec<CommissionRecord>>,
    events: broadcast::Sender<CommissionRecord>,
}

impl InMemoryCommissionLog {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(constants::EVENT_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(Vec::new()),
            events,
        }
    }

    /// `ReferralCommissionLogged` events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CommissionRecord> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<CommissionRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for InMemoryCommissionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CommissionLog for InMemoryCommissionLog {
    fn record(&self, record: CommissionRecord) -> Result<()> {
        let paid = record.paid_commission();
        self.records
            .write()
            .map_err(|_| LedgerError::AuditWriteFailed("commission log lock poisoned".into()))?
            .push(record.clone());
        if paid {
            tracing::info!(
                referrer = ?record.referrer_id,
                tier = ?record.referrer_tier,
                amount = %record.commission_amount,
                currency = %record.currency,
                reference = %record.reference_id,
                "ReferralCommissionLogged"
            );
            let _ = self.events.send(record);
        }
        Ok(())
    }

    fn records_for(&self, reference: &ReferenceId) -> Vec<CommissionRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| &r.reference_id == reference)
            .cloned()
            .collect()
    }

    fn stats_for(&self, referrer: UserId) -> ReferralStats {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = ReferralStats {
            referrer_id: Some(referrer),
            ..ReferralStats::default()
        };
        for r in records
            .iter()
            .filter(|r| r.referrer_id == Some(referrer) && r.paid_commission())
        {
            stats.commissions += 1;
            *stats
                .total_by_currency
                .entry(r.currency.clone())
                .or_insert(Decimal::ZERO) += r.commission_amount;
        }
        stats
    }

    fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
