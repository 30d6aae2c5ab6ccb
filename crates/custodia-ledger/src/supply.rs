//! Supply conservation and solvency checks.
//!
//! Invariants checked per currency:
//! ```text
//! holdings = injected + deposited - withdrawn - reclaimed
//! Σ(all account totals)        == holdings   (conservation)
//! Σ(non-pool account totals)   <= holdings   (solvency)
//! ```
//!
//! Withdrawals are paid from the pool. The withdrawing user's settled claim
//! leaves the ledger at the same time and is counted as `reclaimed`: the
//! custodied coins behind it become off-ledger platform reserves until an
//! admin injects them back into the pool.
//!
//! The platform is custodial and cannot mint: if either check fails,
//! something has moved money outside the ledger primitives.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use custodia_types::{Currency, LedgerError, Result};
use rust_decimal::Decimal;

use crate::store::AccountStore;

#[derive(Debug, Default)]
struct Flows {
    injected: HashMap<Currency, Decimal>,
    deposited: HashMap<Currency, Decimal>,
    withdrawn: HashMap<Currency, Decimal>,
    reclaimed: HashMap<Currency, Decimal>,
}

fn bump(map: &mut HashMap<Currency, Decimal>, currency: &str, amount: Decimal) {
    *map.entry(currency.to_string()).or_insert(Decimal::ZERO) += amount;
}

fn read(map: &HashMap<Currency, Decimal>, currency: &str) -> Decimal {
    map.get(currency).copied().unwrap_or(Decimal::ZERO)
}

/// Per-currency record of value entering and leaving the platform.
#[derive(Debug, Default)]
pub struct SupplyTracker {
    flows: Mutex<Flows>,
}

/// Totals reported by [`SupplyTracker::report`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplyReport {
    pub currency: Currency,
    pub holdings: Decimal,
    pub ledger_total: Decimal,
    pub liabilities: Decimal,
    pub pool_total: Decimal,
}

impl SupplyTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform reserves added to the liquidity pool.
    pub fn record_injection(&self, currency: &str, amount: Decimal) {
        let mut flows = self.flows.lock().unwrap_or_else(PoisonError::into_inner);
        bump(&mut flows.injected, currency, amount);
    }

    /// External (on-chain) deposit credited to a user.
    pub fn record_deposit(&self, currency: &str, amount: Decimal) {
        let mut flows = self.flows.lock().unwrap_or_else(PoisonError::into_inner);
        bump(&mut flows.deposited, currency, amount);
    }

    /// Value paid out of the platform (withdrawal sent on-chain).
    pub fn record_withdrawal(&self, currency: &str, amount: Decimal) {
        let mut flows = self.flows.lock().unwrap_or_else(PoisonError::into_inner);
        bump(&mut flows.withdrawn, currency, amount);
    }

    /// User claim settled by a pool-funded withdrawal.
    pub fn record_reclaim(&self, currency: &str, amount: Decimal) {
        let mut flows = self.flows.lock().unwrap_or_else(PoisonError::into_inner);
        bump(&mut flows.reclaimed, currency, amount);
    }

    /// `injected + deposited - withdrawn - reclaimed`.
    #[must_use]
    pub fn holdings(&self, currency: &str) -> Decimal {
        let flows = self.flows.lock().unwrap_or_else(PoisonError::into_inner);
        read(&flows.injected, currency) + read(&flows.deposited, currency)
            - read(&flows.withdrawn, currency)
            - read(&flows.reclaimed, currency)
    }

    #[must_use]
    pub fn total_withdrawn(&self, currency: &str) -> Decimal {
        let flows = self.flows.lock().unwrap_or_else(PoisonError::into_inner);
        read(&flows.withdrawn, currency)
    }

    #[must_use]
    pub fn total_reclaimed(&self, currency: &str) -> Decimal {
        let flows = self.flows.lock().unwrap_or_else(PoisonError::into_inner);
        read(&flows.reclaimed, currency)
    }

    #[must_use]
    pub fn total_injected(&self, currency: &str) -> Decimal {
        let flows = self.flows.lock().unwrap_or_else(PoisonError::into_inner);
        read(&flows.injected, currency)
    }

    /// Every currency with recorded flows.
    #[must_use]
    pub fn tracked_currencies(&self) -> Vec<Currency> {
        let flows = self.flows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: HashSet<Currency> = flows.injected.keys().cloned().collect();
        all.extend(flows.deposited.keys().cloned());
        all.extend(flows.withdrawn.keys().cloned());
        all.extend(flows.reclaimed.keys().cloned());
        let mut out: Vec<_> = all.into_iter().collect();
        out.sort();
        out
    }

    /// Sum the store for `currency` against recorded flows.
    #[must_use]
    pub fn report(&self, currency: &str, store: &dyn AccountStore) -> SupplyReport {
        let mut ledger_total = Decimal::ZERO;
        let mut pool_total = Decimal::ZERO;
        for (owner, account) in store.accounts(currency) {
            ledger_total += account.total();
            if owner.is_pool() {
                pool_total += account.total();
            }
        }
        SupplyReport {
            currency: currency.to_string(),
            holdings: self.holdings(currency),
            ledger_total,
            liabilities: ledger_total - pool_total,
            pool_total,
        }
    }

    /// Check conservation and solvency for `currency`.
    ///
    /// # Errors
    /// Returns [`LedgerError::SolvencyViolation`] describing the broken invariant.
    pub fn verify(&self, currency: &str, store: &dyn AccountStore) -> Result<SupplyReport> {
        let report = self.report(currency, store);
        if report.ledger_total != report.holdings {
            return Err(LedgerError::SolvencyViolation {
                reason: format!(
                    "{currency}: ledger total {} != holdings {}",
                    report.ledger_total, report.holdings
                ),
            });
        }
        if report.liabilities > report.holdings {
            return Err(LedgerError::SolvencyViolation {
                reason: format!(
                    "{currency}: liabilities {} exceed holdings {}",
                    report.liabilities, report.holdings
                ),
            });
        }
        Ok(report)
    }
}
