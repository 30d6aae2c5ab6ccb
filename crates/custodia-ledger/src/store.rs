//! Account storage with single-step conditional updates.
//!
//! [`AccountStore::apply`] is the only way to change a balance. The check
//! ("is `available >= amount`?") and the write happen under one lock on
//! the account row, so two concurrent debits can never both pass a stale
//! read.

use dashmap::DashMap;
use rust_decimal::Decimal;

use custodia_types::{Account, AccountKey, EntryKind, LedgerError, OwnerId, Result};

/// One atomic change to an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceMutation {
    /// `available += x`
    Credit(Decimal),
    /// `available -= x` if `available >= x`
    Debit(Decimal),
    /// `available -= x; locked += x` if `available >= x`
    Lock(Decimal),
    /// `locked -= x; available += x` if `locked >= x`
    Unlock(Decimal),
    /// `locked -= x` if `locked >= x`
    Release(Decimal),
    /// `locked += x` (compensation of a release)
    Relock(Decimal),
}

impl BalanceMutation {
    /// Rebuild the mutation a journal entry recorded.
    #[must_use]
    pub fn from_kind(kind: EntryKind, amount: Decimal) -> Self {
        match kind {
            EntryKind::Credit => Self::Credit(amount),
            EntryKind::Debit => Self::Debit(amount),
            EntryKind::Lock => Self::Lock(amount),
            EntryKind::Unlock => Self::Unlock(amount),
            EntryKind::Release => Self::Release(amount),
            EntryKind::Relock => Self::Relock(amount),
        }
    }

    #[must_use]
    pub fn amount(&self) -> Decimal {
        match *self {
            Self::Credit(x)
            | Self::Debit(x)
            | Self::Lock(x)
            | Self::Unlock(x)
            | Self::Release(x)
            | Self::Relock(x) => x,
        }
    }

    #[must_use]
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Credit(_) => EntryKind::Credit,
            Self::Debit(_) => EntryKind::Debit,
            Self::Lock(_) => EntryKind::Lock,
            Self::Unlock(_) => EntryKind::Unlock,
            Self::Release(_) => EntryKind::Release,
            Self::Relock(_) => EntryKind::Relock,
        }
    }

    /// The mutation that undoes this one.
    #[must_use]
    pub fn inverse(&self) -> Self {
        match *self {
            Self::Credit(x) => Self::Debit(x),
            Self::Debit(x) => Self::Credit(x),
            Self::Lock(x) => Self::Unlock(x),
            Self::Unlock(x) => Self::Lock(x),
            Self::Release(x) => Self::Relock(x),
            Self::Relock(x) => Self::Release(x),
        }
    }

    /// Signed amount as recorded in the journal.
    #[must_use]
    pub fn signed_amount(&self) -> Decimal {
        match *self {
            Self::Credit(x) | Self::Unlock(x) | Self::Relock(x) => x,
            Self::Debit(x) | Self::Lock(x) | Self::Release(x) => -x,
        }
    }

    /// Apply to `account` in place, or leave it untouched and fail.
    ///
    /// # Errors
    /// - `InsufficientAvailableBalance` for debit/lock beyond `available`
    /// - `InsufficientLockedBalance` for unlock/release beyond `locked`
    /// - `InvalidAmount` if a credit would overflow the balance
    pub fn apply_to(&self, owner: OwnerId, currency: &str, account: &mut Account) -> Result<()> {
        let x = self.amount();
        let add = |balance: Decimal| {
            balance
                .checked_add(x)
                .ok_or(LedgerError::InvalidAmount { amount: x })
        };
        let (available, locked) = match self {
            Self::Credit(_) => (add(account.available)?, account.locked),
            Self::Relock(_) => (account.available, add(account.locked)?),
            Self::Debit(_) | Self::Lock(_) => {
                if account.available < x {
                    return Err(LedgerError::InsufficientAvailableBalance {
                        owner,
                        currency: currency.to_string(),
                        needed: x,
                        available: account.available,
                    });
                }
                let locked = if matches!(self, Self::Lock(_)) {
                    add(account.locked)?
                } else {
                    account.locked
                };
                (account.available - x, locked)
            }
            Self::Unlock(_) | Self::Release(_) => {
                if account.locked < x {
                    return Err(LedgerError::InsufficientLockedBalance {
                        owner,
                        currency: currency.to_string(),
                        needed: x,
                        locked: account.locked,
                    });
                }
                let available = if matches!(self, Self::Unlock(_)) {
                    add(account.available)?
                } else {
                    account.available
                };
                (available, account.locked - x)
            }
        };
        account.available = available;
        account.locked = locked;
        Ok(())
    }
}

/// Authoritative balance storage.
///
/// Implementations must make [`apply`](AccountStore::apply) a single atomic
/// conditional update per account. Nothing else may write a balance.
pub trait AccountStore: Send + Sync {
    /// Current balance; zero if the account was never referenced.
    fn get(&self, owner: OwnerId, currency: &str) -> Account;

    /// Atomically apply `mutation`, returning the resulting balance.
    /// Accounts are created lazily with zero balances.
    fn apply(&self, owner: OwnerId, currency: &str, mutation: BalanceMutation) -> Result<Account>;

    /// Every account holding `currency`.
    fn accounts(&self, currency: &str) -> Vec<(OwnerId, Account)>;
}

/// Sharded in-memory store. Each row is guarded by its shard lock for the
/// duration of one `apply`.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: DashMap<AccountKey, Account>,
}

impl InMemoryAccountStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of account rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl AccountStore for InMemoryAccountStore {
    fn get(&self, owner: OwnerId, currency: &str) -> Account {
        self.accounts
            .get(&(owner, currency.to_string()))
            .map(|row| *row)
            .unwrap_or_default()
    }

    fn apply(&self, owner: OwnerId, currency: &str, mutation: BalanceMutation) -> Result<Account> {
        let mut row = self
            .accounts
            .entry((owner, currency.to_string()))
            .or_default();
        let mut next = *row;
        mutation.apply_to(owner, currency, &mut next)?;
        *row = next;
        Ok(next)
    }

    fn accounts(&self, currency: &str) -> Vec<(OwnerId, Account)> {
        self.accounts
            .iter()
            .filter(|row| row.key().1 == currency)
            .map(|row| (row.key().0, *row.value()))
            .collect()
    }
}
