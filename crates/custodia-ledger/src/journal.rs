//! Append-only transaction journal.
//!
//! The journal is the audit trail: one [`LedgerEntry`] per balance
//! mutation, never rewritten. Derived views (dashboards, reconciliation)
//! are rebuilt from it with [`rebuild_balances`] instead of being kept in
//! sync by hand.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use custodia_types::{
    Account, AccountKey, LedgerEntry, LedgerError, OwnerId, ReferenceId, Result, constants,
};
use tokio::sync::broadcast;

/// Storage for journal entries.
pub trait LedgerJournal: Send + Sync {
    /// Persist one entry. A failure here aborts the operation that produced it.
    fn append(&self, entry: LedgerEntry) -> Result<()>;

    /// Entries written under `reference`, in append order.
    fn entries_for_reference(&self, reference: &ReferenceId) -> Vec<LedgerEntry>;

    /// Entries touching one account, in append order.
    fn entries_for_account(&self, owner: OwnerId, currency: &str) -> Vec<LedgerEntry>;

    /// Every entry, in append order.
    fn snapshot(&self) -> Vec<LedgerEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Entries {
    log: Vec<LedgerEntry>,
    /// Positions in `log` per reference, for retry lookups.
    by_reference: HashMap<ReferenceId, Vec<usize>>,
}

/// In-memory journal that also fans entries out to subscribers.
#[derive(Debug)]
pub struct InMemoryJournal {
    entries: RwLock<Entries>,
    events: broadcast::Sender<LedgerEntry>,
}

impl InMemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(constants::EVENT_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(Entries::default()),
            events,
        }
    }

    /// Live stream of entries appended after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEntry> {
        self.events.subscribe()
    }

    fn filtered(&self, pred: impl Fn(&LedgerEntry) -> bool) -> Vec<LedgerEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .log
            .iter()
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerJournal for InMemoryJournal {
    fn append(&self, entry: LedgerEntry) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| LedgerError::AuditWriteFailed("journal lock poisoned".into()))?;
        let position = entries.log.len();
        entries
            .by_reference
            .entry(entry.reference_id.clone())
            .or_default()
            .push(position);
        entries.log.push(entry.clone());
        drop(entries);
        // No subscribers is fine.
        let _ = self.events.send(entry);
        Ok(())
    }

    fn entries_for_reference(&self, reference: &ReferenceId) -> Vec<LedgerEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .by_reference
            .get(reference)
            .map(|positions| {
                positions
                    .iter()
                    .filter_map(|&i| entries.log.get(i).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn entries_for_account(&self, owner: OwnerId, currency: &str) -> Vec<LedgerEntry> {
        self.filtered(|e| e.owner_id == owner && e.currency == currency)
    }

    fn snapshot(&self) -> Vec<LedgerEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .log
            .clone()
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .log
            .len()
    }
}

/// Replay history into balances.
#[must_use]
pub fn rebuild_balances(entries: &[LedgerEntry]) -> HashMap<AccountKey, Account> {
    let mut balances: HashMap<AccountKey, Account> = HashMap::new();
    for entry in entries {
        let account = balances
            .entry((entry.owner_id, entry.currency.clone()))
            .or_default();
        entry.kind.replay(account, entry.magnitude());
    }
    balances
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use custodia_types::{EntryId, EntryKind, UserId};
    use rust_decimal::Decimal;

    fn entry(owner: OwnerId, kind: EntryKind, amount: i64, reference: &str) -> LedgerEntry {
        let amount = Decimal::new(amount, 0);
        LedgerEntry {
            entry_id: EntryId::new(),
            owner_id: owner,
            currency: "BTC".into(),
            amount,
            kind,
            operation_type: "test".into(),
            reference_id: ReferenceId::from(reference),
            resulting_available: Decimal::ZERO,
            resulting_locked: Decimal::ZERO,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn append_and_query() {
        let journal = InMemoryJournal::new();
        let alice = OwnerId::User(UserId::new());
        let bob = OwnerId::User(UserId::new());
        journal.append(entry(alice, EntryKind::Credit, 10, "d1")).unwrap();
        journal.append(entry(bob, EntryKind::Credit, 5, "d2")).unwrap();
        journal.append(entry(alice, EntryKind::Lock, -4, "t1")).unwrap();

        assert_eq!(journal.len(), 3);
        assert!(!journal.is_empty());
        assert_eq!(journal.entries_for_account(alice, "BTC").len(), 2);
        assert_eq!(journal.entries_for_account(alice, "USDT").len(), 0);
        assert_eq!(
            journal.entries_for_reference(&ReferenceId::from("t1"))[0].kind,
            EntryKind::Lock
        );
        journal.append(entry(alice, EntryKind::Release, -4, "t1")).unwrap();
        let kinds: Vec<_> = journal
            .entries_for_reference(&ReferenceId::from("t1"))
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EntryKind::Lock, EntryKind::Release]);
        assert!(journal.entries_for_reference(&ReferenceId::from("nope")).is_empty());
    }

    #[test]
    fn subscribers_receive_entries() {
        let journal = InMemoryJournal::new();
        let mut rx = journal.subscribe();
        let owner = OwnerId::AdminRevenue;
        journal.append(entry(owner, EntryKind::Credit, 1, "f1")).unwrap();
        let got = rx.try_recv().unwrap();
        assert_eq!(got.owner_id, owner);
    }

    #[test]
    fn rebuild_from_history() {
        let alice = OwnerId::User(UserId::new());
        let entries = vec![
            entry(alice, EntryKind::Credit, 100, "d1"),
            entry(alice, EntryKind::Lock, -30, "t1"),
            entry(alice, EntryKind::Release, -30, "t1"),
            entry(alice, EntryKind::Debit, -10, "w1"),
        ];
        let balances = rebuild_balances(&entries);
        let account = balances[&(alice, "BTC".to_string())];
        assert_eq!(account.available, Decimal::new(60, 0));
        assert_eq!(account.locked, Decimal::ZERO);
    }
}
