//! Retry guard for credits and debits.
//!
//! A client retry of a mutation with the same key must return the entry
//! written the first time instead of moving money again. Keys move through
//! `claim → complete` (or `claim → abandon` on failure); a second claim
//! while the first is still running fails with `OperationInProgress`.
//!
//! Completed keys live in a bounded cache with oldest-first eviction so
//! memory stays predictable in long-running services. The cache is only a
//! fast path: after eviction the ledger finds the prior entry in the
//! journal (see [`LedgerService::prior_entry`](crate::LedgerService::prior_entry)).

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use custodia_types::{EntryKind, LedgerEntry, LedgerError, OwnerId, ReferenceId, Result};

/// Identity of one logical mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub owner: OwnerId,
    pub currency: String,
    pub kind: EntryKind,
    pub operation_type: String,
    pub reference_id: ReferenceId,
}

impl OperationKey {
    /// The key an entry was written under.
    #[must_use]
    pub fn of(entry: &LedgerEntry) -> Self {
        Self {
            owner: entry.owner_id,
            currency: entry.currency.clone(),
            kind: entry.kind,
            operation_type: entry.operation_type.clone(),
            reference_id: entry.reference_id.clone(),
        }
    }

    /// Whether `entry` was written under this key.
    #[must_use]
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        entry.owner_id == self.owner
            && entry.kind == self.kind
            && entry.currency == self.currency
            && entry.operation_type == self.operation_type
            && entry.reference_id == self.reference_id
    }
}

/// What a caller should do after claiming a key.
#[derive(Debug)]
pub enum Claim {
    /// First time this key is seen: perform the mutation.
    Fresh,
    /// Already done: return this entry.
    Replay(LedgerEntry),
}

#[derive(Debug)]
enum Slot {
    InFlight,
    Done(LedgerEntry),
}

#[derive(Debug)]
struct State {
    slots: HashMap<OperationKey, Slot>,
    /// Completion order for eviction (front = oldest).
    order: VecDeque<OperationKey>,
}

/// Bounded idempotency cache keyed by [`OperationKey`].
#[derive(Debug)]
pub struct IdempotencyRegistry {
    state: Mutex<State>,
    max_size: usize,
}

impl IdempotencyRegistry {
    /// Create a registry remembering at most `max_size` completed keys.
    ///
    /// # Panics
    /// Panics if `max_size` is zero.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "IdempotencyRegistry max_size must be > 0");
        Self {
            state: Mutex::new(State {
                slots: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_size,
        }
    }

    /// Claim `key` for execution.
    ///
    /// # Errors
    /// Returns `OperationInProgress` if another caller holds the key.
    pub fn claim(&self, key: &OperationKey) -> Result<Claim> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.slots.get(key) {
            Some(Slot::Done(entry)) => Ok(Claim::Replay(entry.clone())),
            Some(Slot::InFlight) => Err(LedgerError::OperationInProgress(key.reference_id.clone())),
            None => {
                state.slots.insert(key.clone(), Slot::InFlight);
                Ok(Claim::Fresh)
            }
        }
    }

    /// Record the entry produced for a claimed key.
    pub fn complete(&self, key: &OperationKey, entry: LedgerEntry) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.order.len() >= self.max_size {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.slots.remove(&oldest);
        }
        state.slots.insert(key.clone(), Slot::Done(entry));
        state.order.push_back(key.clone());
    }

    /// Release a claimed key after a failure so a retry can run it again.
    pub fn abandon(&self, key: &OperationKey) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(state.slots.get(key), Some(Slot::InFlight)) {
            state.slots.remove(key);
        }
    }

    /// Drop a completed key whose effect was rolled back.
    pub fn forget(&self, key: &OperationKey) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.slots.remove(key).is_some() {
            state.order.retain(|k| k != key);
        }
    }

    /// Whether `key` has completed.
    #[must_use]
    pub fn is_done(&self, key: &OperationKey) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(state.slots.get(key), Some(Slot::Done(_)))
    }

    /// Number of completed keys tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use custodia_types::EntryId;
    use rust_decimal::Decimal;

    fn key(reference: &str) -> OperationKey {
        OperationKey {
            owner: OwnerId::AdminRevenue,
            currency: "BTC".into(),
            kind: EntryKind::Credit,
            operation_type: "fee_revenue".into(),
            reference_id: ReferenceId::from(reference),
        }
    }

    fn entry_for(k: &OperationKey) -> LedgerEntry {
        LedgerEntry {
            entry_id: EntryId::new(),
            owner_id: k.owner,
            currency: k.currency.clone(),
            amount: Decimal::ONE,
            kind: k.kind,
            operation_type: k.operation_type.clone(),
            reference_id: k.reference_id.clone(),
            resulting_available: Decimal::ONE,
            resulting_locked: Decimal::ZERO,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn key_of_entry_matches_it() {
        let k = key("t1");
        let e = entry_for(&k);
        assert_eq!(OperationKey::of(&e), k);
        assert!(k.matches(&e));
        assert!(!key("t2").matches(&e));
    }

    #[test]
    fn first_claim_is_fresh_then_replays() {
        let reg = IdempotencyRegistry::new(10);
        let k = key("t1");
        assert!(matches!(reg.claim(&k).unwrap(), Claim::Fresh));
        let e = entry_for(&k);
        reg.complete(&k, e.clone());
        match reg.claim(&k).unwrap() {
            Claim::Replay(prior) => assert_eq!(prior, e),
            Claim::Fresh => panic!("expected replay"),
        }
        assert!(reg.is_done(&k));
    }

    #[test]
    fn in_flight_blocks_second_claim() {
        let reg = IdempotencyRegistry::new(10);
        let k = key("t1");
        reg.claim(&k).unwrap();
        let err = reg.claim(&k).unwrap_err();
        assert!(matches!(err, LedgerError::OperationInProgress(_)));
    }

    #[test]
    fn abandon_allows_retry() {
        let reg = IdempotencyRegistry::new(10);
        let k = key("t1");
        reg.claim(&k).unwrap();
        reg.abandon(&k);
        assert!(matches!(reg.claim(&k).unwrap(), Claim::Fresh));
    }

    #[test]
    fn forget_allows_rerun() {
        let reg = IdempotencyRegistry::new(10);
        let k = key("t1");
        reg.claim(&k).unwrap();
        reg.complete(&k, entry_for(&k));
        reg.forget(&k);
        assert!(reg.is_empty());
        assert!(matches!(reg.claim(&k).unwrap(), Claim::Fresh));
    }

    #[test]
    fn evicts_oldest() {
        let reg = IdempotencyRegistry::new(2);
        let keys: Vec<_> = ["a", "b", "c"].into_iter().map(key).collect();
        for k in &keys {
            reg.claim(k).unwrap();
            reg.complete(k, entry_for(k));
        }
        assert_eq!(reg.len(), 2);
        assert!(!reg.is_done(&keys[0]), "oldest key should be evicted");
        assert!(reg.is_done(&keys[1]));
        assert!(reg.is_done(&keys[2]));
    }

    #[test]
    #[should_panic(expected = "max_size must be > 0")]
    fn zero_max_size_panics() {
        let _ = IdempotencyRegistry::new(0);
    }
}
