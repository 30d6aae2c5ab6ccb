//! Undo stack for multi-step ledger operations.
//!
//! Each completed step is recorded as it happens. On failure,
//! [`Compensation::rollback`] posts the inverse of every step in reverse
//! order under operation type `rollback`, and drops the idempotency record
//! of each undone step so a retry of the whole operation runs again.

use custodia_types::{LedgerEntry, LedgerError, ReferenceId, constants};
use serde_json::json;

use crate::service::LedgerService;
use crate::store::BalanceMutation;

/// Metadata field of a rollback entry naming the entry it undid.
pub(crate) const UNDOES: &str = "undoes";

/// Steps applied so far by one business operation.
pub struct Compensation<'a> {
    ledger: &'a LedgerService,
    reference_id: ReferenceId,
    steps: Vec<LedgerEntry>,
}

impl<'a> Compensation<'a> {
    #[must_use]
    pub fn new(ledger: &'a LedgerService, reference_id: ReferenceId) -> Self {
        Self {
            ledger,
            reference_id,
            steps: Vec::new(),
        }
    }

    /// Remember a step that has been applied and journaled.
    pub fn record(&mut self, entry: &LedgerEntry) {
        self.steps.push(entry.clone());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The operation completed; nothing to undo.
    pub fn commit(self) {}

    /// Undo every recorded step, newest first.
    ///
    /// Returns `cause` if every inverse applied. Otherwise returns a
    /// `RollbackFailure` for the first step that could not be undone; the
    /// remaining steps are still attempted.
    #[must_use]
    pub fn rollback(self, cause: LedgerError) -> LedgerError {
        tracing::warn!(
            reference = %self.reference_id,
            steps = self.steps.len(),
            error = %cause,
            "Rolling back partially applied operation"
        );

        let mut failure: Option<LedgerError> = None;
        for step in self.steps.iter().rev() {
            let inverse = BalanceMutation::from_kind(step.kind, step.magnitude()).inverse();
            let metadata = json!({
                UNDOES: step.entry_id.to_string(),
                "cause": cause.to_string(),
            });
            match self.ledger.post(
                step.owner_id,
                &step.currency,
                inverse,
                constants::OP_ROLLBACK,
                &self.reference_id,
                Some(metadata),
            ) {
                Ok(_) => self.ledger.forget(step),
                Err(err) => {
                    tracing::error!(
                        owner = %step.owner_id,
                        currency = %step.currency,
                        amount = %step.magnitude(),
                        reference = %self.reference_id,
                        error = %err,
                        "Rollback step failed, manual reconciliation required"
                    );
                    if failure.is_none() {
                        failure = Some(LedgerError::RollbackFailure {
                            owner: step.owner_id,
                            currency: step.currency.clone(),
                            amount: step.magnitude(),
                            reference_id: self.reference_id.clone(),
                            reason: format!("{err} (original error: {cause})"),
                        });
                    }
                }
            }
        }
        failure.unwrap_or(cause)
    }
}
