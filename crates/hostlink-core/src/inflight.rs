//! Operations that must reach the service even across reconnects.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{ids::TransactionId, schema::LoadingState};

/// An operation awaiting (re)delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InFlightOperation {
    /// A render instruction the service must see and act on.
    Submission {
        transaction_id: TransactionId,
        input_group_key: String,
        io_call: String,
    },
    /// The newest loading state of a unit.
    StatusReport {
        transaction_id: TransactionId,
        state: LoadingState,
    },
}

impl InFlightOperation {
    #[must_use]
    pub const fn transaction_id(&self) -> &TransactionId {
        match self {
            Self::Submission { transaction_id, .. } | Self::StatusReport { transaction_id, .. } => {
                transaction_id
            }
        }
    }

    #[must_use]
    pub const fn is_submission(&self) -> bool {
        matches!(self, Self::Submission { .. })
    }
}

#[derive(Default)]
struct Inner {
    /// Keyed by unit, then by input group so several forms may coexist.
    submissions: HashMap<TransactionId, BTreeMap<String, String>>,
    statuses: HashMap<TransactionId, LoadingState>,
}

/// Concurrent set of in-flight submissions and status reports.
///
/// Submissions are keyed by `(unit, input group)`; status reports hold one
/// slot per unit and the latest write wins.
#[derive(Default)]
pub struct InFlightOperations {
    inner: Mutex<Inner>,
}

impl InFlightOperations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record (or replace) the pending render for an input group.
    pub fn record_submission(
        &self,
        transaction_id: &TransactionId,
        input_group_key: impl Into<String>,
        io_call: impl Into<String>,
    ) {
        self.lock()
            .submissions
            .entry(transaction_id.clone())
            .or_default()
            .insert(input_group_key.into(), io_call.into());
    }

    /// Drop the pending render for an input group once it has been answered.
    pub fn retire_submission(&self, transaction_id: &TransactionId, input_group_key: &str) -> bool {
        let mut inner = self.lock();
        let Some(groups) = inner.submissions.get_mut(transaction_id) else {
            return false;
        };
        let removed = groups.remove(input_group_key).is_some();
        if groups.is_empty() {
            inner.submissions.remove(transaction_id);
        }
        removed
    }

    /// Record the newest loading state, superseding any earlier one.
    pub fn record_status(&self, transaction_id: &TransactionId, state: LoadingState) {
        self.lock().statuses.insert(transaction_id.clone(), state);
    }

    pub fn clear_status(&self, transaction_id: &TransactionId) -> bool {
        self.lock().statuses.remove(transaction_id).is_some()
    }

    /// Remove every operation of a unit. Returns how many were dropped.
    pub fn remove_transaction(&self, transaction_id: &TransactionId) -> usize {
        let mut inner = self.lock();
        let submissions = inner
            .submissions
            .remove(transaction_id)
            .map_or(0, |groups| groups.len());
        let status = usize::from(inner.statuses.remove(transaction_id).is_some());
        submissions + status
    }

    /// Remove `op` only if it is still the stored value for its slot.
    ///
    /// A newer render or status written while `op` was being resent is kept.
    pub fn remove_if_current(&self, op: &InFlightOperation) -> bool {
        let mut inner = self.lock();
        match op {
            InFlightOperation::Submission {
                transaction_id,
                input_group_key,
                io_call,
            } => {
                let Some(groups) = inner.submissions.get_mut(transaction_id) else {
                    return false;
                };
                if groups.get(input_group_key) != Some(io_call) {
                    return false;
                }
                groups.remove(input_group_key);
                if groups.is_empty() {
                    inner.submissions.remove(transaction_id);
                }
                true
            }
            InFlightOperation::StatusReport {
                transaction_id,
                state,
            } => {
                if inner.statuses.get(transaction_id) != Some(state) {
                    return false;
                }
                inner.statuses.remove(transaction_id);
                true
            }
        }
    }

    /// Whether `op` (with this exact value) is still pending.
    #[must_use]
    pub fn contains(&self, op: &InFlightOperation) -> bool {
        let inner = self.lock();
        match op {
            InFlightOperation::Submission {
                transaction_id,
                input_group_key,
                io_call,
            } => inner
                .submissions
                .get(transaction_id)
                .and_then(|groups| groups.get(input_group_key))
                == Some(io_call),
            InFlightOperation::StatusReport {
                transaction_id,
                state,
            } => inner.statuses.get(transaction_id) == Some(state),
        }
    }

    /// Copy of every pending operation, submissions first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<InFlightOperation> {
        let inner = self.lock();
        let submissions = inner.submissions.iter().flat_map(|(transaction_id, groups)| {
            groups
                .iter()
                .map(|(input_group_key, io_call)| InFlightOperation::Submission {
                    transaction_id: transaction_id.clone(),
                    input_group_key: input_group_key.clone(),
                    io_call: io_call.clone(),
                })
        });
        let statuses = inner
            .statuses
            .iter()
            .map(|(transaction_id, state)| InFlightOperation::StatusReport {
                transaction_id: transaction_id.clone(),
                state: state.clone(),
            });
        submissions.chain(statuses).collect()
    }

    /// Pending operations of one unit.
    #[must_use]
    pub fn for_transaction(&self, transaction_id: &TransactionId) -> Vec<InFlightOperation> {
        self.snapshot()
            .into_iter()
            .filter(|op| op.transaction_id() == transaction_id)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.submissions.values().map(BTreeMap::len).sum::<usize>() + inner.statuses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
