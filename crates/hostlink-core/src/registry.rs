//! Registry of units of work currently executing on the host.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    error::RpcError,
    ids::TransactionId,
    inflight::InFlightOperations,
    schema::{ActionResult, IoResponseMessage},
};

/// How a unit of work settled.
pub type TransactionOutcome = Result<ActionResult, RpcError>;

/// Resolve/reject pair for a caller blocked until a unit finishes.
pub type CompletionWaiter = oneshot::Sender<TransactionOutcome>;

struct Entry {
    next_log_index: u64,
    waiter: Option<CompletionWaiter>,
    responses: Option<mpsc::UnboundedSender<IoResponseMessage>>,
}

/// Maps unit ids to their log counter, response route and completion waiter.
///
/// Finishing a unit (complete or fail) also drops its in-flight operations.
pub struct TransactionRegistry {
    entries: Mutex<HashMap<TransactionId, Entry>>,
    inflight: Arc<InFlightOperations>,
}

impl TransactionRegistry {
    #[must_use]
    pub fn new(inflight: Arc<InFlightOperations>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            inflight,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TransactionId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// In-flight operations owned by the units in this registry.
    #[must_use]
    pub const fn inflight(&self) -> &Arc<InFlightOperations> {
        &self.inflight
    }

    /// Start tracking a unit with its log counter at zero.
    ///
    /// Returns `false` (and keeps the existing entry) if the unit is
    /// already active.
    pub fn begin(&self, transaction_id: &TransactionId, waiter: Option<CompletionWaiter>) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(transaction_id) {
            tracing::warn!(%transaction_id, "transaction already active, ignoring duplicate begin");
            return false;
        }
        entries.insert(
            transaction_id.clone(),
            Entry {
                next_log_index: 0,
                waiter,
                responses: None,
            },
        );
        true
    }

    #[must_use]
    pub fn is_active(&self, transaction_id: &TransactionId) -> bool {
        self.lock().contains_key(transaction_id)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Return the unit's next log index and advance the counter.
    pub fn next_log_index(&self, transaction_id: &TransactionId) -> Option<u64> {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(transaction_id) else {
            tracing::debug!(%transaction_id, "log index requested for unknown transaction");
            return None;
        };
        let index = entry.next_log_index;
        entry.next_log_index += 1;
        Some(index)
    }

    /// Route parsed IO responses for the unit to `tx`.
    pub fn set_response_route(
        &self,
        transaction_id: &TransactionId,
        tx: mpsc::UnboundedSender<IoResponseMessage>,
    ) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(transaction_id) else {
            tracing::debug!(%transaction_id, "response route set for unknown transaction");
            return false;
        };
        entry.responses = Some(tx);
        true
    }

    /// Deliver an IO response to its unit's IO client.
    pub fn route_response(&self, response: IoResponseMessage) -> bool {
        let entries = self.lock();
        let route = entries
            .get(&response.transaction_id)
            .and_then(|entry| entry.responses.as_ref());
        let Some(route) = route else {
            tracing::debug!(
                transaction_id = %response.transaction_id,
                "missing reply handler for IO response"
            );
            return false;
        };
        route.send(response).is_ok()
    }

    /// Finish the unit successfully, resolving its waiter.
    pub fn complete(&self, transaction_id: &TransactionId, result: ActionResult) -> bool {
        self.finish(transaction_id, Ok(result))
    }

    /// Finish the unit with an error, rejecting its waiter.
    pub fn fail(&self, transaction_id: &TransactionId, error: RpcError) -> bool {
        self.finish(transaction_id, Err(error))
    }

    /// Fail every active unit with `error`.
    ///
    /// Response routes are dropped with the entries, so IO clients blocked
    /// on a response see the channel close.
    pub fn fail_all(&self, error: &RpcError) -> usize {
        let entries: Vec<_> = self.lock().drain().collect();
        let count = entries.len();
        for (transaction_id, entry) in entries {
            self.inflight.remove_transaction(&transaction_id);
            if let Some(waiter) = entry.waiter {
                if waiter.send(Err(error.clone())).is_err() {
                    tracing::debug!(%transaction_id, "completion waiter went away");
                }
            }
        }
        if count > 0 {
            tracing::debug!(count, "failed all active transactions: {error}");
        }
        count
    }

    fn finish(&self, transaction_id: &TransactionId, outcome: TransactionOutcome) -> bool {
        let entry = self.lock().remove(transaction_id);
        let dropped = self.inflight.remove_transaction(transaction_id);
        if dropped > 0 {
            tracing::debug!(%transaction_id, dropped, "dropped in-flight operations");
        }

        let Some(entry) = entry else {
            tracing::debug!(%transaction_id, "finish requested for unknown transaction");
            return false;
        };
        if let Some(waiter) = entry.waiter {
            if waiter.send(outcome).is_err() {
                tracing::debug!(%transaction_id, "completion waiter went away");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::{IoResponseKind, LoadingState};

    fn registry() -> TransactionRegistry {
        TransactionRegistry::new(Arc::new(InFlightOperations::new()))
    }

    #[test]
    fn test_log_indices_start_at_zero_and_increase() {
        let registry = registry();
        let id = TransactionId::from("b");
        assert!(registry.begin(&id, None));
        let indices: Vec<_> = (0..3).filter_map(|_| registry.next_log_index(&id)).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_unknown_transaction_is_a_no_op() {
        let registry = registry();
        let id = TransactionId::from("missing");
        assert_eq!(registry.next_log_index(&id), None);
        assert!(!registry.complete(&id, ActionResult::success(json!(null))));
        assert!(!registry.fail(&id, RpcError::Canceled));
    }

    #[test]
    fn test_duplicate_begin_keeps_counter() {
        let registry = registry();
        let id = TransactionId::from("a");
        registry.begin(&id, None);
        registry.next_log_index(&id);
        assert!(!registry.begin(&id, None));
        assert_eq!(registry.next_log_index(&id), Some(1));
    }

    #[tokio::test]
    async fn test_complete_resolves_waiter_and_clears_inflight() {
        let registry = registry();
        let id = TransactionId::from("a");
        let (tx, rx) = oneshot::channel();
        registry.begin(&id, Some(tx));
        registry.inflight().record_submission(&id, "g", "render");
        registry.inflight().record_status(&id, LoadingState::titled("busy"));

        assert!(registry.complete(&id, ActionResult::success(json!({"ok": true}))));

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome.data, json!({"ok": true}));
        assert!(registry.inflight().is_empty());
        assert!(!registry.is_active(&id));
        assert_eq!(registry.next_log_index(&id), None);
    }

    #[tokio::test]
    async fn test_fail_rejects_waiter() {
        let registry = registry();
        let id = TransactionId::from("c");
        let (tx, rx) = oneshot::channel();
        registry.begin(&id, Some(tx));
        registry.fail(&id, RpcError::Canceled);
        assert_eq!(rx.await.unwrap(), Err(RpcError::Canceled));
    }

    #[tokio::test]
    async fn test_fail_all_rejects_waiters_and_drops_routes() {
        let registry = registry();
        let a = TransactionId::from("a");
        let b = TransactionId::from("b");
        let (tx, rx) = oneshot::channel();
        registry.begin(&a, Some(tx));
        registry.begin(&b, None);
        let (route_tx, mut route_rx) = mpsc::unbounded_channel();
        registry.set_response_route(&b, route_tx);
        registry.inflight().record_submission(&b, "g", "render");

        assert_eq!(registry.fail_all(&RpcError::NotConnected), 2);

        assert_eq!(rx.await.unwrap(), Err(RpcError::NotConnected));
        assert_eq!(route_rx.recv().await, None);
        assert_eq!(registry.active_count(), 0);
        assert!(registry.inflight().is_empty());
    }

    #[tokio::test]
    async fn test_route_response_reaches_registered_route() {
        let registry = registry();
        let id = TransactionId::from("a");
        registry.begin(&id, None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.set_response_route(&id, tx);

        let response = IoResponseMessage {
            id: "r".into(),
            transaction_id: id.clone(),
            input_group_key: None,
            kind: IoResponseKind::Return,
            values: vec![json!("hi")],
        };
        assert!(registry.route_response(response.clone()));
        assert_eq!(rx.recv().await, Some(response));
    }
}
