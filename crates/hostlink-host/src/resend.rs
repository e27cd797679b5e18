//! Replay of in-flight operations after a reconnect.

use std::sync::Arc;

use futures::future::join_all;
use hostlink_core::{
    InFlightOperation, RpcError, TransactionRegistry,
    ids::next_correlation_id,
    schema::{IoResponseKind, IoResponseMessage},
};
use tokio_util::sync::CancellationToken;

use crate::outbound::Outbound;

/// Counts from one resend pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResendReport {
    pub rounds: usize,
    pub delivered: usize,
    pub dropped: usize,
}

/// Re-issues every submission and status report still in flight.
pub struct ResendCoordinator {
    outbound: Outbound,
    registry: Arc<TransactionRegistry>,
}

impl ResendCoordinator {
    #[must_use]
    pub const fn new(outbound: Outbound, registry: Arc<TransactionRegistry>) -> Self {
        Self { outbound, registry }
    }

    /// Resend the current snapshot until every item has settled.
    ///
    /// Items in a round go out concurrently. Transport failures and timeouts
    /// keep an item for the next round, one retry interval later. A negative
    /// acknowledgment drops it. A canceled or closed unit loses all of its
    /// in-flight operations.
    pub async fn run(&self, cancel: &CancellationToken) -> ResendReport {
        let inflight = self.registry.inflight();
        let mut report = ResendReport::default();
        let mut batch = inflight.snapshot();
        if batch.is_empty() {
            return report;
        }
        tracing::info!(count = batch.len(), "resending in-flight operations");

        while !batch.is_empty() {
            report.rounds += 1;
            let outcomes = join_all(batch.iter().map(|op| self.outbound.call_once(op))).await;

            let mut retry = Vec::new();
            for (op, outcome) in batch.into_iter().zip(outcomes) {
                let transaction_id = op.transaction_id().clone();
                match outcome {
                    Ok(true) => report.delivered += 1,
                    Ok(false) => {
                        tracing::debug!(%transaction_id, "service rejected resent operation, dropping");
                        inflight.remove_if_current(&op);
                        report.dropped += 1;
                    }
                    Err(e) if e.is_terminal() => {
                        tracing::debug!(%transaction_id, "aborting resend: {e}");
                        report.dropped += inflight.remove_transaction(&transaction_id);
                        if e == RpcError::Canceled {
                            self.notify_canceled(&op);
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::debug!(%transaction_id, "failed resending operation: {e}");
                        retry.push(op);
                    }
                    Err(e) => {
                        tracing::warn!(%transaction_id, "dropping operation after error: {e}");
                        inflight.remove_if_current(&op);
                        report.dropped += 1;
                    }
                }
            }

            // Superseded or finished items are not worth another round.
            retry.retain(|op| inflight.contains(op));
            if retry.is_empty() {
                break;
            }
            tracing::debug!(
                remaining = retry.len(),
                "trying again in {}s",
                self.outbound.retry_interval().as_secs()
            );
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("resend pass canceled");
                    return report;
                }
                alive = self.outbound.pause() => {
                    if !alive {
                        return report;
                    }
                }
            }
            batch = retry;
        }

        report
    }

    /// Surface the cancellation to a unit blocked on the rejected render.
    fn notify_canceled(&self, op: &InFlightOperation) {
        let InFlightOperation::Submission {
            transaction_id,
            input_group_key,
            ..
        } = op
        else {
            return;
        };
        self.registry.route_response(IoResponseMessage {
            id: next_correlation_id(),
            transaction_id: transaction_id.clone(),
            input_group_key: Some(input_group_key.clone()),
            kind: IoResponseKind::Canceled,
            values: Vec::new(),
        });
    }
}
