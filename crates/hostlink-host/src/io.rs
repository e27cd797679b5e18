//! IO client handed to action handlers.

use std::sync::Arc;

use hostlink_core::{
    InFlightOperation, InFlightOperations, IoRenderInstruction, IoResponseMessage, RpcError,
    TransactionId, schema::IoResponseKind,
};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

use crate::outbound::{Delivery, Outbound};

/// Renders component groups for one unit of work and waits for answers.
///
/// Each render is kept in flight until its `RETURN` arrives, so a form
/// shown before a reconnect is shown again after it.
pub struct IoClient {
    transaction_id: TransactionId,
    outbound: Outbound,
    inflight: Arc<InFlightOperations>,
    responses: Mutex<mpsc::UnboundedReceiver<IoResponseMessage>>,
    state_observer: Option<mpsc::UnboundedSender<IoResponseMessage>>,
}

impl IoClient {
    pub(crate) fn new(
        transaction_id: TransactionId,
        outbound: Outbound,
        inflight: Arc<InFlightOperations>,
        responses: mpsc::UnboundedReceiver<IoResponseMessage>,
    ) -> Self {
        Self {
            transaction_id,
            outbound,
            inflight,
            responses: Mutex::new(responses),
            state_observer: None,
        }
    }

    /// Forward `SET_STATE` responses to `observer`.
    #[must_use]
    pub fn with_state_observer(mut self, observer: mpsc::UnboundedSender<IoResponseMessage>) -> Self {
        self.state_observer = Some(observer);
        self
    }

    #[must_use]
    pub const fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    /// Render a new group of components and return the submitted values.
    ///
    /// # Errors
    /// Returns `RpcError::Canceled` if the person viewing the form canceled,
    /// `RpcError::TransactionClosed` if the unit is no longer open.
    pub async fn render(&self, components: Vec<Value>) -> Result<Vec<Value>, RpcError> {
        self.render_instruction(IoRenderInstruction::new(components))
            .await
    }

    /// Render a prepared instruction; re-rendering a group reuses its key.
    ///
    /// # Errors
    /// See [`IoClient::render`].
    pub async fn render_instruction(
        &self,
        instruction: IoRenderInstruction,
    ) -> Result<Vec<Value>, RpcError> {
        let io_call = serde_json::to_string(&instruction)?;
        let group = instruction.input_group_key;
        let op = InFlightOperation::Submission {
            transaction_id: self.transaction_id.clone(),
            input_group_key: group.clone(),
            io_call: io_call.clone(),
        };
        self.inflight
            .record_submission(&self.transaction_id, group.as_str(), io_call);

        let delivery = self.outbound.deliver(&op).await;
        self.inflight.clear_status(&self.transaction_id);
        match delivery? {
            Delivery::Acked(true) | Delivery::Deferred => {}
            Delivery::Acked(false) => {
                self.inflight.remove_if_current(&op);
                return Err(RpcError::TransactionClosed);
            }
        }

        self.await_return(&group).await
    }

    async fn await_return(&self, group: &str) -> Result<Vec<Value>, RpcError> {
        let mut responses = self.responses.lock().await;
        loop {
            let Some(response) = responses.recv().await else {
                return Err(RpcError::TransactionClosed);
            };
            if response
                .input_group_key
                .as_deref()
                .is_some_and(|key| key != group)
            {
                tracing::debug!(
                    transaction_id = %self.transaction_id,
                    "ignoring response for stale input group"
                );
                continue;
            }

            match response.kind {
                IoResponseKind::Return => {
                    self.inflight
                        .retire_submission(&self.transaction_id, group);
                    return Ok(response.values);
                }
                IoResponseKind::SetState => {
                    if let Some(observer) = &self.state_observer {
                        let _ = observer.send(response);
                    }
                }
                IoResponseKind::Canceled => {
                    self.inflight
                        .retire_submission(&self.transaction_id, group);
                    return Err(RpcError::Canceled);
                }
            }
        }
    }
}
