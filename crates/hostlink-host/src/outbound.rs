//! Host-originated calls with local retry.

use std::{sync::Arc, time::Duration};

use hostlink_core::{
    InFlightOperation, InFlightOperations, MethodName, RpcError, RpcMethod, ServerMethod,
    methods::{Ack, SendIoCall, SendIoCallInputs, SendLoadingCall, SendLoadingCallInputs},
};
use tokio_util::sync::CancellationToken;

use crate::HostRpc;

/// How a resend-eligible operation left the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The service answered with this acknowledgment.
    Acked(Ack),
    /// The socket went away; the operation stays in flight and is replayed
    /// after the next reconnect.
    Deferred,
}

/// Sends calls to the service, retrying transient failures.
#[derive(Clone)]
pub struct Outbound {
    rpc: HostRpc,
    inflight: Arc<InFlightOperations>,
    shutdown: CancellationToken,
    retry_interval: Duration,
}

impl Outbound {
    pub(crate) const fn new(
        rpc: HostRpc,
        inflight: Arc<InFlightOperations>,
        shutdown: CancellationToken,
        retry_interval: Duration,
    ) -> Self {
        Self {
            rpc,
            inflight,
            shutdown,
            retry_interval,
        }
    }

    /// Call `M`, retrying timeouts and transport failures every retry
    /// interval until it succeeds or the session closes.
    ///
    /// # Errors
    /// Returns the first non-retryable error, or `RpcError::NotConnected`
    /// once the session is closed.
    pub async fn send<M>(&self, inputs: M::Inputs) -> Result<M::Returns, RpcError>
    where
        M: RpcMethod<Name = ServerMethod>,
        M::Inputs: Clone,
    {
        loop {
            match self.rpc.call::<M>(inputs.clone()).await {
                Err(e) if e.is_retryable() => {
                    tracing::debug!(method = M::NAME.as_str(), "call failed, retrying: {e}");
                    if !self.pause().await {
                        return Err(RpcError::NotConnected);
                    }
                }
                other => return other,
            }
        }
    }

    /// Deliver a submission or status report from the unit's call site.
    ///
    /// Timeouts are retried while the operation is still current. A lost
    /// socket defers delivery to the resend pass after reconnect.
    ///
    /// # Errors
    /// Returns cancellation, closed and protocol errors from the service.
    /// On cancellation or closed, every in-flight operation of the unit is
    /// dropped first.
    pub async fn deliver(&self, op: &InFlightOperation) -> Result<Delivery, RpcError> {
        loop {
            match self.call_once(op).await {
                Ok(ack) => return Ok(Delivery::Acked(ack)),
                Err(RpcError::Timeout(after)) => {
                    if !self.inflight.contains(op) {
                        return Ok(Delivery::Deferred);
                    }
                    tracing::debug!(
                        transaction_id = %op.transaction_id(),
                        "no acknowledgment after {after:?}, retrying"
                    );
                    if !self.pause().await {
                        return Err(RpcError::NotConnected);
                    }
                }
                Err(e) if e.is_retryable() => return Ok(Delivery::Deferred),
                Err(e) if e.is_terminal() => {
                    // The service invalidated the unit; nothing of it may be replayed.
                    let dropped = self.inflight.remove_transaction(op.transaction_id());
                    tracing::debug!(
                        transaction_id = %op.transaction_id(),
                        dropped,
                        "operation invalidated by the service: {e}"
                    );
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Issue one call for `op` without retrying.
    ///
    /// # Errors
    /// Returns whatever the call failed with.
    pub async fn call_once(&self, op: &InFlightOperation) -> Result<Ack, RpcError> {
        match op {
            InFlightOperation::Submission {
                transaction_id,
                io_call,
                ..
            } => {
                self.rpc
                    .call::<SendIoCall>(SendIoCallInputs {
                        transaction_id: transaction_id.clone(),
                        io_call: io_call.clone(),
                    })
                    .await
            }
            InFlightOperation::StatusReport {
                transaction_id,
                state,
            } => {
                self.rpc
                    .call::<SendLoadingCall>(SendLoadingCallInputs {
                        transaction_id: transaction_id.clone(),
                        state: state.clone(),
                    })
                    .await
            }
        }
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Sleep one retry interval. Returns `false` if the session closed first.
    pub async fn pause(&self) -> bool {
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            () = tokio::time::sleep(self.retry_interval) => true,
        }
    }
}
