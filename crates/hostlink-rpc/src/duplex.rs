//! Duplex call correlator.

use std::{
    collections::HashMap,
    future::Future,
    marker::PhantomData,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use hostlink_core::{
    Envelope, MethodName, RemoteError, RpcError, RpcMethod,
    ids::{CorrelationId, next_correlation_id},
    protocol::reply_outcome,
};
use hostlink_transport::{CloseEvent, Connection, Transport, TransportEvent};
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::oneshot, task::JoinHandle};

type HandlerFuture = BoxFuture<'static, Result<Value, RpcError>>;
type ErasedHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;
type ReplySlot = oneshot::Sender<Result<Value, RpcError>>;

/// Handler registration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("Handler already registered for {0}")]
    Duplicate(&'static str),
}

struct Inner<C, R> {
    transport: RwLock<Option<Arc<dyn Transport>>>,
    pending: Mutex<HashMap<CorrelationId, ReplySlot>>,
    handlers: RwLock<HashMap<R, ErasedHandler>>,
    call_timeout: Duration,
    _calls: PhantomData<fn() -> C>,
}

/// Symmetric RPC over one socket at a time.
///
/// `C` is the method set this side may call, `R` the set it responds to.
/// The socket can be swapped with [`DuplexRpc::bind`] after a reconnect;
/// registered handlers survive the swap.
pub struct DuplexRpc<C, R> {
    inner: Arc<Inner<C, R>>,
}

impl<C, R> Clone for DuplexRpc<C, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Removes a pending slot when the awaiting call goes away, whether it
/// finished, timed out or was dropped.
struct PendingGuard<'a, C, R> {
    inner: &'a Inner<C, R>,
    id: CorrelationId,
}

impl<C, R> Drop for PendingGuard<'_, C, R> {
    fn drop(&mut self) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl<C, R> DuplexRpc<C, R>
where
    C: MethodName,
    R: MethodName,
{
    /// Create an unbound correlator.
    #[must_use]
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport: RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                call_timeout,
                _calls: PhantomData,
            }),
        }
    }

    /// Register the handler for inbound calls of method `M`.
    ///
    /// # Errors
    /// Returns `RegistrationError::Duplicate` if `M` already has a handler.
    pub fn on<M, F, Fut>(&self, handler: F) -> Result<(), RegistrationError>
    where
        M: RpcMethod<Name = R>,
        F: Fn(M::Inputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<M::Returns, RpcError>> + Send + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |payload: Value| {
            match serde_json::from_value::<M::Inputs>(payload) {
                Ok(inputs) => {
                    let fut = handler(inputs);
                    async move {
                        let returns = fut.await?;
                        serde_json::to_value(returns).map_err(RpcError::from)
                    }
                    .boxed()
                }
                Err(e) => futures::future::ready(Err(RpcError::Protocol(format!(
                    "invalid {} inputs: {e}",
                    M::NAME.as_str()
                ))))
                .boxed(),
            }
        });

        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&M::NAME) {
            return Err(RegistrationError::Duplicate(M::NAME.as_str()));
        }
        handlers.insert(M::NAME, erased);
        Ok(())
    }

    /// Attach a freshly opened socket and start dispatching its frames.
    ///
    /// The returned task resolves with the socket's close notification.
    pub fn bind(&self, connection: Connection) -> JoinHandle<CloseEvent> {
        let Connection {
            transport,
            mut events,
        } = connection;
        *self
            .inner
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(transport);

        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Message(text) => this.handle_incoming(&text),
                    TransportEvent::Closed(close) => return close,
                }
            }
            CloseEvent::default()
        })
    }

    /// Detach the current socket and fail every call still awaiting a reply.
    pub fn unbind(&self, reason: &RpcError) {
        self.inner
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let drained: Vec<_> = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending calls: {reason}");
        }
        for (_, slot) in drained {
            let _ = slot.send(Err(reason.clone()));
        }
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.transport().is_some()
    }

    /// Number of outbound calls awaiting a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner
            .transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Call method `M` on the peer and wait for its reply.
    ///
    /// # Errors
    /// Returns `RpcError::Timeout` if no reply arrives within the call
    /// timeout, `RpcError::NotConnected` without a socket, or the error the
    /// peer replied with.
    pub async fn call<M>(&self, inputs: M::Inputs) -> Result<M::Returns, RpcError>
    where
        M: RpcMethod<Name = C>,
    {
        let payload = serde_json::to_value(&inputs)?;
        let value = self.call_raw(M::NAME, payload).await?;
        serde_json::from_value(value).map_err(|e| {
            RpcError::Protocol(format!("invalid {} reply: {e}", M::NAME.as_str()))
        })
    }

    /// Untyped variant of [`DuplexRpc::call`].
    ///
    /// # Errors
    /// See [`DuplexRpc::call`].
    pub async fn call_raw(&self, method: C, payload: Value) -> Result<Value, RpcError> {
        let transport = self.transport().ok_or(RpcError::NotConnected)?;
        let id = next_correlation_id();
        let text = Envelope::call(id.clone(), method.as_str(), payload).encode()?;

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), tx);
        let _guard = PendingGuard {
            inner: &self.inner,
            id: id.clone(),
        };

        tracing::debug!(method = method.as_str(), %id, "sending call");
        transport.send(text).await?;

        match tokio::time::timeout(self.inner.call_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::NotConnected),
            Err(_elapsed) => {
                tracing::debug!(method = method.as_str(), %id, "call timed out");
                Err(RpcError::Timeout(self.inner.call_timeout))
            }
        }
    }

    /// Dispatch one inbound frame. Never blocks on a handler.
    pub fn handle_incoming(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("dropping malformed message: {e}");
                return;
            }
        };

        match envelope {
            Envelope::Reply {
                id,
                ok,
                result,
                error,
                ..
            } => {
                let slot = self
                    .inner
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                match slot {
                    Some(slot) => {
                        let _ = slot.send(reply_outcome(ok, result, error));
                    }
                    None => tracing::debug!(%id, "reply for unknown or expired call"),
                }
            }
            Envelope::Call {
                id,
                method,
                payload,
            } => self.dispatch(id, method, payload),
        }
    }

    fn dispatch(&self, id: CorrelationId, method: String, payload: Value) {
        let handler = R::parse(&method).and_then(|name| {
            self.inner
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&name)
                .cloned()
        });
        let Some(handler) = handler else {
            tracing::warn!(%method, %id, "no handler for inbound call, dropping");
            return;
        };

        let this = self.clone();
        tokio::spawn(async move {
            let reply = match handler(payload).await {
                Ok(result) => Envelope::success(id, method, result),
                Err(RpcError::Protocol(e)) => {
                    tracing::warn!(%method, %id, "dropping invalid call: {e}");
                    return;
                }
                Err(e) => {
                    tracing::debug!(%method, %id, "handler failed: {e}");
                    Envelope::failure(id, method, RemoteError::from(&e))
                }
            };
            if let Err(e) = this.send_envelope(&reply).await {
                tracing::debug!("failed to send reply: {e}");
            }
        });
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<(), RpcError> {
        let transport = self.transport().ok_or(RpcError::NotConnected)?;
        transport.send(envelope.encode()?).await?;
        Ok(())
    }
}
