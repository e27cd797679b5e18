//! Socket abstraction used by the connection orchestrator.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use hostlink_core::{InstanceId, RpcError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Pong not received within {0:?}")]
    PingTimeout(Duration),
    #[error("Socket closed")]
    Closed,
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Why a socket closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: Option<u16>,
    pub reason: Option<String>,
}

impl CloseEvent {
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: Some(reason.into()),
        }
    }
}

/// Inbound traffic of one socket. `Closed` is always the last event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Closed(CloseEvent),
}

/// One physical socket. No retry logic lives here.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one text frame. Delivery is not guaranteed.
    async fn send(&self, text: String) -> Result<(), TransportError>;

    /// Send a liveness probe and wait for its acknowledgment.
    ///
    /// # Errors
    /// Returns `TransportError::PingTimeout` if no pong arrives in time.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Tear down the socket. Idempotent.
    async fn close(&self);
}

/// A freshly opened socket and its event stream.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens sockets to the coordination service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket presenting `instance_id` to the service.
    async fn connect(&self, instance_id: InstanceId) -> Result<Connection, TransportError>;
}

/// Producer side of a socket's event stream.
///
/// Guarantees the close notification fires exactly once, whether the remote
/// side hung up or the host called `close()`.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Forward an inbound frame. Dropped once the socket is closed.
    pub fn message(&self, text: String) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(TransportEvent::Message(text)).is_ok()
    }

    /// Fire the close notification. Returns `false` if it already fired.
    pub fn close(&self, event: CloseEvent) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(TransportEvent::Closed(event));
        true
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_fires_once() {
        let (sink, mut rx) = EventSink::channel();
        assert!(sink.message("a".into()));
        assert!(sink.close(CloseEvent::new(1006, "gone")));
        assert!(!sink.close(CloseEvent::new(1000, "again")));
        assert!(!sink.message("late".into()));
        drop(sink);

        assert_eq!(rx.recv().await, Some(TransportEvent::Message("a".into())));
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Closed(CloseEvent::new(1006, "gone")))
        );
        assert_eq!(rx.recv().await, None);
    }
}
