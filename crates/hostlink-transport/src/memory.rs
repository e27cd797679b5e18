//! In-memory transport.
//!
//! Useful for tests and for embedding the host next to an in-process
//! coordinator. The `MemoryRemote` half plays the service: it accepts
//! sockets, reads and writes envelopes, refuses connects, drops pongs and
//! kills sockets on demand.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use hostlink_core::{
    Envelope, InstanceId, RemoteError,
    ids::{CorrelationId, next_correlation_id},
};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::transport::{CloseEvent, Connection, Connector, EventSink, Transport, TransportError};

const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

struct Shared {
    refuse: AtomicBool,
    answer_pings: AtomicBool,
    attempts: AtomicUsize,
    ping_timeout: Duration,
    accepted: mpsc::UnboundedSender<MemoryPeer>,
}

/// Create a connected connector/remote pair.
#[must_use]
pub fn memory_transport() -> (MemoryConnector, MemoryRemote) {
    memory_transport_with_ping_timeout(DEFAULT_PING_TIMEOUT)
}

/// Like [`memory_transport`], with a custom ping timeout.
#[must_use]
pub fn memory_transport_with_ping_timeout(ping_timeout: Duration) -> (MemoryConnector, MemoryRemote) {
    let (accepted, accepted_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        refuse: AtomicBool::new(false),
        answer_pings: AtomicBool::new(true),
        attempts: AtomicUsize::new(0),
        ping_timeout,
        accepted,
    });
    (
        MemoryConnector {
            shared: Arc::clone(&shared),
        },
        MemoryRemote {
            shared,
            accepted: accepted_rx,
        },
    )
}

/// Host side: opens in-memory sockets.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, instance_id: InstanceId) -> Result<Connection, TransportError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (events, events_rx) = EventSink::channel();
        let (to_remote, incoming) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            instance_id,
            incoming,
            events: events.clone(),
        };
        self.shared
            .accepted
            .send(peer)
            .map_err(|_| TransportError::Connect("remote is gone".to_string()))?;

        let transport = MemoryTransport {
            to_remote,
            events,
            shared: Arc::clone(&self.shared),
        };
        Ok(Connection {
            transport: Arc::new(transport),
            events: events_rx,
        })
    }
}

struct MemoryTransport {
    to_remote: mpsc::UnboundedSender<String>,
    events: EventSink,
    shared: Arc<Shared>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        if self.events.is_closed() {
            return Err(TransportError::Closed);
        }
        self.to_remote
            .send(text)
            .map_err(|_| TransportError::Send("remote dropped the socket".to_string()))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        if self.events.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.shared.answer_pings.load(Ordering::SeqCst) {
            return Ok(());
        }
        tokio::time::sleep(self.shared.ping_timeout).await;
        Err(TransportError::PingTimeout(self.shared.ping_timeout))
    }

    async fn close(&self) {
        self.events.close(CloseEvent::new(1000, "closed by host"));
    }
}

/// Service side of the in-memory transport.
pub struct MemoryRemote {
    shared: Arc<Shared>,
    accepted: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryRemote {
    /// Wait for the host to open the next socket.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.recv().await
    }

    /// Refuse (or accept again) subsequent connect attempts.
    pub fn set_refuse(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Stop (or resume) acknowledging pings.
    pub fn set_answer_pings(&self, answer: bool) {
        self.shared.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// Connect attempts seen so far, including refused ones.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

/// The service's view of one host socket.
pub struct MemoryPeer {
    instance_id: InstanceId,
    incoming: mpsc::UnboundedReceiver<String>,
    events: EventSink,
}

impl MemoryPeer {
    /// Instance id presented by the host on connect.
    #[must_use]
    pub const fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Next raw frame written by the host.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    /// Next well-formed envelope written by the host.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let text = self.incoming.recv().await?;
            match Envelope::decode(&text) {
                Ok(envelope) => return Some(envelope),
                Err(e) => tracing::warn!("memory peer skipping invalid frame: {e}"),
            }
        }
    }

    /// Write a raw frame to the host.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.events.message(text.into())
    }

    pub fn send(&self, envelope: &Envelope) -> bool {
        envelope
            .encode()
            .is_ok_and(|text| self.events.message(text))
    }

    /// Call a host method; returns the correlation id used.
    pub fn call(&self, method: &str, payload: Value) -> CorrelationId {
        let id = next_correlation_id();
        self.send(&Envelope::call(id.clone(), method, payload));
        id
    }

    pub fn reply_ok(&self, call: &Envelope, result: Value) -> bool {
        self.send(&Envelope::success(call.id().to_owned(), call.method(), result))
    }

    pub fn reply_err(&self, call: &Envelope, error: RemoteError) -> bool {
        self.send(&Envelope::failure(call.id().to_owned(), call.method(), error))
    }

    /// Drop the socket from the service side.
    pub fn kill(&self, code: u16, reason: &str) -> bool {
        self.events.close(CloseEvent::new(code, reason))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}
