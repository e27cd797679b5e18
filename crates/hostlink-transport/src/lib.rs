//! Socket transports for the host connection layer.
//!
//! Provides:
//! - `Transport` / `Connector` traits (one socket / socket factory)
//! - WebSocket client transport
//! - In-memory transport for tests and in-process use
//! - Loopback coordination server (feature: server)

pub mod memory;
pub mod transport;
pub mod websocket;

#[cfg(feature = "server")]
pub mod server;

pub use memory::{MemoryConnector, MemoryPeer, MemoryRemote, memory_transport};
pub use transport::{
    CloseEvent, Connection, Connector, EventSink, Transport, TransportError, TransportEvent,
};
pub use websocket::{WsConnector, WsTransport};

#[cfg(feature = "server")]
pub use server::{LoopbackServer, RemoteSocket};
