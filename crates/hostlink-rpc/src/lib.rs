//! Call correlation for the host connection layer.
//!
//! `DuplexRpc` sends typed calls to the peer and awaits their replies by
//! correlation id, while dispatching the peer's calls to registered
//! handlers on the same socket.

pub mod duplex;

pub use duplex::{DuplexRpc, RegistrationError};
