//! Host runtime for the coordination protocol.
//!
//! Provides:
//! - `HostClient` - Connect, declare actions and serve units of work
//! - `Orchestrator` - Keepalive and reconnect with a stable instance id
//! - `ResendCoordinator` - Replay of in-flight operations after reconnect
//! - `Actions` / `ActionHandler` - Action definitions, IO client and context

pub mod action;
pub mod client;
pub mod error;
pub mod io;
pub mod orchestrator;
pub mod outbound;
pub mod resend;
pub mod state;

use hostlink_core::{HostMethod, ServerMethod};
use hostlink_rpc::DuplexRpc;

pub use action::{ActionContext, ActionError, ActionHandler, Actions, LoadingHandle};
pub use client::HostClient;
pub use error::HostError;
pub use io::IoClient;
pub use orchestrator::Orchestrator;
pub use resend::{ResendCoordinator, ResendReport};
pub use state::ConnectionState;

/// Correlator as seen from the host: calls service methods, answers host
/// methods.
pub type HostRpc = DuplexRpc<ServerMethod, HostMethod>;
