//! Core types for the host connection layer.
//!
//! This crate provides the fundamental building blocks:
//! - `Envelope` - Wire shape of calls and replies
//! - `ServerMethod` / `HostMethod` - Typed method sets for both directions
//! - `TransactionRegistry` - Units of work, log counters, completion waiters
//! - `InFlightOperations` - Submissions and status reports awaiting resend
//! - `ClientConfig` and the shared error kinds

pub mod config;
pub mod error;
pub mod ids;
pub mod inflight;
pub mod methods;
pub mod protocol;
pub mod registry;
pub mod schema;

pub use config::ClientConfig;
pub use error::{ErrorKind, RemoteError, RpcError};
pub use ids::{InstanceId, TransactionId};
pub use inflight::{InFlightOperation, InFlightOperations};
pub use methods::{HostMethod, MethodName, RpcMethod, ServerMethod};
pub use protocol::Envelope;
pub use registry::{CompletionWaiter, TransactionOutcome, TransactionRegistry};
pub use schema::{ActionResult, IoRenderInstruction, IoResponseMessage, LoadingState};
