//! Host error types.

use hostlink_core::RpcError;
use hostlink_rpc::RegistrationError;
use hostlink_transport::TransportError;

/// Host-level error.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
    #[error("Handler registration failed: {0}")]
    Registration(#[from] RegistrationError),
    #[error("Host initialization failed: {0}")]
    Initialize(String),
    #[error("No valid slugs provided")]
    NoValidSlugs,
    #[error("Missing request ID")]
    MissingRequestId,
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Client is closed")]
    Closed,
}
