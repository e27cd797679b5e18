//! Error kinds shared by every layer of the connection stack.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind tag carried by an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The unit of work was canceled by the remote side.
    Canceled,
    /// The unit of work already finished.
    TransactionClosed,
    /// The callee has no handler for the method.
    UnknownMethod,
    /// The callee could not decode the call.
    Protocol,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Canceled => "CANCELED",
            Self::TransactionClosed => "TRANSACTION_CLOSED",
            Self::UnknownMethod => "UNKNOWN_METHOD",
            Self::Protocol => "PROTOCOL",
            Self::Internal => "INTERNAL",
        }
    }

    /// Parse a wire tag. Unrecognized tags map to `Internal`.
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        match tag {
            "CANCELED" => Self::Canceled,
            "TRANSACTION_CLOSED" => Self::TransactionClosed,
            "UNKNOWN_METHOD" => Self::UnknownMethod,
            "PROTOCOL" => Self::Protocol,
            _ => Self::Internal,
        }
    }
}

/// Error payload of a reply with `ok: false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl RemoteError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.as_str().to_string()),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind.as_deref().map_or(ErrorKind::Internal, ErrorKind::parse)
    }
}

/// Failure of an RPC call, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transaction canceled")]
    Canceled,
    #[error("Transaction already closed")]
    TransactionClosed,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Not connected")]
    NotConnected,
}

impl RpcError {
    /// Canceled and closed errors end all communication about a unit.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::TransactionClosed)
    }

    /// Failures that may succeed when the same call is re-issued later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_) | Self::NotConnected)
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        match err.kind() {
            ErrorKind::Canceled => Self::Canceled,
            ErrorKind::TransactionClosed => Self::TransactionClosed,
            ErrorKind::UnknownMethod => Self::UnknownMethod(err.message),
            ErrorKind::Protocol => Self::Protocol(err.message),
            ErrorKind::Internal => Self::Remote(err.message),
        }
    }
}

impl From<&RpcError> for RemoteError {
    fn from(err: &RpcError) -> Self {
        let kind = match err {
            RpcError::Canceled => ErrorKind::Canceled,
            RpcError::TransactionClosed => ErrorKind::TransactionClosed,
            RpcError::UnknownMethod(_) => ErrorKind::UnknownMethod,
            RpcError::Protocol(_) => ErrorKind::Protocol,
            RpcError::Transport(_)
            | RpcError::Timeout(_)
            | RpcError::Remote(_)
            | RpcError::NotConnected => ErrorKind::Internal,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_kinds_map_to_terminal_errors() {
        let canceled: RpcError = RemoteError::new(ErrorKind::Canceled, "").into();
        let closed: RpcError = RemoteError::new(ErrorKind::TransactionClosed, "").into();
        assert_eq!(canceled, RpcError::Canceled);
        assert_eq!(closed, RpcError::TransactionClosed);
        assert!(canceled.is_terminal());
        assert!(closed.is_terminal());
        assert!(!canceled.is_retryable());
    }

    #[test]
    fn test_unknown_remote_kind_is_internal() {
        let err: RemoteError = serde_json::from_str(r#"{"kind":"SOMETHING_NEW","message":"x"}"#).unwrap();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(RpcError::from(err), RpcError::Remote("x".into()));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RpcError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(RpcError::Transport("reset".into()).is_retryable());
        assert!(RpcError::NotConnected.is_retryable());
        assert!(!RpcError::Protocol("bad".into()).is_retryable());
    }
}
