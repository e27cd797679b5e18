//! Wire envelope for the duplex RPC channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{RemoteError, RpcError},
    ids::CorrelationId,
};

/// One message on the socket, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum Envelope {
    /// Invocation of a method on the peer.
    Call {
        id: CorrelationId,
        method: String,
        #[serde(default)]
        payload: Value,
    },
    /// Outcome of an earlier call with the same id.
    Reply {
        id: CorrelationId,
        #[serde(default)]
        method: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },
}

impl Envelope {
    /// Build an outbound call.
    #[must_use]
    pub fn call(id: CorrelationId, method: impl Into<String>, payload: Value) -> Self {
        Self::Call {
            id,
            method: method.into(),
            payload,
        }
    }

    /// Build a successful reply.
    #[must_use]
    pub fn success(id: CorrelationId, method: impl Into<String>, result: Value) -> Self {
        Self::Reply {
            id,
            method: method.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error reply.
    #[must_use]
    pub fn failure(id: CorrelationId, method: impl Into<String>, error: RemoteError) -> Self {
        Self::Reply {
            id,
            method: method.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Call { id, .. } | Self::Reply { id, .. } => id,
        }
    }

    #[must_use]
    pub fn method(&self) -> &str {
        match self {
            Self::Call { method, .. } | Self::Reply { method, .. } => method,
        }
    }

    /// Serialize to the JSON text frame sent on the socket.
    ///
    /// # Errors
    /// Returns error if a payload fails to serialize.
    pub fn encode(&self) -> Result<String, RpcError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame.
    ///
    /// # Errors
    /// Returns `RpcError::Protocol` for malformed frames.
    pub fn decode(text: &str) -> Result<Self, RpcError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Resolve a reply's `ok` flag into a result.
///
/// # Errors
/// Returns the remote error carried by a reply with `ok: false`.
pub fn reply_outcome(
    ok: bool,
    result: Option<Value>,
    error: Option<RemoteError>,
) -> Result<Value, RpcError> {
    if ok {
        Ok(result.unwrap_or(Value::Null))
    } else {
        Err(error.map_or_else(
            || RpcError::Remote("error reply without details".to_string()),
            RpcError::from,
        ))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_call_wire_shape() {
        let msg = Envelope::call("c1".into(), "SEND_LOG", json!({"index": 0}));
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["direction"], "call");
        assert_eq!(value["method"], "SEND_LOG");
        assert_eq!(value["payload"]["index"], 0);
    }

    #[test]
    fn test_error_reply_carries_kind() {
        let text = r#"{"direction":"reply","id":"c2","ok":false,"error":{"kind":"CANCELED","message":"gone"}}"#;
        let Envelope::Reply { id, ok, result, error, .. } = Envelope::decode(text).unwrap() else {
            panic!("Wrong message type");
        };
        assert_eq!(id, "c2");
        assert_eq!(error.as_ref().map(RemoteError::kind), Some(ErrorKind::Canceled));
        assert_eq!(reply_outcome(ok, result, error), Err(RpcError::Canceled));
    }

    #[test]
    fn test_success_reply_without_result_is_null() {
        assert_eq!(reply_outcome(true, None, None), Ok(Value::Null));
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let err = Envelope::decode(r#"{"direction":"sideways","id":"x"}"#).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }
}
