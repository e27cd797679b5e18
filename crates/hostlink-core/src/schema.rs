//! Payloads exchanged with the rendering collaborator.
//!
//! Component definitions inside a render instruction stay opaque JSON; this
//! layer only needs the envelope fields to route and de-duplicate them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ids::TransactionId;

/// Version stamped on every reported action result.
pub const TRANSACTION_RESULT_SCHEMA_VERSION: u32 = 1;

/// Latest progress state of a unit of work. Only the newest one matters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_in_queue: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_completed: Option<u64>,
}

impl LoadingState {
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderKind {
    Render,
}

/// One render of a group of components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoRenderInstruction {
    /// Unique per render.
    pub id: String,
    /// Stable across re-renders of the same component group.
    pub input_group_key: String,
    pub to_render: Vec<Value>,
    pub kind: RenderKind,
}

impl IoRenderInstruction {
    /// Render a new component group.
    #[must_use]
    pub fn new(to_render: Vec<Value>) -> Self {
        Self::for_group(Uuid::new_v4().to_string(), to_render)
    }

    /// Re-render an existing component group.
    #[must_use]
    pub fn for_group(input_group_key: impl Into<String>, to_render: Vec<Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            input_group_key: input_group_key.into(),
            to_render,
            kind: RenderKind::Render,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IoResponseKind {
    /// Final values for every component in the group.
    Return,
    /// Intermediate component state; the group stays open.
    SetState,
    /// The person viewing the form canceled the transaction.
    Canceled,
}

/// A parsed response to a render instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoResponseMessage {
    pub id: String,
    pub transaction_id: TransactionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_group_key: Option<String>,
    pub kind: IoResponseKind,
    #[serde(default)]
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Success,
    Failure,
}

/// Final outcome of a unit of work as reported to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub schema_version: u32,
    pub status: ActionStatus,
    pub data: Value,
}

impl ActionResult {
    #[must_use]
    pub const fn success(data: Value) -> Self {
        Self {
            schema_version: TRANSACTION_RESULT_SCHEMA_VERSION,
            status: ActionStatus::Success,
            data,
        }
    }

    /// Failure result carrying the error's name and message.
    #[must_use]
    pub fn failure(error: &str, message: &str) -> Self {
        let data = if message.is_empty() {
            Value::Null
        } else {
            serde_json::json!({ "error": error, "message": message })
        };
        Self {
            schema_version: TRANSACTION_RESULT_SCHEMA_VERSION,
            status: ActionStatus::Failure,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_render_instruction_wire_shape() {
        let render = IoRenderInstruction::for_group("group-1", vec![json!({"methodName": "INPUT_TEXT"})]);
        let value = serde_json::to_value(&render).unwrap();
        assert_eq!(value["kind"], "RENDER");
        assert_eq!(value["inputGroupKey"], "group-1");
        assert_eq!(value["toRender"][0]["methodName"], "INPUT_TEXT");
    }

    #[test]
    fn test_rerender_keeps_group_key_but_not_id() {
        let first = IoRenderInstruction::new(vec![]);
        let second = IoRenderInstruction::for_group(first.input_group_key.clone(), vec![]);
        assert_eq!(first.input_group_key, second.input_group_key);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_failure_result_without_message_has_null_data() {
        let result = ActionResult::failure("Error", "");
        assert_eq!(result.status, ActionStatus::Failure);
        assert_eq!(result.data, Value::Null);

        let result = ActionResult::failure("Error", "boom");
        assert_eq!(result.data, json!({"error": "Error", "message": "boom"}));
    }

    #[test]
    fn test_io_response_parses_kind() {
        let parsed: IoResponseMessage = serde_json::from_str(
            r#"{"id":"r1","transactionId":"tx","kind":"SET_STATE","values":[1]}"#,
        )
        .unwrap();
        assert_eq!(parsed.kind, IoResponseKind::SetState);
        assert!(parsed.input_group_key.is_none());
    }
}
