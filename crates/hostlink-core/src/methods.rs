//! Typed method sets for both call directions.
//!
//! Each direction is an enum of method names; each method is a marker type
//! binding its name to typed inputs and returns. Handlers are registered per
//! marker type, so an unknown or mistyped method is rejected at registration
//! time instead of on every call.

use std::{fmt, hash::Hash};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{ids::TransactionId, schema::LoadingState};

/// A closed set of method names for one call direction.
pub trait MethodName: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    fn as_str(self) -> &'static str;

    /// Resolve a wire name, `None` if the set has no such method.
    fn parse(name: &str) -> Option<Self>;
}

/// One method: its name plus input and return types.
pub trait RpcMethod: Send + Sync + 'static {
    type Name: MethodName;
    const NAME: Self::Name;
    type Inputs: Serialize + DeserializeOwned + Send + 'static;
    type Returns: Serialize + DeserializeOwned + Send + 'static;
}

/// Methods the host calls on the coordination service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerMethod {
    InitializeHost,
    SendIoCall,
    SendLoadingCall,
    SendLog,
    MarkTransactionComplete,
}

impl MethodName for ServerMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::InitializeHost => "INITIALIZE_HOST",
            Self::SendIoCall => "SEND_IO_CALL",
            Self::SendLoadingCall => "SEND_LOADING_CALL",
            Self::SendLog => "SEND_LOG",
            Self::MarkTransactionComplete => "MARK_TRANSACTION_COMPLETE",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "INITIALIZE_HOST" => Some(Self::InitializeHost),
            "SEND_IO_CALL" => Some(Self::SendIoCall),
            "SEND_LOADING_CALL" => Some(Self::SendLoadingCall),
            "SEND_LOG" => Some(Self::SendLog),
            "MARK_TRANSACTION_COMPLETE" => Some(Self::MarkTransactionComplete),
            _ => None,
        }
    }
}

/// Methods the coordination service calls on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostMethod {
    StartTransaction,
    IoResponse,
}

impl MethodName for HostMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::StartTransaction => "START_TRANSACTION",
            Self::IoResponse => "IO_RESPONSE",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "START_TRANSACTION" => Some(Self::StartTransaction),
            "IO_RESPONSE" => Some(Self::IoResponse),
            _ => None,
        }
    }
}

/// Action descriptor declared during host initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescriptor {
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backgroundable: Option<bool>,
}

impl ActionDescriptor {
    #[must_use]
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            name: None,
            description: None,
            backgroundable: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeHostInputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub actions: Vec<ActionDescriptor>,
    pub sdk_name: String,
    pub sdk_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionEnvironment {
    Live,
    Development,
}

/// Advisory about the host SDK version sent by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkAlert {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_sdk_version: Option<String>,
    pub severity: SdkAlertSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SdkAlertSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InitializeHostReturns {
    #[serde(rename_all = "camelCase")]
    Success {
        environment: ActionEnvironment,
        #[serde(default)]
        invalid_slugs: Vec<String>,
        organization: Organization,
        dashboard_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdk_alert: Option<SdkAlert>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdk_alert: Option<SdkAlert>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendIoCallInputs {
    pub transaction_id: TransactionId,
    /// Serialized render instruction.
    pub io_call: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendLoadingCallInputs {
    pub transaction_id: TransactionId,
    #[serde(flatten)]
    pub state: LoadingState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendLogInputs {
    pub transaction_id: TransactionId,
    pub data: String,
    pub index: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkTransactionCompleteInputs {
    pub transaction_id: TransactionId,
    /// Serialized action result.
    pub result: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionUser {
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionInputs {
    pub transaction_id: TransactionId,
    pub action_name: String,
    pub environment: ActionEnvironment,
    #[serde(default)]
    pub user: ActionUser,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoResponseInputs {
    pub transaction_id: TransactionId,
    /// Serialized `IoResponse`.
    pub value: String,
}

/// Acknowledgment returned by host-originated calls; `false` means the
/// service did not apply the operation.
pub type Ack = bool;

/// Declare the host's actions and receive organization details.
#[derive(Debug, Clone, Copy)]
pub struct InitializeHost;

impl RpcMethod for InitializeHost {
    type Name = ServerMethod;
    const NAME: ServerMethod = ServerMethod::InitializeHost;
    type Inputs = InitializeHostInputs;
    type Returns = InitializeHostReturns;
}

/// Submit a render instruction for a unit of work.
#[derive(Debug, Clone, Copy)]
pub struct SendIoCall;

impl RpcMethod for SendIoCall {
    type Name = ServerMethod;
    const NAME: ServerMethod = ServerMethod::SendIoCall;
    type Inputs = SendIoCallInputs;
    type Returns = Ack;
}

/// Report the latest loading state for a unit of work.
#[derive(Debug, Clone, Copy)]
pub struct SendLoadingCall;

impl RpcMethod for SendLoadingCall {
    type Name = ServerMethod;
    const NAME: ServerMethod = ServerMethod::SendLoadingCall;
    type Inputs = SendLoadingCallInputs;
    type Returns = Ack;
}

/// Deliver one log line for a unit of work.
#[derive(Debug, Clone, Copy)]
pub struct SendLog;

impl RpcMethod for SendLog {
    type Name = ServerMethod;
    const NAME: ServerMethod = ServerMethod::SendLog;
    type Inputs = SendLogInputs;
    type Returns = Ack;
}

/// Report the final result of a unit of work.
#[derive(Debug, Clone, Copy)]
pub struct MarkTransactionComplete;

impl RpcMethod for MarkTransactionComplete {
    type Name = ServerMethod;
    const NAME: ServerMethod = ServerMethod::MarkTransactionComplete;
    type Inputs = MarkTransactionCompleteInputs;
    type Returns = Ack;
}

/// Start a unit of work on the host.
#[derive(Debug, Clone, Copy)]
pub struct StartTransaction;

impl RpcMethod for StartTransaction {
    type Name = HostMethod;
    const NAME: HostMethod = HostMethod::StartTransaction;
    type Inputs = StartTransactionInputs;
    type Returns = ();
}

/// Deliver a user response to a pending render.
#[derive(Debug, Clone, Copy)]
pub struct IoResponse;

impl RpcMethod for IoResponse {
    type Name = HostMethod;
    const NAME: HostMethod = HostMethod::IoResponse;
    type Inputs = IoResponseInputs;
    type Returns = ();
}
