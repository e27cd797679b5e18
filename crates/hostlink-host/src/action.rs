//! Action definitions and the per-unit context handed to handlers.

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use hostlink_core::{
    InFlightOperation, LoadingState, RpcError, TransactionId, TransactionRegistry,
    methods::{
        ActionDescriptor, ActionEnvironment, ActionUser, Organization, SendLog, SendLogInputs,
    },
};
use serde_json::{Map, Value};

use crate::{io::IoClient, outbound::Outbound};

/// Longest log line sent to the service, in characters.
pub const LOG_LINE_LIMIT: usize = 10_000;

const LOG_LINE_TRUNCATED: &str = "...\n^ Warning: 10k logline character limit reached.\nTo avoid this error, try separating your data into multiple ctx.log() calls.";

/// Why an action handler did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("{message}")]
    Failed { name: String, message: String },
}

impl ActionError {
    /// Failure reported to the person who ran the action.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            name: "Error".to_string(),
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Rpc(RpcError::Canceled))
    }

    /// Short error name recorded in the failure result.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Rpc(RpcError::TransactionClosed) => "TransactionClosedError",
            Self::Rpc(_) => "IOError",
            Self::Failed { name, .. } => name,
        }
    }
}

/// Runs one named action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run the action to completion.
    ///
    /// # Errors
    /// Returns `ActionError::Rpc(RpcError::Canceled)` when the unit was
    /// canceled, any other error to report a failure.
    async fn run(&self, io: IoClient, ctx: ActionContext) -> Result<Value, ActionError>;
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnAction<F>
where
    F: Fn(IoClient, ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
{
    async fn run(&self, io: IoClient, ctx: ActionContext) -> Result<Value, ActionError> {
        (self.0)(io, ctx).await
    }
}

#[derive(Clone)]
pub(crate) struct ActionDefinition {
    pub descriptor: ActionDescriptor,
    pub handler: Arc<dyn ActionHandler>,
}

/// The actions a host serves, keyed by slug.
#[derive(Clone, Default)]
pub struct Actions {
    definitions: BTreeMap<String, ActionDefinition>,
}

impl Actions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action; a later definition for the same slug replaces it.
    #[must_use]
    pub fn with(mut self, descriptor: ActionDescriptor, handler: Arc<dyn ActionHandler>) -> Self {
        self.insert(descriptor, handler);
        self
    }

    /// Add an action backed by an async closure.
    #[must_use]
    pub fn with_fn<F, Fut>(self, slug: impl Into<String>, handler: F) -> Self
    where
        F: Fn(IoClient, ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
    {
        self.with(ActionDescriptor::new(slug), Arc::new(FnAction(handler)))
    }

    pub fn insert(&mut self, descriptor: ActionDescriptor, handler: Arc<dyn ActionHandler>) {
        self.definitions.insert(
            descriptor.slug.clone(),
            ActionDefinition {
                descriptor,
                handler,
            },
        );
    }

    pub(crate) fn get(&self, slug: &str) -> Option<&ActionDefinition> {
        self.definitions.get(slug)
    }

    /// Descriptors declared to the service at initialization.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ActionDescriptor> {
        self.definitions
            .values()
            .map(|def| def.descriptor.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Shared plumbing behind the context of every unit.
#[derive(Clone)]
pub(crate) struct UnitChannels {
    pub outbound: Outbound,
    pub registry: Arc<TransactionRegistry>,
}

/// Everything a handler knows about the unit it is running.
pub struct ActionContext {
    pub user: ActionUser,
    pub params: Map<String, Value>,
    pub environment: ActionEnvironment,
    pub organization: Organization,
    pub action_slug: String,
    pub loading: LoadingHandle,
    transaction_id: TransactionId,
    channels: UnitChannels,
}

impl ActionContext {
    pub(crate) fn new(
        transaction_id: TransactionId,
        action_slug: String,
        user: ActionUser,
        params: Map<String, Value>,
        environment: ActionEnvironment,
        organization: Organization,
        channels: UnitChannels,
    ) -> Self {
        Self {
            user,
            params,
            environment,
            organization,
            action_slug,
            loading: LoadingHandle {
                transaction_id: transaction_id.clone(),
                channels: channels.clone(),
            },
            transaction_id,
            channels,
        }
    }

    #[must_use]
    pub const fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    /// Send a log line for this unit.
    ///
    /// The line's index is taken now, so lines keep their emission order
    /// even though delivery happens in the background.
    pub fn log(&self, line: impl fmt::Display) {
        let Some(index) = self.channels.registry.next_log_index(&self.transaction_id) else {
            return;
        };
        let inputs = SendLogInputs {
            transaction_id: self.transaction_id.clone(),
            data: truncate_log_line(line.to_string()),
            index,
            timestamp: now_millis(),
        };
        let outbound = self.channels.outbound.clone();
        tokio::spawn(async move {
            let transaction_id = inputs.transaction_id.clone();
            if let Err(e) = outbound.send::<SendLog>(inputs).await {
                tracing::debug!(%transaction_id, index, "failed to send log: {e}");
            }
        });
    }
}

/// Reports the loading state of a unit.
#[derive(Clone)]
pub struct LoadingHandle {
    transaction_id: TransactionId,
    channels: UnitChannels,
}

impl LoadingHandle {
    /// Replace the unit's loading state.
    ///
    /// # Errors
    /// Returns cancellation and closed errors from the service.
    pub async fn update(&self, state: LoadingState) -> Result<(), RpcError> {
        let inflight = self.channels.registry.inflight();
        inflight.record_status(&self.transaction_id, state.clone());
        let op = InFlightOperation::StatusReport {
            transaction_id: self.transaction_id.clone(),
            state,
        };
        if self.channels.outbound.deliver(&op).await? == crate::outbound::Delivery::Acked(false) {
            tracing::debug!(transaction_id = %self.transaction_id, "loading state rejected");
            inflight.remove_if_current(&op);
        }
        Ok(())
    }

    /// Show a titled loading indicator.
    ///
    /// # Errors
    /// See [`LoadingHandle::update`].
    pub async fn start(&self, title: impl Into<String>) -> Result<(), RpcError> {
        self.update(LoadingState::titled(title)).await
    }
}

fn truncate_log_line(line: String) -> String {
    match line.char_indices().nth(LOG_LINE_LIMIT) {
        Some((cut, _)) => format!("{}{LOG_LINE_TRUNCATED}", &line[..cut]),
        None => line,
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
