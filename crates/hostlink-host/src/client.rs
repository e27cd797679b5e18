//! The host client: one session with the coordination service.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock, Weak},
};

use hostlink_core::{
    ActionResult, ClientConfig, CompletionWaiter, InFlightOperations, InstanceId,
    IoResponseMessage, RpcError, TransactionRegistry,
    methods::{
        ActionEnvironment, InitializeHost, InitializeHostInputs, InitializeHostReturns,
        IoResponse, IoResponseInputs, MarkTransactionComplete, MarkTransactionCompleteInputs,
        Organization, SdkAlert, SdkAlertSeverity, StartTransaction, StartTransactionInputs,
    },
};
use hostlink_transport::{Connector, WsConnector};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::{
    HostRpc,
    action::{ActionContext, ActionDefinition, Actions, UnitChannels},
    error::HostError,
    io::IoClient,
    orchestrator::Orchestrator,
    outbound::Outbound,
    resend::ResendCoordinator,
    state::ConnectionState,
};

const SDK_NAME: &str = env!("CARGO_PKG_NAME");
const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
struct HostInfo {
    organization: Organization,
    environment: ActionEnvironment,
}

struct Session {
    config: ClientConfig,
    actions: Actions,
    rpc: HostRpc,
    registry: Arc<TransactionRegistry>,
    outbound: Outbound,
    orchestrator: Arc<Orchestrator>,
    resend: ResendCoordinator,
    shutdown: CancellationToken,
    host: RwLock<Option<HostInfo>>,
    /// Request id the service started this host for, in serverless mode.
    request_id: RwLock<Option<String>>,
    request_waiters: Mutex<HashMap<String, CompletionWaiter>>,
    reconnected: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

/// Host side of the coordination protocol.
///
/// Cloning is cheap; clones share the session.
#[derive(Clone)]
pub struct HostClient {
    session: Arc<Session>,
}

impl HostClient {
    /// Create a client that connects over WebSocket to `config.endpoint`.
    ///
    /// # Errors
    /// Returns error if the configuration is unusable.
    pub fn new(config: ClientConfig, actions: Actions) -> Result<Self, HostError> {
        if config.endpoint.trim().is_empty() {
            return Err(HostError::Config("endpoint is empty".to_string()));
        }
        let connector = Arc::new(WsConnector::from_config(&config));
        Self::with_connector(config, actions, connector)
    }

    /// Create a client over a custom connector.
    ///
    /// # Errors
    /// Returns error if the protocol handlers cannot be registered.
    pub fn with_connector(
        config: ClientConfig,
        actions: Actions,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, HostError> {
        let shutdown = CancellationToken::new();
        let rpc = HostRpc::new(config.call_timeout());
        let registry = Arc::new(TransactionRegistry::new(Arc::new(InFlightOperations::new())));
        let outbound = Outbound::new(
            rpc.clone(),
            Arc::clone(registry.inflight()),
            shutdown.clone(),
            config.retry_interval(),
        );
        let (orchestrator, reconnected) =
            Orchestrator::new(connector, rpc.clone(), &config, shutdown.clone());

        let session = Arc::new(Session {
            resend: ResendCoordinator::new(outbound.clone(), Arc::clone(&registry)),
            config,
            actions,
            rpc,
            registry,
            outbound,
            orchestrator,
            shutdown,
            host: RwLock::new(None),
            request_id: RwLock::new(None),
            request_waiters: Mutex::new(HashMap::new()),
            reconnected: Mutex::new(Some(reconnected)),
        });
        Session::register_handlers(&session)?;
        Ok(Self { session })
    }

    /// Connect and declare this host's actions to the service.
    ///
    /// Returns once the host is initialized; units of work then run in the
    /// background until [`HostClient::close`].
    ///
    /// # Errors
    /// Returns error if the first connect fails or initialization is
    /// rejected.
    pub async fn listen(&self) -> Result<(), HostError> {
        if self.session.actions.is_empty() {
            tracing::info!("no actions defined, skipping host initialization");
            return Ok(());
        }
        self.session.ensure_connected().await?;
        self.session.initialize_host().await
    }

    /// Serve the single request `request_id` and wait for its unit to finish.
    ///
    /// Returns `Ok(None)` without connecting when no actions are defined.
    ///
    /// # Errors
    /// Returns `HostError::MissingRequestId` for an empty id, or the error
    /// the unit failed with.
    pub async fn respond_to_request(
        &self,
        request_id: &str,
    ) -> Result<Option<ActionResult>, HostError> {
        if request_id.is_empty() {
            return Err(HostError::MissingRequestId);
        }
        if self.session.actions.is_empty() {
            tracing::info!("respond_to_request() with no defined actions is a no-op, skipping");
            return Ok(None);
        }

        let session = &self.session;
        session.ensure_connected().await?;

        let (tx, rx) = oneshot::channel();
        session
            .request_waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id.to_string(), tx);
        *session
            .request_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(request_id.to_string());

        if session.shutdown.is_cancelled() {
            session.abandon_units();
            return Err(HostError::Closed);
        }
        if session.host_info().is_none() {
            session.initialize_host().await?;
        }

        match rx.await {
            Ok(Ok(result)) => Ok(Some(result)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(RpcError::TransactionClosed.into()),
        }
    }

    /// Close the session. No reconnect follows.
    ///
    /// Units still running are failed with `RpcError::NotConnected`, and
    /// pending [`HostClient::respond_to_request`] calls return.
    pub async fn close(&self) {
        tracing::info!("closing host connection");
        self.session.orchestrator.close().await;
        self.session.abandon_units();
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.session.orchestrator.state()
    }

    /// Stream of connection states, starting with the current one.
    #[must_use]
    pub fn state_stream(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.session.orchestrator.subscribe())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.session.orchestrator.instance_id()
    }

    /// Organization reported by the last successful initialization.
    #[must_use]
    pub fn organization(&self) -> Option<Organization> {
        self.session.host_info().map(|info| info.organization)
    }

    #[must_use]
    pub fn environment(&self) -> Option<ActionEnvironment> {
        self.session.host_info().map(|info| info.environment)
    }

    /// Units of work currently running.
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.session.registry.active_count()
    }

    /// Submissions and status reports not yet settled with the service.
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.session.registry.inflight().len()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.session.config
    }
}

impl Session {
    fn register_handlers(this: &Arc<Self>) -> Result<(), HostError> {
        let weak = Arc::downgrade(this);
        this.rpc
            .on::<StartTransaction, _, _>(move |inputs: StartTransactionInputs| {
                let session = Weak::upgrade(&weak);
                async move {
                    if let Some(session) = session {
                        session.start_transaction(inputs);
                    }
                    Ok(())
                }
            })?;

        let weak = Arc::downgrade(this);
        this.rpc
            .on::<IoResponse, _, _>(move |inputs: IoResponseInputs| {
                let session = Weak::upgrade(&weak);
                async move {
                    if let Some(session) = session {
                        session.io_response(&inputs);
                    }
                    Ok(())
                }
            })?;
        Ok(())
    }

    fn host_info(&self) -> Option<HostInfo> {
        self.host
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn request_id(&self) -> Option<String> {
        self.request_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<(), HostError> {
        match self.orchestrator.state() {
            ConnectionState::Closed => return Err(HostError::Closed),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                self.orchestrator.connect().await?;
            }
            _ => {}
        }

        let reconnected = self
            .reconnected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reconnected) = reconnected {
            tokio::spawn(Self::after_reconnects(Arc::downgrade(self), reconnected));
        }
        Ok(())
    }

    /// Re-initialize and replay in-flight operations after each reconnect.
    ///
    /// A newer reconnect cancels the pass started for the previous one.
    async fn after_reconnects(session: Weak<Self>, mut reconnected: mpsc::UnboundedReceiver<u64>) {
        let mut current: Option<CancellationToken> = None;
        while let Some(generation) = reconnected.recv().await {
            let Some(this) = session.upgrade() else {
                return;
            };
            if let Some(previous) = current.take() {
                previous.cancel();
            }
            let cancel = this.shutdown.child_token();
            current = Some(cancel.clone());
            tokio::spawn(async move {
                if this.host_info().is_some() {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        result = this.initialize_host() => {
                            if let Err(e) = result {
                                tracing::error!(generation, "failed to re-initialize host: {e}");
                            }
                        }
                    }
                }
                let report = this.resend.run(&cancel).await;
                if report.rounds > 0 {
                    tracing::debug!(
                        generation,
                        rounds = report.rounds,
                        delivered = report.delivered,
                        dropped = report.dropped,
                        "resend pass finished"
                    );
                }
            });
        }
    }

    async fn initialize_host(&self) -> Result<(), HostError> {
        let descriptors = self.actions.descriptors();
        if descriptors.is_empty() {
            tracing::info!("no actions defined, skipping host initialization");
            return Ok(());
        }
        let slug_count = descriptors.len();

        let response = self
            .outbound
            .send::<InitializeHost>(InitializeHostInputs {
                api_key: self.config.api_key.clone(),
                actions: descriptors,
                sdk_name: SDK_NAME.to_string(),
                sdk_version: SDK_VERSION.to_string(),
                request_id: self.request_id(),
            })
            .await?;

        match response {
            InitializeHostReturns::Error { message, sdk_alert } => {
                if let Some(alert) = sdk_alert {
                    log_sdk_alert(&alert);
                }
                Err(HostError::Initialize(message))
            }
            InitializeHostReturns::Success {
                environment,
                invalid_slugs,
                organization,
                dashboard_url,
                sdk_alert,
            } => {
                if let Some(alert) = sdk_alert {
                    log_sdk_alert(&alert);
                }
                if !invalid_slugs.is_empty() {
                    tracing::warn!(
                        ?invalid_slugs,
                        "invalid slugs detected; action slugs must contain only letters, numbers, underscores, periods, and hyphens"
                    );
                    if invalid_slugs.len() == slug_count {
                        return Err(HostError::NoValidSlugs);
                    }
                }

                *self.host.write().unwrap_or_else(PoisonError::into_inner) = Some(HostInfo {
                    organization,
                    environment,
                });
                tracing::info!("connected! access your actions at: {dashboard_url}");
                tracing::debug!(instance_id = %self.orchestrator.instance_id(), "host initialized");
                Ok(())
            }
        }
    }

    fn abandon_units(&self) {
        let error = RpcError::NotConnected;
        let failed = self.registry.fail_all(&error);
        let waiters: Vec<_> = self
            .request_waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (request_id, waiter) in waiters {
            if waiter.send(Err(error.clone())).is_err() {
                tracing::debug!(%request_id, "request waiter went away");
            }
        }
        if failed > 0 {
            tracing::info!(failed, "abandoned running transactions on close");
        }
    }

    fn take_request_waiter(&self) -> Option<CompletionWaiter> {
        let request_id = self.request_id()?;
        let waiter = self
            .request_waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id);
        if waiter.is_none() {
            tracing::debug!(%request_id, "no completion waiter for request");
        }
        waiter
    }

    fn start_transaction(self: Arc<Self>, inputs: StartTransactionInputs) {
        let Some(host) = self.host_info() else {
            tracing::error!("no organization defined");
            return;
        };
        let StartTransactionInputs {
            transaction_id,
            action_name,
            environment,
            user,
            params,
        } = inputs;
        let Some(action) = self.actions.get(&action_name).cloned() else {
            tracing::debug!(%transaction_id, action = %action_name, "no handler for action");
            return;
        };

        if !self
            .registry
            .begin(&transaction_id, self.take_request_waiter())
        {
            return;
        }
        let (responses_tx, responses) = mpsc::unbounded_channel();
        self.registry.set_response_route(&transaction_id, responses_tx);

        let io = IoClient::new(
            transaction_id.clone(),
            self.outbound.clone(),
            Arc::clone(self.registry.inflight()),
            responses,
        );
        let ctx = ActionContext::new(
            transaction_id,
            action_name,
            user,
            params,
            environment,
            host.organization,
            UnitChannels {
                outbound: self.outbound.clone(),
                registry: Arc::clone(&self.registry),
            },
        );
        tokio::spawn(self.run_action(action, io, ctx));
    }

    async fn run_action(self: Arc<Self>, action: ActionDefinition, io: IoClient, ctx: ActionContext) {
        let transaction_id = ctx.transaction_id().clone();
        let slug = ctx.action_slug.clone();
        tracing::debug!(%transaction_id, action = %slug, "running action");

        let outcome = action.handler.run(io, ctx).await;
        if self.shutdown.is_cancelled() {
            tracing::debug!(%transaction_id, action = %slug, "session closed, not marking completion");
            self.registry.fail(&transaction_id, RpcError::NotConnected);
            return;
        }
        let result = match outcome {
            Ok(data) => ActionResult::success(data),
            Err(e) if e.is_canceled() => {
                tracing::info!(%transaction_id, action = %slug, "transaction canceled");
                self.registry.fail(&transaction_id, RpcError::Canceled);
                return;
            }
            Err(e) => {
                tracing::error!(%transaction_id, action = %slug, "action failed: {e}");
                ActionResult::failure(e.name(), &e.to_string())
            }
        };

        let encoded = match serde_json::to_string(&result) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(%transaction_id, "failed to encode action result: {e}");
                self.registry.fail(&transaction_id, e.into());
                return;
            }
        };
        let marked = self
            .outbound
            .send::<MarkTransactionComplete>(MarkTransactionCompleteInputs {
                transaction_id: transaction_id.clone(),
                result: encoded,
            })
            .await;

        match marked {
            Ok(_) => {
                self.registry.complete(&transaction_id, result);
            }
            Err(e) => {
                match e {
                    RpcError::Canceled => {
                        tracing::info!(%transaction_id, action = %slug, "transaction canceled");
                    }
                    RpcError::TransactionClosed => tracing::info!(
                        %transaction_id,
                        action = %slug,
                        "attempted to complete transaction after it was closed"
                    ),
                    _ => tracing::warn!(%transaction_id, "failed to mark transaction complete: {e}"),
                }
                self.registry.fail(&transaction_id, e);
            }
        }
    }

    fn io_response(&self, inputs: &IoResponseInputs) {
        tracing::debug!(transaction_id = %inputs.transaction_id, "got io response");
        match serde_json::from_str::<IoResponseMessage>(&inputs.value) {
            Ok(response) => {
                self.registry.route_response(response);
            }
            Err(e) => tracing::error!(
                transaction_id = %inputs.transaction_id,
                "received invalid IO response: {e}"
            ),
        }
    }
}

fn log_sdk_alert(alert: &SdkAlert) {
    let message = alert.message.as_deref().unwrap_or("");
    match alert.severity {
        SdkAlertSeverity::Info => tracing::info!(min_sdk_version = ?alert.min_sdk_version, "{message}"),
        SdkAlertSeverity::Warning => {
            tracing::warn!(min_sdk_version = ?alert.min_sdk_version, "{message}");
        }
        SdkAlertSeverity::Error => {
            tracing::error!(min_sdk_version = ?alert.min_sdk_version, "{message}");
        }
    }
}
