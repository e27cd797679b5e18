//! Connection lifecycle: connect, keepalive and reconnect.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use hostlink_core::{ClientConfig, InstanceId, RpcError};
use hostlink_transport::{CloseEvent, Connection, Connector, Transport, TransportError};
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc, watch},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{HostRpc, state::ConnectionState};

#[derive(Debug, Clone, Copy)]
struct Timing {
    retry_interval: Duration,
    ping_interval: Duration,
    unresponsive_timeout: Duration,
}

/// Owns the socket for one session and keeps it alive.
///
/// Every socket opened by the orchestrator presents the same instance id.
/// After a reconnect the correlator is rebound to the new socket and a
/// notification is pushed to the receiver returned by [`Orchestrator::new`].
pub struct Orchestrator {
    connector: Arc<dyn Connector>,
    rpc: HostRpc,
    instance_id: InstanceId,
    timing: Timing,
    state: watch::Sender<ConnectionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// Held across a first connect so concurrent callers share one socket.
    connecting: AsyncMutex<()>,
    generation: AtomicU64,
    intentionally_closed: AtomicBool,
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
    reconnected: mpsc::UnboundedSender<u64>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        rpc: HostRpc,
        config: &ClientConfig,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<u64>) {
        let (reconnected, reconnected_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Self {
            connector,
            rpc,
            instance_id: InstanceId::new(),
            timing: Timing {
                retry_interval: config.retry_interval(),
                ping_interval: config.ping_interval(),
                unresponsive_timeout: config.unresponsive_timeout(),
            },
            state: watch::Sender::new(ConnectionState::Disconnected),
            transport: Mutex::new(None),
            connecting: AsyncMutex::new(()),
            generation: AtomicU64::new(0),
            intentionally_closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            shutdown,
            reconnected,
        });
        (orchestrator, reconnected_rx)
    }

    #[must_use]
    pub const fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "connection state changed");
        }
    }

    /// Open the first socket of the session.
    ///
    /// # Errors
    /// Returns the connect error; a session that never connected does not
    /// retry on its own.
    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        let _connecting = self.connecting.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        // Connected, or already in the keepalive/reconnect cycle.
        if self.state() != ConnectionState::Disconnected {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        match self.connector.connect(self.instance_id).await {
            Ok(connection) => {
                self.attach(connection);
                tracing::info!(instance_id = %self.instance_id, "connected");
                Ok(())
            }
            Err(e) => {
                tracing::error!(instance_id = %self.instance_id, "could not connect: {e}");
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn attach(self: &Arc<Self>, connection: Connection) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let transport = Arc::clone(&connection.transport);
        *self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&transport));

        let reader = self.rpc.bind(connection);
        self.set_state(ConnectionState::Connected);

        let keepalive = tokio::spawn(Arc::clone(self).keepalive(generation, transport));
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let close = reader.await.unwrap_or_default();
            keepalive.abort();
            this.on_close(generation, &close);
        });
    }

    async fn keepalive(self: Arc<Self>, generation: u64, transport: Arc<dyn Transport>) {
        let period = self.timing.ping_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_success = Instant::now();

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            match transport.ping().await {
                Ok(()) => last_success = Instant::now(),
                Err(e) => {
                    tracing::warn!("pong not received in time: {e}");
                    if last_success.elapsed() > self.timing.unresponsive_timeout {
                        tracing::error!(
                            "no pong received in {:?}, closing connection and retrying",
                            self.timing.unresponsive_timeout
                        );
                        self.set_state(ConnectionState::Unresponsive);
                        transport.close().await;
                        return;
                    }
                }
            }
        }
    }

    fn on_close(self: &Arc<Self>, generation: u64, close: &CloseEvent) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.rpc
            .unbind(&RpcError::Transport("connection closed".to_string()));
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if self.intentionally_closed.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
            self.set_state(ConnectionState::Closed);
            return;
        }

        tracing::error!(
            code = ?close.code,
            reason = close.reason.as_deref().unwrap_or(""),
            "connection lost"
        );
        self.start_reconnect();
    }

    fn start_reconnect(self: &Arc<Self>) {
        // One loop per session.
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("reconnecting...");
        self.set_state(ConnectionState::Reconnecting);
        tokio::spawn(Arc::clone(self).reconnect_loop());
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.connector.connect(self.instance_id).await {
                Ok(connection) => {
                    if self.shutdown.is_cancelled() {
                        connection.transport.close().await;
                        break;
                    }
                    self.reconnecting.store(false, Ordering::SeqCst);
                    self.attach(connection);
                    let generation = self.generation.load(Ordering::SeqCst);
                    tracing::info!(instance_id = %self.instance_id, "reconnection successful");
                    let _ = self.reconnected.send(generation);
                    return;
                }
                Err(e) => {
                    tracing::info!(
                        "unable to connect ({e}), retrying in {}s...",
                        self.timing.retry_interval.as_secs()
                    );
                }
            }
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(self.timing.retry_interval) => {}
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
        if self.shutdown.is_cancelled() {
            self.set_state(ConnectionState::Closed);
        }
    }

    /// Close the session for good. Idempotent.
    pub async fn close(&self) {
        self.intentionally_closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        let transport = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.rpc.unbind(&RpcError::NotConnected);
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.set_state(ConnectionState::Closed);
    }
}
