//! Loopback coordination server (feature: server).
//!
//! A minimal WebSocket endpoint speaking the envelope protocol. Each
//! accepted host socket is handed to the caller as a [`RemoteSocket`], which
//! can read the host's calls, reply, call host methods and hang up.

use std::{io, net::SocketAddr};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use hostlink_core::{
    Envelope, RemoteError,
    ids::{CorrelationId, next_correlation_id},
};
use serde_json::Value;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tower_http::trace::TraceLayer;

enum Outbound {
    Envelope(Envelope),
    Close { code: u16, reason: String },
}

#[derive(Clone)]
struct ServerState {
    accepted: mpsc::UnboundedSender<RemoteSocket>,
}

/// A bound loopback server.
pub struct LoopbackServer {
    addr: SocketAddr,
    accepted: mpsc::UnboundedReceiver<RemoteSocket>,
    task: JoinHandle<()>,
}

impl LoopbackServer {
    /// Bind to an ephemeral localhost port and start serving.
    ///
    /// # Errors
    /// Returns error if the listener cannot be bound.
    pub async fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        let (accepted, accepted_rx) = mpsc::unbounded_channel();

        let app = create_router(ServerState { accepted });
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("loopback server stopped: {e}");
            }
        });
        tracing::debug!("loopback server listening on {addr}");

        Ok(Self {
            addr,
            accepted: accepted_rx,
            task,
        })
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// WebSocket URL hosts should connect to.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("ws://{}/websocket", self.addr)
    }

    /// Wait for the next host socket.
    pub async fn accept(&mut self) -> Option<RemoteSocket> {
        self.accepted.recv().await
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/websocket", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    let instance_id = header_value(&headers, "x-instance-id");
    let api_key = header_value(&headers, "x-api-key");
    ws.on_upgrade(move |socket| handle_socket(socket, state, instance_id, api_key))
}

async fn handle_socket(
    socket: WebSocket,
    state: ServerState,
    instance_id: Option<String>,
    api_key: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (incoming_tx, incoming) = mpsc::unbounded_channel::<Envelope>();
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Outbound>();

    let remote = RemoteSocket {
        instance_id,
        api_key,
        incoming,
        outgoing,
    };
    if state.accepted.send(remote).is_err() {
        return;
    }

    // Forward outbound frames to the host
    let send_task = tokio::spawn(async move {
        while let Some(out) = outgoing_rx.recv().await {
            let msg = match out {
                Outbound::Envelope(envelope) => match envelope.encode() {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {e}");
                        continue;
                    }
                },
                Outbound::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("WebSocket error: {e}");
                break;
            }
        };

        match Envelope::decode(&text) {
            Ok(envelope) => {
                if incoming_tx.send(envelope).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!("Invalid host message: {e}"),
        }
    }

    send_task.abort();
}

/// The server's view of one host socket.
pub struct RemoteSocket {
    pub instance_id: Option<String>,
    pub api_key: Option<String>,
    incoming: mpsc::UnboundedReceiver<Envelope>,
    outgoing: mpsc::UnboundedSender<Outbound>,
}

impl RemoteSocket {
    /// Next envelope written by the host; `None` once the socket is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.incoming.recv().await
    }

    pub fn send(&self, envelope: Envelope) -> bool {
        self.outgoing.send(Outbound::Envelope(envelope)).is_ok()
    }

    /// Call a host method; returns the correlation id used.
    pub fn call(&self, method: &str, payload: Value) -> CorrelationId {
        let id = next_correlation_id();
        self.send(Envelope::call(id.clone(), method, payload));
        id
    }

    pub fn reply_ok(&self, call: &Envelope, result: Value) -> bool {
        self.send(Envelope::success(call.id().to_owned(), call.method(), result))
    }

    pub fn reply_err(&self, call: &Envelope, error: RemoteError) -> bool {
        self.send(Envelope::failure(call.id().to_owned(), call.method(), error))
    }

    /// Send a close frame and stop serving this socket.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.outgoing
            .send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }
}
