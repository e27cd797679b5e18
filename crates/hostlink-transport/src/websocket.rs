//! WebSocket client transport.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use hostlink_core::{ClientConfig, InstanceId};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Message, client::IntoClientRequest, http::HeaderValue},
};
use uuid::Uuid;

use crate::transport::{CloseEvent, Connection, Connector, EventSink, Transport, TransportError};

const INSTANCE_ID_HEADER: &str = "x-instance-id";
const API_KEY_HEADER: &str = "x-api-key";

type PendingPongs = Arc<Mutex<HashMap<Vec<u8>, oneshot::Sender<()>>>>;

/// Opens WebSocket connections to the coordination service.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: String,
    api_key: Option<String>,
    ping_timeout: Duration,
}

impl WsConnector {
    /// Create a connector for `endpoint`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, ping_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            ping_timeout,
        }
    }

    /// Build a connector from client configuration.
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            ping_timeout: config.ping_timeout(),
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

fn header(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value).map_err(|e| TransportError::Connect(format!("invalid header: {e}")))
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, instance_id: InstanceId) -> Result<Connection, TransportError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(INSTANCE_ID_HEADER, header(&instance_id.to_string())?);
        if let Some(api_key) = &self.api_key {
            headers.insert(API_KEY_HEADER, header(api_key)?);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(endpoint = %self.endpoint, %instance_id, "socket opened");

        let (mut sink, mut stream) = stream.split();
        let (events, events_rx) = EventSink::channel();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let pongs: PendingPongs = Arc::default();

        let writer_events = events.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!("WebSocket write failed: {e}");
                    writer_events.close(CloseEvent {
                        code: None,
                        reason: Some(e.to_string()),
                    });
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_events = events.clone();
        let reader_pongs = Arc::clone(&pongs);
        let reader = tokio::spawn(async move {
            let event = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        reader_events.message(text.as_str().to_owned());
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            reader_events.message(text);
                        }
                        Err(_) => tracing::warn!("dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Pong(payload))) => {
                        let waiter = reader_pongs
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(payload.as_ref());
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(CloseEvent::default, |frame| CloseEvent {
                            code: Some(u16::from(frame.code)),
                            reason: Some(frame.reason.as_str().to_owned()),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket read failed: {e}");
                        break CloseEvent {
                            code: None,
                            reason: Some(e.to_string()),
                        };
                    }
                    None => break CloseEvent::default(),
                }
            };
            reader_events.close(event);
        });

        let transport = WsTransport {
            outgoing,
            pongs,
            events,
            ping_timeout: self.ping_timeout,
            writer,
            reader,
        };

        Ok(Connection {
            transport: Arc::new(transport),
            events: events_rx,
        })
    }
}

/// One open WebSocket.
pub struct WsTransport {
    outgoing: mpsc::UnboundedSender<Message>,
    pongs: PendingPongs,
    events: EventSink,
    ping_timeout: Duration,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        if self.events.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outgoing
            .send(Message::Text(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        if self.events.is_closed() {
            return Err(TransportError::Closed);
        }
        let payload = Uuid::new_v4().as_bytes().to_vec();
        let (tx, rx) = oneshot::channel();
        self.pongs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(payload.clone(), tx);

        if self.outgoing.send(Message::Ping(payload.clone().into())).is_err() {
            self.pongs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&payload);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.ping_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_elapsed) => {
                self.pongs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&payload);
                Err(TransportError::PingTimeout(self.ping_timeout))
            }
        }
    }

    async fn close(&self) {
        if self.events.is_closed() {
            return;
        }
        let _ = self.outgoing.send(Message::Close(None));
        self.events.close(CloseEvent::new(1000, "closed by host"));
        // The writer drains the close frame on its own.
        self.reader.abort();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
