//! WebSocket transport for the hub.
//!
//! Implements the request/response pattern with integer command ids,
//! ping/pong keepalive, and routing of pushed events to their subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use hubwire_protocol::constants::{
    ERR_CODE_INVALID_FORMAT, WS_AUTH_TIMEOUT, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD,
    WS_REQUEST_TIMEOUT,
};
use hubwire_protocol::envelope::{ClientMessage, ServerMessage};
use hubwire_protocol::{ServiceCallResponse, StateRecord};

use crate::pumps::read::{EventRoutes, ListenerSet, Listeners, PendingMap};
use crate::transport::{
    EventCallback, ListenerCallback, ListenerKind, RemoteSubscription, TokenAuth, Transport,
    TransportError, TransportHandle,
};

/// Opens [`WsClient`] connections.
#[derive(Debug, Clone)]
pub struct WsTransport {
    request_timeout: Duration,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self {
            request_timeout: WS_REQUEST_TIMEOUT,
        }
    }
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides how long a command waits for its reply.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Transport for WsTransport {
    type Handle = WsClient;

    async fn create_connection(&self, auth: &TokenAuth) -> Result<WsClient, TransportError> {
        WsClient::connect(auth, self.request_timeout).await
    }
}

/// One authenticated WebSocket connection to the hub.
///
/// Dropping the client stops its pumps. A `Disconnected` notification fires
/// only when the socket dies without a local [`close`](TransportHandle::close);
/// a listener registered after that has already happened fires immediately.
pub struct WsClient {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    routes: EventRoutes,
    listeners: Listeners,
    next_id: AtomicU64,
    request_timeout: Duration,
    hub_version: Option<String>,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    _ping_handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl WsClient {
    /// Connects to the hub WebSocket and authenticates.
    ///
    /// The pumps start only after `auth_ok`, so a rejected token never
    /// produces a `Disconnected` notification.
    pub async fn connect(auth: &TokenAuth, request_timeout: Duration) -> Result<Self, TransportError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(auth.url(), Some(ws_config), false)
                .await?;
        let (mut write, mut read) = ws_stream.split();

        let hub_version = tokio::time::timeout(
            WS_AUTH_TIMEOUT,
            crate::auth_flow::authenticate(&mut write, &mut read, auth.access_token()),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let routes: EventRoutes = Arc::new(StdMutex::new(HashMap::new()));
        let listeners: Listeners = Arc::new(ListenerSet::default());
        let cancel = CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel))
        };

        let read_handle = {
            let pending = pending.clone();
            let routes = routes.clone();
            let listeners = listeners.clone();
            let cancel = cancel.clone();
            let write_tx = write_tx.clone();
            tokio::spawn(crate::pumps::read::read_pump(
                read, pending, routes, listeners, write_tx, cancel,
            ))
        };

        let ping_handle = {
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::ping::ping_pump(write_tx, WS_PING_PERIOD, cancel))
        };

        debug!(url = auth.url(), hub_version = ?hub_version, "hub connection established");

        Ok(Self {
            write_tx,
            pending,
            routes,
            listeners,
            next_id: AtomicU64::new(1),
            request_timeout,
            hub_version,
            _read_handle: read_handle,
            _write_handle: write_handle,
            _ping_handle: ping_handle,
            cancel,
        })
    }

    /// Version string the hub reported during authentication.
    pub fn hub_version(&self) -> Option<&str> {
        self.hub_version.as_deref()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a command and waits for the reply carrying the same id.
    async fn request(&self, msg: ClientMessage) -> Result<ServerMessage, TransportError> {
        let Some(id) = msg.id() else {
            return Err(TransportError::Handshake(
                "auth frames cannot be sent as commands".into(),
            ));
        };
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self
            .write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::Closed);
        }

        let result = tokio::time::timeout(self.request_timeout, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => {
                if let Some(err) = &resp.error {
                    return Err(TransportError::Remote {
                        code: err.code.clone(),
                        message: err.message.clone(),
                    });
                }
                if !resp.is_success() {
                    return Err(TransportError::Remote {
                        code: ERR_CODE_INVALID_FORMAT.into(),
                        message: format!("command {id} was not successful"),
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

impl TransportHandle for WsClient {
    fn add_event_listener(&self, kind: ListenerKind, callback: ListenerCallback) {
        self.listeners.add(kind, callback);
    }

    async fn subscribe_events(
        &self,
        event_type: &str,
        callback: EventCallback,
    ) -> Result<RemoteSubscription, TransportError> {
        let id = self.next_id();
        // Route first: the hub may push events right behind its reply.
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(id, callback);
        }

        let msg = ClientMessage::SubscribeEvents {
            id,
            event_type: event_type.to_string(),
        };
        match self.request(msg).await {
            Ok(_) => Ok(RemoteSubscription(id)),
            Err(e) => {
                if let Ok(mut routes) = self.routes.lock() {
                    routes.remove(&id);
                }
                Err(e)
            }
        }
    }

    async fn unsubscribe_events(&self, subscription: RemoteSubscription) -> Result<(), TransportError> {
        if let Ok(mut routes) = self.routes.lock() {
            routes.remove(&subscription.0);
        }
        let msg = ClientMessage::UnsubscribeEvents {
            id: self.next_id(),
            subscription: subscription.0,
        };
        self.request(msg).await.map(|_| ())
    }

    async fn get_states(&self) -> Result<Vec<StateRecord>, TransportError> {
        let resp = self.request(ClientMessage::GetStates { id: self.next_id() }).await?;
        Ok(resp.parse_result::<Vec<StateRecord>>()?.unwrap_or_default())
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Option<serde_json::Value>,
    ) -> Result<ServiceCallResponse, TransportError> {
        let msg = ClientMessage::CallService {
            id: self.next_id(),
            domain: domain.to_string(),
            service: service.to_string(),
            service_data: data,
        };
        let resp = self.request(msg).await?;
        resp.parse_result::<ServiceCallResponse>()?
            .ok_or_else(|| TransportError::Remote {
                code: ERR_CODE_INVALID_FORMAT.into(),
                message: "empty call_service result".into(),
            })
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.request(ClientMessage::Ping { id: self.next_id() })
            .await
            .map(|_| ())
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Local cancel: the read pump exits without firing `Disconnected`.
        self.cancel.cancel();
        Ok(())
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
        self._ping_handle.abort();
    }
}
