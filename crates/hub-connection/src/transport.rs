//! Seam between the client core and the wire transport.
//!
//! The core never frames messages or performs the auth handshake itself; it
//! talks to a [`Transport`] that hands out [`TransportHandle`]s. The default
//! implementation is [`WsTransport`](crate::ws_client::WsTransport).

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio_tungstenite::tungstenite;

use hubwire_protocol::{HubEvent, ServiceCallResponse, StateRecord};

/// Lowercase fragments that mark a transport error as a credential rejection.
pub const AUTH_FAILURE_SIGNATURES: &[&str] = &[
    "auth_invalid",
    "invalid access token",
    "invalid password",
    "unauthorized",
    "401",
    "authentication rejected",
];

/// Errors reported by a transport or one of its handles.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("authentication rejected: {0}")]
    AuthInvalid(String),

    #[error("unexpected handshake message: {0}")]
    Handshake(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("hub error {code}: {message}")]
    Remote { code: String, message: String },
}

impl TransportError {
    /// Returns `true` if the remote end rejected the credentials.
    ///
    /// Besides the typed [`TransportError::AuthInvalid`] variant, the error
    /// text is checked against [`AUTH_FAILURE_SIGNATURES`] so that rejections
    /// surfacing as HTTP upgrade failures (401) are recognised too.
    pub fn is_auth_failure(&self) -> bool {
        if matches!(self, TransportError::AuthInvalid(_)) {
            return true;
        }
        let text = self.to_string().to_lowercase();
        AUTH_FAILURE_SIGNATURES.iter().any(|sig| text.contains(sig))
    }
}

/// Credentials for one hub endpoint (`createTokenAuth`).
#[derive(Clone, PartialEq, Eq)]
pub struct TokenAuth {
    url: String,
    access_token: String,
}

impl TokenAuth {
    pub fn new(url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_token: access_token.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuth")
            .field("url", &self.url)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Low-level notifications a handle reports about its own socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// The connection dropped without a local `close()`.
    Disconnected,
    /// The connection recovered in place after a `Disconnected`.
    Ready,
}

/// Identifier of one remote event subscription on a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteSubscription(pub u64);

/// Callback receiving events for one remote subscription.
pub type EventCallback = Arc<dyn Fn(HubEvent) + Send + Sync>;

/// Callback for [`ListenerKind`] notifications.
pub type ListenerCallback = Arc<dyn Fn() + Send + Sync>;

/// Opens authenticated connections to a hub (`createConnection`).
pub trait Transport: Send + Sync + 'static {
    type Handle: TransportHandle;

    fn create_connection(
        &self,
        auth: &TokenAuth,
    ) -> impl Future<Output = Result<Self::Handle, TransportError>> + Send;
}

/// One live, authenticated connection.
pub trait TransportHandle: Send + Sync + 'static {
    /// Registers a callback for a lifecycle notification.
    ///
    /// A `Disconnected` listener added after the connection has already
    /// dropped must be invoked right away; the client registers its
    /// listeners only once `create_connection` has returned.
    fn add_event_listener(&self, kind: ListenerKind, callback: ListenerCallback);

    /// Opens a remote subscription for `event_type`. Events may be delivered
    /// to `callback` as soon as the hub acknowledges the subscription.
    fn subscribe_events(
        &self,
        event_type: &str,
        callback: EventCallback,
    ) -> impl Future<Output = Result<RemoteSubscription, TransportError>> + Send;

    /// Closes a remote subscription. Delivery stops before the round trip.
    fn unsubscribe_events(
        &self,
        subscription: RemoteSubscription,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn get_states(&self) -> impl Future<Output = Result<Vec<StateRecord>, TransportError>> + Send;

    fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Option<serde_json::Value>,
    ) -> impl Future<Output = Result<ServiceCallResponse, TransportError>> + Send;

    /// Lightweight no-op round trip.
    fn ping(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
