//! Resilient client for the hub's real-time API.
//!
//! Provides the lifecycle-managed [`HubClient`], event fan-out across
//! reconnections, an optional TTL cache for state queries, and the
//! WebSocket transport it runs on by default.

mod auth_flow;
mod cache;
pub mod config;
pub mod error;
pub mod logger;
mod manager;
mod pumps;
mod reconnection;
pub mod subscriptions;
pub mod transport;
pub mod types;
pub mod ws_client;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{CachePolicy, ConnectionConfig, ReconnectionPolicy};
pub use error::{HubError, Result};
pub use hubwire_protocol::{HubEvent, ServiceCallResponse, StateRecord};
pub use logger::{Logger, TracingLogger};
pub use manager::{HubClient, Subscription};
pub use subscriptions::{EventHandler, SubscriptionId};
pub use transport::{
    ListenerKind, RemoteSubscription, TokenAuth, Transport, TransportError, TransportHandle,
};
pub use types::{ConnectionState, ReconnectPhase, ValidationReport};
pub use ws_client::{WsClient, WsTransport};
