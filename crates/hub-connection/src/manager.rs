//! Connection lifecycle manager.
//!
//! [`HubClient`] owns the single transport handle, runs connect/disconnect,
//! and wires the subscription table, the state cache and the reconnection
//! controller together.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

use hubwire_protocol::{HubEvent, ServiceCallResponse, StateRecord};

use crate::cache::{Lookup, StateCache};
use crate::config::{ConnectionConfig, ReconnectionPolicy};
use crate::error::{HubError, Result};
use crate::logger::LogSink;
use crate::reconnection::{cancel_reconnect, start_reconnect};
use crate::subscriptions::{RemoteSlot, SubscriptionId, SubscriptionTable};
use crate::transport::{ListenerKind, TokenAuth, Transport, TransportError, TransportHandle};
use crate::types::{ConnectionState, ReconnectPhase, ValidationReport};
use crate::ws_client::WsTransport;

/// The live handle and the connection generation it belongs to.
pub(crate) struct LiveHandle<H> {
    pub(crate) handle: Arc<H>,
    pub(crate) generation: u64,
}

/// State shared by the client, its listeners and the reconnect loop.
pub(crate) struct ClientInner<T: Transport> {
    pub(crate) config: ConnectionConfig,
    pub(crate) auth: TokenAuth,
    pub(crate) transport: T,
    pub(crate) log: LogSink,
    pub(crate) policy: ReconnectionPolicy,
    pub(crate) state: watch::Sender<ConnectionState>,
    /// Set only while connected (or while a connect is completing).
    pub(crate) live: StdMutex<Option<LiveHandle<T::Handle>>>,
    /// The lost handle, parked so a `Ready` on it can still recover. Closed
    /// by the next successful connect or by `disconnect()`.
    pub(crate) dormant: StdMutex<Option<LiveHandle<T::Handle>>>,
    pub(crate) generation: AtomicU64,
    pub(crate) subscriptions: Arc<SubscriptionTable>,
    pub(crate) cache: StateCache,
    /// Set by `disconnect()`; suppresses reconnection.
    pub(crate) manual_close: AtomicBool,
    /// Consecutive failed reconnection attempts.
    pub(crate) attempts: AtomicU32,
    pub(crate) phase: StdMutex<ReconnectPhase>,
    /// Cancel token of the running reconnect loop, tagged with its id.
    pub(crate) reconnect_cancel: StdMutex<Option<(u64, tokio_util::sync::CancellationToken)>>,
    pub(crate) next_loop_id: AtomicU64,
    /// Serializes connect, disconnect, reconnect attempts, loss/ready
    /// handling and remote subscription changes.
    pub(crate) lifecycle: Mutex<()>,
}

/// Client for one hub endpoint.
///
/// Cheap to clone; clones share the same connection.
pub struct HubClient<T: Transport = WsTransport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: Transport> Clone for HubClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl HubClient<WsTransport> {
    /// Creates a client using the WebSocket transport.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_transport(config, WsTransport::default())
    }
}

impl<T: Transport> HubClient<T> {
    /// Creates a client on top of a custom transport.
    pub fn with_transport(config: ConnectionConfig, transport: T) -> Self {
        let log = LogSink::new(config.logger.clone(), config.debug);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = ClientInner {
            auth: TokenAuth::new(config.url.clone(), config.token.clone()),
            policy: config.reconnection_policy(),
            cache: StateCache::new(config.cache_policy()),
            subscriptions: Arc::new(SubscriptionTable::new(log.clone())),
            transport,
            log,
            state,
            live: StdMutex::new(None),
            dormant: StdMutex::new(None),
            generation: AtomicU64::new(0),
            manual_close: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            phase: StdMutex::new(ReconnectPhase::Idle),
            reconnect_cancel: StdMutex::new(None),
            next_loop_id: AtomicU64::new(0),
            lifecycle: Mutex::new(()),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Opens and authenticates the connection.
    ///
    /// Fails with [`HubError::AlreadyConnected`] while connected or
    /// connecting, without touching the current connection.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.connection_state() != ConnectionState::Disconnected {
            return Err(HubError::AlreadyConnected);
        }

        // A manual connect supersedes any scheduled reconnection.
        cancel_reconnect(inner);
        let _guard = inner.lifecycle.lock().await;

        let claimed = inner.state.send_if_modified(|s| {
            if *s == ConnectionState::Disconnected {
                *s = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(HubError::AlreadyConnected);
        }
        inner.manual_close.store(false, Ordering::Release);
        inner.set_phase(ReconnectPhase::Idle);
        inner.log.debug(format!("connecting to {}", inner.config.url));

        match establish(inner).await {
            Ok(()) => {
                inner.log.info(format!("connected to {}", inner.config.url));
                Ok(())
            }
            Err(e) => {
                inner.state.send_replace(ConnectionState::Disconnected);
                let err = HubError::from_connect(&inner.config.url, e);
                if err.is_auth_failure() {
                    inner.log.error(format!("authentication failed: {err}"));
                } else {
                    inner.log.warn(format!("connection failed: {err}"));
                }
                Err(err)
            }
        }
    }

    /// Closes the connection and forgets all subscriptions and cached
    /// state. Never fails; a no-op when already disconnected.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.manual_close.store(true, Ordering::Release);
        cancel_reconnect(inner);
        let _guard = inner.lifecycle.lock().await;

        let live = inner.take_live();
        let dormant = inner.take_dormant();
        let had_handle = live.is_some();
        for parked in live.into_iter().chain(dormant) {
            if let Err(e) = parked.handle.close().await {
                inner.log.debug(format!("error while closing connection: {e}"));
            }
        }

        inner.cache.clear();
        inner.subscriptions.clear();
        inner.set_phase(ReconnectPhase::Idle);
        let previous = inner.state.send_replace(ConnectionState::Disconnected);
        if had_handle || previous != ConnectionState::Disconnected {
            inner.log.info("disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection_state() == ConnectionState::Connected
    }

    /// Measures a no-op round trip. Never changes connection state.
    pub async fn validate_connection(&self) -> ValidationReport {
        let Ok((handle, _)) = self.inner.connected_handle() else {
            return ValidationReport {
                success: false,
                message: "not connected".into(),
                latency_ms: None,
            };
        };

        let started = Instant::now();
        match handle.ping().await {
            Ok(()) => ValidationReport {
                success: true,
                message: "connection is healthy".into(),
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(e) => ValidationReport {
                success: false,
                message: format!("validation failed: {e}"),
                latency_ms: None,
            },
        }
    }

    /// Registers `handler` for `event_type`.
    ///
    /// The first handler of a type opens the remote stream; later ones share
    /// it. The registration survives reconnection.
    pub async fn subscribe_to_events<F>(&self, event_type: &str, handler: F) -> Result<Subscription<T>>
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        if event_type.trim().is_empty() {
            return Err(HubError::InvalidParameter("event type must not be empty".into()));
        }
        let inner = &self.inner;
        inner.connected_handle()?;

        let _guard = inner.lifecycle.lock().await;
        let (handle, generation) = inner.connected_handle()?;

        let (id, open_epoch) = inner.subscriptions.add(event_type, Arc::new(handler));
        if let Some(epoch) = open_epoch {
            let callback = inner.subscriptions.dispatcher(event_type, epoch);
            match handle.subscribe_events(event_type, callback).await {
                Ok(remote) => {
                    let slot = RemoteSlot {
                        generation,
                        subscription: remote,
                    };
                    if let Some(stale) = inner.subscriptions.attach_remote(event_type, epoch, slot) {
                        inner.release_remote(stale).await;
                    }
                }
                Err(e) => {
                    inner.subscriptions.remove(id);
                    return Err(HubError::Subscription {
                        event_type: event_type.to_string(),
                        original_error: e,
                    });
                }
            }
        }

        inner.log.debug(format!(
            "subscribed to '{event_type}' ({} handler(s))",
            inner.subscriptions.count(event_type)
        ));
        Ok(Subscription {
            id,
            event_type: event_type.to_string(),
            client: Arc::downgrade(&self.inner),
        })
    }

    /// Removes every handler for `event_type`. A no-op if there are none.
    pub async fn unsubscribe_from_events(&self, event_type: &str) {
        let inner = &self.inner;
        let (removed, remote) = inner.subscriptions.remove_type(event_type);
        if removed > 0 {
            inner
                .log
                .debug(format!("unsubscribed {removed} handler(s) from '{event_type}'"));
        }
        if let Some(remote) = remote {
            let _guard = inner.lifecycle.lock().await;
            inner.release_remote(remote).await;
        }
    }

    /// One entity's state. Fails with [`HubError::EntityNotFound`] if the
    /// hub does not know it.
    pub async fn get_state(&self, entity_id: &str) -> Result<StateRecord> {
        if entity_id.trim().is_empty() {
            return Err(HubError::InvalidParameter("entity id must not be empty".into()));
        }
        let inner = &self.inner;
        let (handle, _) = inner.connected_handle()?;
        inner.cache.purge_expired();

        let lookup = inner
            .cache
            .state(entity_id, || handle.get_states())
            .await
            .map_err(|e| inner.query_error(e))?;
        match lookup {
            Lookup::Found(state) => Ok(state),
            Lookup::Missing => Err(HubError::EntityNotFound(entity_id.to_string())),
        }
    }

    /// Every entity's state.
    pub async fn get_all_states(&self) -> Result<Vec<StateRecord>> {
        let inner = &self.inner;
        let (handle, _) = inner.connected_handle()?;
        inner.cache.purge_expired();

        inner
            .cache
            .all_states(|| handle.get_states())
            .await
            .map_err(|e| inner.query_error(e))
    }

    /// Calls `domain.service` with optional service data.
    ///
    /// `domain` and `service` are checked before anything is sent.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Option<serde_json::Value>,
    ) -> Result<ServiceCallResponse> {
        let domain = domain.trim();
        let service = service.trim();
        if domain.is_empty() {
            return Err(HubError::InvalidParameter("domain must not be empty".into()));
        }
        if service.is_empty() {
            return Err(HubError::InvalidParameter("service must not be empty".into()));
        }

        let inner = &self.inner;
        let (handle, _) = inner.connected_handle()?;
        inner.log.debug(format!("calling {domain}.{service}"));

        handle
            .call_service(domain, service, data)
            .await
            .map_err(|e| HubError::ServiceCall {
                domain: domain.to_string(),
                service: service.to_string(),
                original_error: e,
            })
    }

    /// Watch channel following [`ConnectionState`] changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    pub fn reconnect_phase(&self) -> ReconnectPhase {
        self.inner.phase()
    }

    /// Consecutive failed reconnection attempts since the last success.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    /// Event types with at least one handler, sorted.
    pub fn subscribed_event_types(&self) -> Vec<String> {
        self.inner.subscriptions.event_types()
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner.subscriptions.count(event_type)
    }
}

/// A single registered handler. Dropping it keeps the registration;
/// call [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription<T: Transport = WsTransport> {
    id: SubscriptionId,
    event_type: String,
    client: Weak<ClientInner<T>>,
}

impl<T: Transport> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Removes this handler only. Siblings on the same event type keep
    /// receiving; the remote stream closes with the last handler.
    pub async fn unsubscribe(&self) {
        let Some(inner) = self.client.upgrade() else {
            return;
        };
        let Some((event_type, remote)) = inner.subscriptions.remove(self.id) else {
            return;
        };
        inner.log.debug(format!("unsubscribed one handler from '{event_type}'"));
        if let Some(remote) = remote {
            let _guard = inner.lifecycle.lock().await;
            inner.release_remote(remote).await;
        }
    }
}

impl<T: Transport> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .finish()
    }
}

impl<T: Transport> ClientInner<T> {
    pub(crate) fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn phase(&self) -> ReconnectPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_phase(&self, phase: ReconnectPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    fn live_handle(&self) -> Option<(Arc<T::Handle>, u64)> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|l| (l.handle.clone(), l.generation))
    }

    fn take_live(&self) -> Option<LiveHandle<T::Handle>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn take_dormant(&self) -> Option<LiveHandle<T::Handle>> {
        self.dormant.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Moves the live handle aside after a loss.
    fn park_live(&self) {
        let live = self.take_live();
        *self.dormant.lock().unwrap_or_else(PoisonError::into_inner) = live;
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The handle, if and only if the client is connected.
    fn connected_handle(&self) -> Result<(Arc<T::Handle>, u64)> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(HubError::NotConnected);
        }
        self.live_handle().ok_or(HubError::NotConnected)
    }

    fn query_error(&self, err: TransportError) -> HubError {
        HubError::Connection {
            url: self.config.url.clone(),
            original_error: err,
        }
    }

    /// Closes a remote stream if it lives on the current connection, live or
    /// parked. Streams on an older connection died with it.
    async fn release_remote(&self, slot: RemoteSlot) {
        let parked = self
            .dormant
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|l| (l.handle.clone(), l.generation));
        let Some((handle, generation)) = self.live_handle().or(parked) else {
            return;
        };
        if generation != slot.generation {
            return;
        }
        if let Err(e) = handle.unsubscribe_events(slot.subscription).await {
            self.log
                .debug(format!("failed to close remote subscription: {e}"));
        }
    }
}

/// Creates a fresh connection, restores subscriptions on it and marks the
/// client connected. The caller holds the lifecycle lock.
pub(crate) async fn establish<T: Transport>(inner: &Arc<ClientInner<T>>) -> std::result::Result<(), TransportError> {
    let handle = Arc::new(inner.transport.create_connection(&inner.auth).await?);
    let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
    register_listeners(inner, &handle, generation);

    let previous = inner
        .live
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(LiveHandle {
            handle: handle.clone(),
            generation,
        });
    for previous in previous.into_iter().chain(inner.take_dormant()) {
        if let Err(e) = previous.handle.close().await {
            inner
                .log
                .debug(format!("error while closing previous connection: {e}"));
        }
    }

    rearm_subscriptions(inner, &handle, generation).await;

    inner.attempts.store(0, Ordering::Release);
    inner.set_phase(ReconnectPhase::Idle);
    inner.state.send_replace(ConnectionState::Connected);
    Ok(())
}

/// Hooks the handle's lifecycle notifications up to the client.
fn register_listeners<T: Transport>(inner: &Arc<ClientInner<T>>, handle: &T::Handle, generation: u64) {
    let weak = Arc::downgrade(inner);
    handle.add_event_listener(
        ListenerKind::Disconnected,
        Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(handle_connection_lost(inner, generation));
            }
        }),
    );

    let weak = Arc::downgrade(inner);
    handle.add_event_listener(
        ListenerKind::Ready,
        Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(handle_ready(inner, generation));
            }
        }),
    );
}

/// Reopens every registered event type on `handle`. Failures are logged and
/// leave that type without a remote stream until the next reconnection.
async fn rearm_subscriptions<T: Transport>(inner: &Arc<ClientInner<T>>, handle: &T::Handle, generation: u64) {
    for rearm in inner.subscriptions.begin_rearm(generation) {
        let callback = inner.subscriptions.dispatcher(&rearm.event_type, rearm.epoch);
        match handle.subscribe_events(&rearm.event_type, callback).await {
            Ok(remote) => {
                let slot = RemoteSlot {
                    generation,
                    subscription: remote,
                };
                if let Some(stale) = inner
                    .subscriptions
                    .attach_remote(&rearm.event_type, rearm.epoch, slot)
                    && stale.generation == generation
                    && let Err(e) = handle.unsubscribe_events(stale.subscription).await
                {
                    inner
                        .log
                        .debug(format!("failed to close superseded subscription: {e}"));
                }
                inner
                    .log
                    .debug(format!("restored subscription to '{}'", rearm.event_type));
            }
            Err(e) => inner.log.warn(format!(
                "failed to restore subscription to '{}': {e}",
                rearm.event_type
            )),
        }
    }
}

/// The transport reported that connection `generation` dropped.
async fn handle_connection_lost<T: Transport>(inner: Arc<ClientInner<T>>, generation: u64) {
    let _guard = inner.lifecycle.lock().await;
    if inner.current_generation() != generation
        || inner.connection_state() != ConnectionState::Connected
        || inner.manual_close.load(Ordering::Acquire)
    {
        return;
    }

    inner.cache.clear();
    inner.park_live();
    inner.state.send_replace(ConnectionState::Disconnected);
    inner.log.warn(format!("connection lost: {}", inner.config.url));

    if !inner.policy.enabled {
        inner.log.warn("auto-reconnection is disabled, staying disconnected");
        return;
    }
    start_reconnect(&inner);
}

/// The transport reported that connection `generation` recovered in place.
async fn handle_ready<T: Transport>(inner: Arc<ClientInner<T>>, generation: u64) {
    let _guard = inner.lifecycle.lock().await;
    if inner.current_generation() != generation || inner.manual_close.load(Ordering::Acquire) {
        return;
    }
    if inner.connection_state() != ConnectionState::Disconnected {
        inner.log.debug("ready notification while not disconnected, ignoring");
        return;
    }
    let Some(parked) = inner.take_dormant() else {
        return;
    };
    let handle = parked.handle.clone();
    *inner.live.lock().unwrap_or_else(PoisonError::into_inner) = Some(parked);

    cancel_reconnect(&inner);
    rearm_subscriptions(&inner, &handle, generation).await;
    inner.attempts.store(0, Ordering::Release);
    inner.set_phase(ReconnectPhase::Idle);
    inner.state.send_replace(ConnectionState::Connected);
    inner.log.info("reconnection successful");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CachePolicy;
    use crate::testing::{
        Connect, FakeHub, FakeTransport, Level, RecordingLogger, record, wait_for_state,
    };
    use std::time::Duration;

    fn client_with(
        hub: &Arc<FakeHub>,
        tweak: impl FnOnce(ConnectionConfig) -> ConnectionConfig,
    ) -> (HubClient<FakeTransport>, Arc<RecordingLogger>) {
        let recorder = Arc::new(RecordingLogger::default());
        let config = ConnectionConfig::new("ws://hub.test:8123/api/websocket", "token")
            .with_logger(recorder.clone());
        let client = HubClient::with_transport(tweak(config), FakeTransport::new(hub));
        (client, recorder)
    }

    fn client(hub: &Arc<FakeHub>) -> (HubClient<FakeTransport>, Arc<RecordingLogger>) {
        client_with(hub, |c| c)
    }

    fn collector() -> (Arc<StdMutex<Vec<String>>>, impl Fn(&HubEvent) + Send + Sync + 'static) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        (seen, move |event: &HubEvent| {
            s.lock().unwrap().push(event.event_type.clone());
        })
    }

    fn state_changed() -> HubEvent {
        HubEvent::new(
            "state_changed",
            serde_json::json!({"entity_id": "light.kitchen"}),
        )
    }

    // --- lifecycle ---

    #[tokio::test]
    async fn connect_then_disconnect_tracks_state() {
        let hub = FakeHub::new();
        let (client, log) = client(&hub);

        assert!(!client.is_connected());
        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert!(log.contains(Level::Info, "connected to ws://hub.test:8123/api/websocket"));

        client.disconnect().await;
        assert!(!client.is_connected());
        assert_eq!(hub.close_calls(), 1);

        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(hub.connect_count(), 2);
    }

    #[tokio::test]
    async fn second_connect_fails_without_side_effects() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        client.connect().await.unwrap();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, HubError::AlreadyConnected));
        assert!(client.is_connected());
        assert_eq!(hub.connect_count(), 1);
        assert_eq!(hub.close_calls(), 0);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_swallows_close_errors() {
        let hub = FakeHub::new();
        let (client, log) = client(&hub);

        client.disconnect().await;
        assert_eq!(log.count("disconnected"), 0);

        hub.fail_close();
        client.connect().await.unwrap();
        client.disconnect().await;
        client.disconnect().await;

        assert!(!client.is_connected());
        assert_eq!(log.count("disconnected"), 1);
    }

    #[tokio::test]
    async fn auth_rejection_is_typed_and_not_retried() {
        let hub = FakeHub::new();
        hub.script([Connect::Rejected]);
        let (client, log) = client(&hub);

        let err = client.connect().await.unwrap_err();
        assert!(err.is_auth_failure());
        assert!(err.to_string().contains("Invalid access token"));
        assert!(!client.is_connected());
        assert!(log.contains(Level::Error, "authentication failed"));
        assert_eq!(client.reconnect_phase(), ReconnectPhase::Idle);
        assert_eq!(hub.connect_count(), 1);
    }

    #[tokio::test]
    async fn network_failure_on_connect_carries_url() {
        let hub = FakeHub::new();
        hub.script([Connect::Refused]);
        let (client, _) = client(&hub);

        let err = client.connect().await.unwrap_err();
        match &err {
            HubError::Connection { url, .. } => {
                assert_eq!(url, "ws://hub.test:8123/api/websocket")
            }
            other => panic!("expected connection error, got {other:?}"),
        }
        assert!(err.to_string().contains("connection closed"));
        assert!(err.is_retryable());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);

        assert!(matches!(
            client.get_all_states().await,
            Err(HubError::NotConnected)
        ));
        assert!(matches!(
            client.get_state("light.kitchen").await,
            Err(HubError::NotConnected)
        ));
        assert!(matches!(
            client.call_service("light", "turn_on", None).await,
            Err(HubError::NotConnected)
        ));
        assert!(matches!(
            client.subscribe_to_events("state_changed", |_| {}).await,
            Err(HubError::NotConnected)
        ));

        let report = client.validate_connection().await;
        assert!(!report.success);
        assert!(report.latency_ms.is_none());
    }

    #[tokio::test]
    async fn validate_connection_measures_latency() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        client.connect().await.unwrap();

        let report = client.validate_connection().await;
        assert!(report.success);
        assert!(report.latency_ms.is_some());
        assert!(client.is_connected());
    }

    // --- service calls ---

    #[tokio::test]
    async fn call_service_validates_before_network() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        client.connect().await.unwrap();

        let data = Some(serde_json::json!({}));
        assert!(matches!(
            client.call_service("", "x", data.clone()).await,
            Err(HubError::InvalidParameter(_))
        ));
        assert!(matches!(
            client.call_service("light", "  ", data).await,
            Err(HubError::InvalidParameter(_))
        ));
        assert!(hub.service_calls().is_empty());
    }

    #[tokio::test]
    async fn call_service_validation_precedes_connection_check() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        assert!(matches!(
            client.call_service("", "turn_on", None).await,
            Err(HubError::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn call_service_forwards_and_wraps_errors() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        client.connect().await.unwrap();

        let resp = client
            .call_service("light", "turn_on", Some(serde_json::json!({"entity_id": "light.kitchen"})))
            .await
            .unwrap();
        assert_eq!(resp.context.id, "ctx-1");

        let err = client
            .call_service("missing", "noop", None)
            .await
            .unwrap_err();
        match &err {
            HubError::ServiceCall {
                domain, service, ..
            } => {
                assert_eq!(domain, "missing");
                assert_eq!(service, "noop");
            }
            other => panic!("expected service call error, got {other:?}"),
        }
        assert!(err.to_string().contains("Service not found."));
        assert!(client.is_connected());
    }

    // --- subscriptions ---

    #[tokio::test]
    async fn handlers_share_one_remote_stream() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        client.connect().await.unwrap();

        let (seen_a, a) = collector();
        let (seen_b, b) = collector();
        client.subscribe_to_events("state_changed", a).await.unwrap();
        client.subscribe_to_events("state_changed", b).await.unwrap();

        assert_eq!(hub.subscribe_calls(), vec!["state_changed".to_string()]);
        assert_eq!(client.subscriber_count("state_changed"), 2);

        hub.emit(state_changed());
        assert_eq!(seen_a.lock().unwrap().len(), 1);
        assert_eq!(seen_b.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_one_leaves_siblings() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        client.connect().await.unwrap();

        let (seen_a, a) = collector();
        let (seen_b, b) = collector();
        let sub_a = client.subscribe_to_events("state_changed", a).await.unwrap();
        client.subscribe_to_events("state_changed", b).await.unwrap();

        hub.emit(state_changed());
        sub_a.unsubscribe().await;
        hub.emit(state_changed());
        hub.emit(state_changed());

        assert_eq!(seen_a.lock().unwrap().len(), 1);
        assert_eq!(seen_b.lock().unwrap().len(), 3);
        assert_eq!(hub.open_remotes(), 1);

        // Calling it again is harmless.
        sub_a.unsubscribe().await;
        assert_eq!(client.subscriber_count("state_changed"), 1);
    }

    #[tokio::test]
    async fn last_unsubscribe_closes_remote_stream() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        client.connect().await.unwrap();

        let sub = client
            .subscribe_to_events("state_changed", |_| {})
            .await
            .unwrap();
        assert_eq!(sub.event_type(), "state_changed");
        assert_eq!(hub.open_remotes(), 1);

        sub.unsubscribe().await;
        assert_eq!(hub.open_remotes(), 0);
        assert_eq!(hub.unsubscribe_calls(), 1);
        assert!(client.subscribed_event_types().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_from_events_is_bulk_and_tolerant() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        client.connect().await.unwrap();

        let (seen_a, a) = collector();
        let (seen_c, c) = collector();
        client.subscribe_to_events("state_changed", a).await.unwrap();
        client.subscribe_to_events("state_changed", |_| {}).await.unwrap();
        client.subscribe_to_events("call_service", c).await.unwrap();

        client.unsubscribe_from_events("state_changed").await;
        client.unsubscribe_from_events("never_subscribed").await;

        hub.emit(state_changed());
        hub.emit(HubEvent::new("call_service", serde_json::json!({})));

        assert!(seen_a.lock().unwrap().is_empty());
        assert_eq!(seen_c.lock().unwrap().len(), 1);
        assert_eq!(client.subscribed_event_types(), vec!["call_service".to_string()]);
    }

    #[tokio::test]
    async fn failed_subscribe_is_typed_and_leaves_nothing_behind() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        client.connect().await.unwrap();
        hub.fail_next_subscribes(1);

        let err = client
            .subscribe_to_events("state_changed", |_| {})
            .await
            .unwrap_err();
        match &err {
            HubError::Subscription { event_type, .. } => assert_eq!(event_type, "state_changed"),
            other => panic!("expected subscription error, got {other:?}"),
        }
        assert!(err.to_string().contains("subscription refused"));
        assert_eq!(client.subscriber_count("state_changed"), 0);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn empty_event_type_is_rejected() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        client.connect().await.unwrap();
        assert!(matches!(
            client.subscribe_to_events(" ", |_| {}).await,
            Err(HubError::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_clears_subscriptions() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        client.connect().await.unwrap();
        client.subscribe_to_events("state_changed", |_| {}).await.unwrap();

        client.disconnect().await;
        assert!(client.subscribed_event_types().is_empty());

        client.connect().await.unwrap();
        assert_eq!(hub.subscribe_calls().len(), 1);
    }

    // --- cache ---

    #[tokio::test(start_paused = true)]
    async fn cached_queries_within_ttl_fetch_once() {
        let hub = FakeHub::new();
        hub.set_states(vec![record("light.kitchen", "on"), record("sensor.outside", "12.5")]);
        let (client, _) = client_with(&hub, |c| {
            c.with_cache(CachePolicy {
                enabled: true,
                ttl_ms: 1000,
            })
        });
        client.connect().await.unwrap();

        assert_eq!(client.get_all_states().await.unwrap().len(), 2);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(client.get_all_states().await.unwrap().len(), 2);
        assert_eq!(client.get_state("light.kitchen").await.unwrap().state, "on");
        assert_eq!(hub.get_states_calls(), 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        client.get_all_states().await.unwrap();
        assert_eq!(hub.get_states_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_disconnect_forces_fresh_fetch() {
        let hub = FakeHub::new();
        let (client, _) = client_with(&hub, |c| c.with_cache(CachePolicy::default()));
        client.connect().await.unwrap();
        client.get_all_states().await.unwrap();

        client.disconnect().await;
        client.connect().await.unwrap();
        client.get_all_states().await.unwrap();

        assert_eq!(hub.get_states_calls(), 2);
    }

    #[tokio::test]
    async fn uncached_queries_always_fetch() {
        let hub = FakeHub::new();
        hub.set_states(vec![record("light.kitchen", "on")]);
        let (client, _) = client(&hub);
        client.connect().await.unwrap();

        client.get_all_states().await.unwrap();
        client.get_all_states().await.unwrap();
        assert_eq!(hub.get_states_calls(), 2);
    }

    #[tokio::test]
    async fn unknown_entity_is_typed_not_found() {
        let hub = FakeHub::new();
        hub.set_states(vec![record("light.kitchen", "on")]);
        let (client, _) = client_with(&hub, |c| c.with_cache(CachePolicy::default()));
        client.connect().await.unwrap();

        let err = client.get_state("light.attic").await.unwrap_err();
        assert!(matches!(err, HubError::EntityNotFound(ref id) if id == "light.attic"));
        assert!(err.to_string().contains("light.attic"));
    }

    // --- connection loss and recovery ---

    #[tokio::test]
    async fn disconnected_then_ready_recovers_with_single_success_log() {
        let hub = FakeHub::new();
        let (client, log) = client(&hub);
        let mut states = client.state_receiver();
        client.connect().await.unwrap();

        hub.fire(ListenerKind::Disconnected);
        wait_for_state(&mut states, ConnectionState::Disconnected).await;
        assert!(!client.is_connected());
        assert!(log.contains(Level::Warn, "connection lost"));
        assert_eq!(log.count("reconnection successful"), 0);

        hub.fire(ListenerKind::Ready);
        wait_for_state(&mut states, ConnectionState::Connected).await;
        assert!(client.is_connected());
        assert_eq!(log.count("reconnection successful"), 1);
        assert_eq!(client.reconnect_phase(), ReconnectPhase::Idle);
        assert_eq!(client.reconnect_attempts(), 0);
        // The in-place recovery cancelled the scheduled attempt.
        assert_eq!(hub.connect_count(), 1);
    }

    #[tokio::test]
    async fn ready_rearms_without_duplicates() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        let mut states = client.state_receiver();
        client.connect().await.unwrap();

        let (seen, handler) = collector();
        client.subscribe_to_events("state_changed", handler).await.unwrap();

        hub.fire(ListenerKind::Disconnected);
        wait_for_state(&mut states, ConnectionState::Disconnected).await;
        hub.fire(ListenerKind::Ready);
        wait_for_state(&mut states, ConnectionState::Connected).await;

        assert_eq!(hub.open_remotes(), 1, "stale remote was released");
        hub.emit(state_changed());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loss_reconnects_and_restores_subscriptions() {
        let hub = FakeHub::new();
        let (client, log) = client(&hub);
        let mut states = client.state_receiver();
        client.connect().await.unwrap();

        let (seen, handler) = collector();
        client.subscribe_to_events("state_changed", handler).await.unwrap();

        hub.fire(ListenerKind::Disconnected);
        wait_for_state(&mut states, ConnectionState::Disconnected).await;
        wait_for_state(&mut states, ConnectionState::Connected).await;

        assert_eq!(hub.connect_count(), 2);
        assert_eq!(hub.close_calls(), 1, "dead handle closed after replacement");
        assert_eq!(hub.subscribe_calls().len(), 2);
        assert!(log.contains(Level::Info, "reconnection successful"));

        hub.emit(state_changed());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_follows_policy_and_stops_at_ceiling() {
        let hub = FakeHub::new();
        let policy = ReconnectionPolicy {
            enabled: true,
            initial_delay_ms: 100,
            max_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_attempts: 4,
        };
        let (client, log) = client_with(&hub, |c| c.with_reconnection(policy));
        client.connect().await.unwrap();
        hub.script([Connect::Refused; 10]);

        let lost_at = Instant::now();
        hub.fire(ListenerKind::Disconnected);

        // Long enough for every attempt the policy allows, and then some.
        tokio::time::sleep(Duration::from_secs(10)).await;

        let times = hub.connect_times();
        assert_eq!(times.len(), 1 + 4, "initial connect plus four attempts");

        let expected = [100u64, 200, 400, 500];
        let mut previous = lost_at;
        for (at, want) in times[1..].iter().zip(expected) {
            let gap = at.duration_since(previous).as_millis() as i64;
            assert!((gap - want as i64).abs() <= 5, "gap {gap}ms, expected {want}ms");
            previous = *at;
        }

        assert_eq!(client.reconnect_phase(), ReconnectPhase::Exhausted);
        assert_eq!(client.reconnect_attempts(), 4);
        assert!(log.contains(Level::Warn, "4 attempts"));
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_stops_on_auth_failure() {
        let hub = FakeHub::new();
        let (client, log) = client(&hub);
        client.connect().await.unwrap();
        hub.script([Connect::Rejected]);

        hub.fire(ListenerKind::Disconnected);
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(hub.connect_count(), 2);
        assert!(log.contains(Level::Error, "authentication failed"));
        assert_eq!(client.reconnect_phase(), ReconnectPhase::Idle);
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_reconnection_only_warns() {
        let hub = FakeHub::new();
        let (client, log) =
            client_with(&hub, |c| c.with_reconnection(ReconnectionPolicy::disabled()));
        let mut states = client.state_receiver();
        client.connect().await.unwrap();

        hub.fire(ListenerKind::Disconnected);
        wait_for_state(&mut states, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(log.contains(Level::Warn, "auto-reconnection is disabled"));
        assert_eq!(hub.connect_count(), 1);
        assert_eq!(client.reconnect_phase(), ReconnectPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_disconnect_cancels_pending_reconnect() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        let mut states = client.state_receiver();
        client.connect().await.unwrap();

        hub.fire(ListenerKind::Disconnected);
        wait_for_state(&mut states, ConnectionState::Disconnected).await;
        client.disconnect().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(hub.connect_count(), 1);
        assert_eq!(client.reconnect_phase(), ReconnectPhase::Idle);
    }

    #[tokio::test]
    async fn loss_after_manual_disconnect_is_ignored() {
        let hub = FakeHub::new();
        let (client, log) = client(&hub);
        client.connect().await.unwrap();
        client.disconnect().await;

        hub.fire(ListenerKind::Disconnected);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(!log.contains(Level::Warn, "connection lost"));
        assert_eq!(client.reconnect_phase(), ReconnectPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn loss_purges_cache() {
        let hub = FakeHub::new();
        let (client, _) = client_with(&hub, |c| c.with_cache(CachePolicy::default()));
        let mut states = client.state_receiver();
        client.connect().await.unwrap();
        client.get_all_states().await.unwrap();

        hub.fire(ListenerKind::Disconnected);
        wait_for_state(&mut states, ConnectionState::Disconnected).await;
        hub.fire(ListenerKind::Ready);
        wait_for_state(&mut states, ConnectionState::Connected).await;

        client.get_all_states().await.unwrap();
        assert_eq!(hub.get_states_calls(), 2);
    }

    #[tokio::test]
    async fn loss_before_listeners_are_registered_is_detected() {
        let hub = FakeHub::new();
        hub.script([Connect::OkThenLost]);
        let (client, log) =
            client_with(&hub, |c| c.with_reconnection(ReconnectionPolicy::disabled()));

        client.connect().await.unwrap();
        let mut states = client.state_receiver();
        wait_for_state(&mut states, ConnectionState::Disconnected).await;

        assert!(log.contains(Level::Warn, "connection lost"));
        assert!(!client.validate_connection().await.success);
        assert!(matches!(client.get_all_states().await, Err(HubError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_connecting_is_rejected() {
        let hub = FakeHub::new();
        hub.set_connect_delay(Duration::from_millis(500));
        let (client, _) = client(&hub);

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.connection_state(), ConnectionState::Connecting);

        assert!(matches!(client.connect().await, Err(HubError::AlreadyConnected)));
        assert_eq!(client.connection_state(), ConnectionState::Connecting);

        first.await.unwrap().unwrap();
        assert!(client.is_connected());
        assert_eq!(hub.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_during_reconnect_attempt_is_rejected() {
        let hub = FakeHub::new();
        let policy = ReconnectionPolicy {
            initial_delay_ms: 100,
            ..ReconnectionPolicy::default()
        };
        let (client, _) = client_with(&hub, |c| c.with_reconnection(policy));
        client.connect().await.unwrap();
        hub.set_connect_delay(Duration::from_millis(500));

        hub.fire(ListenerKind::Disconnected);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.reconnect_phase(), ReconnectPhase::Attempting { attempt: 1 });
        assert_eq!(client.connection_state(), ConnectionState::Connecting);

        assert!(matches!(client.connect().await, Err(HubError::AlreadyConnected)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(client.is_connected());
        assert_eq!(hub.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_connect_recovers_from_exhausted() {
        let hub = FakeHub::new();
        let policy = ReconnectionPolicy {
            initial_delay_ms: 100,
            max_attempts: 2,
            ..ReconnectionPolicy::default()
        };
        let (client, _) = client_with(&hub, |c| c.with_reconnection(policy));
        client.connect().await.unwrap();
        hub.script([Connect::Refused, Connect::Refused]);

        hub.fire(ListenerKind::Disconnected);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(client.reconnect_phase(), ReconnectPhase::Exhausted);
        assert_eq!(client.reconnect_attempts(), 2);
        assert!(!client.is_connected());

        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.reconnect_attempts(), 0);
        assert_eq!(client.reconnect_phase(), ReconnectPhase::Idle);
        assert_eq!(hub.connect_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn loss_during_rearm_schedules_another_reconnect() {
        let hub = FakeHub::new();
        let (client, log) = client(&hub);
        client.connect().await.unwrap();
        let (seen, handler) = collector();
        client.subscribe_to_events("state_changed", handler).await.unwrap();

        // The replacement connection drops while its subscriptions are
        // being restored, with the lifecycle lock still held.
        hub.fire_during_next_subscribe(ListenerKind::Disconnected);
        hub.fire(ListenerKind::Disconnected);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(client.is_connected());
        assert_eq!(hub.connect_count(), 3);
        assert_eq!(log.count("connection lost"), 2);
        assert_eq!(hub.open_remotes(), 1);

        hub.emit(state_changed());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lost_handle_is_parked_until_ready_or_disconnect() {
        let hub = FakeHub::new();
        let (client, _) = client(&hub);
        let mut states = client.state_receiver();
        client.connect().await.unwrap();

        hub.fire(ListenerKind::Disconnected);
        wait_for_state(&mut states, ConnectionState::Disconnected).await;
        assert!(client.inner.live.lock().unwrap().is_none());
        assert!(client.inner.dormant.lock().unwrap().is_some());

        hub.fire(ListenerKind::Ready);
        wait_for_state(&mut states, ConnectionState::Connected).await;
        assert!(client.inner.live.lock().unwrap().is_some());
        assert!(client.inner.dormant.lock().unwrap().is_none());

        hub.fire(ListenerKind::Disconnected);
        wait_for_state(&mut states, ConnectionState::Disconnected).await;
        client.disconnect().await;
        assert!(client.inner.dormant.lock().unwrap().is_none());
        assert_eq!(hub.close_calls(), 1);
    }
}
