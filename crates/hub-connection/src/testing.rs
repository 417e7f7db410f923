//! Scripted in-memory transport and a recording logger for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use hubwire_protocol::{HubEvent, ServiceCallResponse, ServiceContext, StateRecord};

use crate::logger::Logger;
use crate::transport::{
    EventCallback, ListenerCallback, ListenerKind, RemoteSubscription, TokenAuth, Transport,
    TransportError, TransportHandle,
};
use crate::types::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Default)]
pub(crate) struct RecordingLogger {
    lines: Mutex<Vec<(Level, String)>>,
}

impl RecordingLogger {
    fn push(&self, level: Level, message: &str) {
        self.lines.lock().unwrap().push((level, message.to_string()));
    }

    pub(crate) fn contains(&self, level: Level, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }

    /// Lines at any level containing `needle`.
    pub(crate) fn count(&self, needle: &str) -> usize {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| m.contains(needle))
            .count()
    }
}

impl Logger for RecordingLogger {
    fn debug(&self, message: &str) {
        self.push(Level::Debug, message);
    }

    fn info(&self, message: &str) {
        self.push(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.push(Level::Warn, message);
    }

    fn error(&self, message: &str) {
        self.push(Level::Error, message);
    }
}

/// Outcome of one scripted `create_connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Connect {
    Ok,
    /// Connects, but the connection is already gone by the time the
    /// client registers its listeners.
    OkThenLost,
    /// Network-level failure (retryable).
    Refused,
    /// Credential rejection.
    Rejected,
}

#[derive(Default)]
struct HandleShared {
    lost: std::sync::atomic::AtomicBool,
    listeners: Mutex<Vec<(ListenerKind, ListenerCallback)>>,
    routes: Mutex<HashMap<u64, (String, EventCallback)>>,
}

#[derive(Default)]
struct HubState {
    script: VecDeque<Connect>,
    connect_times: Vec<Instant>,
    handles: Vec<Arc<HandleShared>>,
    states: Vec<StateRecord>,
    get_states_calls: usize,
    service_calls: Vec<(String, String, Option<serde_json::Value>)>,
    subscribe_calls: Vec<String>,
    unsubscribe_calls: usize,
    subscribe_failures: usize,
    fire_on_subscribe: Option<ListenerKind>,
    connect_delay: Duration,
    close_calls: usize,
    fail_close: bool,
}

/// The far end of every [`FakeTransport`] connection.
#[derive(Default)]
pub(crate) struct FakeHub {
    state: Mutex<HubState>,
    next_remote: AtomicU64,
}

impl FakeHub {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues connect outcomes; once exhausted, connects succeed.
    pub(crate) fn script(&self, outcomes: impl IntoIterator<Item = Connect>) {
        self.state.lock().unwrap().script.extend(outcomes);
    }

    pub(crate) fn set_states(&self, states: Vec<StateRecord>) {
        self.state.lock().unwrap().states = states;
    }

    pub(crate) fn fail_next_subscribes(&self, n: usize) {
        self.state.lock().unwrap().subscribe_failures = n;
    }

    /// The next `subscribe_events` fires `kind` on its own connection
    /// before answering.
    pub(crate) fn fire_during_next_subscribe(&self, kind: ListenerKind) {
        self.state.lock().unwrap().fire_on_subscribe = Some(kind);
    }

    /// Every `create_connection` takes `delay` before it resolves.
    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().unwrap().connect_delay = delay;
    }

    pub(crate) fn fail_close(&self) {
        self.state.lock().unwrap().fail_close = true;
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connect_times.len()
    }

    pub(crate) fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().connect_times.clone()
    }

    pub(crate) fn get_states_calls(&self) -> usize {
        self.state.lock().unwrap().get_states_calls
    }

    pub(crate) fn service_calls(&self) -> Vec<(String, String, Option<serde_json::Value>)> {
        self.state.lock().unwrap().service_calls.clone()
    }

    pub(crate) fn subscribe_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().subscribe_calls.clone()
    }

    pub(crate) fn unsubscribe_calls(&self) -> usize {
        self.state.lock().unwrap().unsubscribe_calls
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }

    fn latest(&self) -> Option<Arc<HandleShared>> {
        self.state.lock().unwrap().handles.last().cloned()
    }

    /// Remote subscriptions currently open on the latest connection.
    pub(crate) fn open_remotes(&self) -> usize {
        self.latest().map_or(0, |h| h.routes.lock().unwrap().len())
    }

    /// Fires a lifecycle notification on the latest connection.
    pub(crate) fn fire(&self, kind: ListenerKind) {
        if let Some(handle) = self.latest() {
            handle.fire(kind);
        }
    }

    /// Pushes `event` through every matching remote subscription on the
    /// latest connection.
    pub(crate) fn emit(&self, event: HubEvent) {
        let Some(handle) = self.latest() else {
            return;
        };
        let callbacks: Vec<EventCallback> = handle
            .routes
            .lock()
            .unwrap()
            .values()
            .filter(|(t, _)| *t == event.event_type)
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(event.clone());
        }
    }
}

impl HandleShared {
    fn fire(&self, kind: ListenerKind) {
        if kind == ListenerKind::Disconnected {
            self.lost.store(true, Ordering::SeqCst);
        }
        let callbacks: Vec<ListenerCallback> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb();
        }
    }
}

pub(crate) struct FakeTransport {
    hub: Arc<FakeHub>,
}

impl FakeTransport {
    pub(crate) fn new(hub: &Arc<FakeHub>) -> Self {
        Self { hub: hub.clone() }
    }
}

impl Transport for FakeTransport {
    type Handle = FakeHandle;

    async fn create_connection(&self, _auth: &TokenAuth) -> Result<FakeHandle, TransportError> {
        let delay = self.hub.state.lock().unwrap().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut st = self.hub.state.lock().unwrap();
        st.connect_times.push(Instant::now());
        match st.script.pop_front().unwrap_or(Connect::Ok) {
            outcome @ (Connect::Ok | Connect::OkThenLost) => {
                let shared = Arc::new(HandleShared::default());
                if outcome == Connect::OkThenLost {
                    shared.lost.store(true, Ordering::SeqCst);
                }
                st.handles.push(shared.clone());
                Ok(FakeHandle {
                    hub: self.hub.clone(),
                    shared,
                })
            }
            Connect::Refused => Err(TransportError::Closed),
            Connect::Rejected => Err(TransportError::AuthInvalid(
                "Invalid access token or password".into(),
            )),
        }
    }
}

pub(crate) struct FakeHandle {
    hub: Arc<FakeHub>,
    shared: Arc<HandleShared>,
}

impl TransportHandle for FakeHandle {
    fn add_event_listener(&self, kind: ListenerKind, callback: ListenerCallback) {
        self.shared.listeners.lock().unwrap().push((kind, callback.clone()));
        if kind == ListenerKind::Disconnected && self.shared.lost.load(Ordering::SeqCst) {
            callback();
        }
    }

    async fn subscribe_events(
        &self,
        event_type: &str,
        callback: EventCallback,
    ) -> Result<RemoteSubscription, TransportError> {
        let fire = self.hub.state.lock().unwrap().fire_on_subscribe.take();
        if let Some(kind) = fire {
            self.shared.fire(kind);
        }
        {
            let mut st = self.hub.state.lock().unwrap();
            st.subscribe_calls.push(event_type.to_string());
            if st.subscribe_failures > 0 {
                st.subscribe_failures -= 1;
                return Err(TransportError::Remote {
                    code: "unknown_error".into(),
                    message: "subscription refused".into(),
                });
            }
        }
        let id = self.hub.next_remote.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared
            .routes
            .lock()
            .unwrap()
            .insert(id, (event_type.to_string(), callback));
        Ok(RemoteSubscription(id))
    }

    async fn unsubscribe_events(&self, subscription: RemoteSubscription) -> Result<(), TransportError> {
        self.hub.state.lock().unwrap().unsubscribe_calls += 1;
        self.shared.routes.lock().unwrap().remove(&subscription.0);
        Ok(())
    }

    async fn get_states(&self) -> Result<Vec<StateRecord>, TransportError> {
        let mut st = self.hub.state.lock().unwrap();
        st.get_states_calls += 1;
        Ok(st.states.clone())
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Option<serde_json::Value>,
    ) -> Result<ServiceCallResponse, TransportError> {
        let mut st = self.hub.state.lock().unwrap();
        st.service_calls
            .push((domain.to_string(), service.to_string(), data));
        if domain == "missing" {
            return Err(TransportError::Remote {
                code: "not_found".into(),
                message: "Service not found.".into(),
            });
        }
        Ok(ServiceCallResponse {
            context: ServiceContext {
                id: format!("ctx-{}", st.service_calls.len()),
                parent_id: None,
                user_id: None,
            },
        })
    }

    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut st = self.hub.state.lock().unwrap();
        st.close_calls += 1;
        if st.fail_close {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

pub(crate) fn record(entity_id: &str, state: &str) -> StateRecord {
    serde_json::from_value(serde_json::json!({
        "entity_id": entity_id,
        "state": state,
        "attributes": {},
    }))
    .unwrap()
}

/// Waits (bounded) until the watched state equals `want`.
pub(crate) async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| *s == want))
        .await
        .expect("state change timed out")
        .expect("client dropped");
}
