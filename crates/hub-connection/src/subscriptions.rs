//! Event subscription multiplexer.
//!
//! One remote stream per event type, fanned out to every local handler
//! registered for that type. The table belongs to the client, not to a
//! transport handle, so registrations survive reconnection.
//!
//! Each stream carries an epoch. A remote subscription's callback is tagged
//! with the epoch it was opened under and only delivers while that epoch is
//! current, so an old and a new remote stream for the same type never both
//! deliver the same event.
//!
//! When a stream is reopened on the connection it already lives on, the old
//! remote keeps delivering until the new one is attached. Events the new
//! remote pushes in between are held back and replayed on attach only if the
//! old remote stayed silent, which covers a recovered connection whose old
//! subscription is already dead.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hubwire_protocol::HubEvent;

use crate::logger::LogSink;
use crate::transport::{EventCallback, RemoteSubscription};

/// Local event handler.
pub type EventHandler = Arc<dyn Fn(&HubEvent) + Send + Sync>;

/// Identifies one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// A remote subscription together with the connection generation it lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RemoteSlot {
    pub generation: u64,
    pub subscription: RemoteSubscription,
}

/// A stream that must be (re)opened under `epoch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rearm {
    pub event_type: String,
    pub epoch: u64,
}

struct Entry {
    id: SubscriptionId,
    handler: EventHandler,
    active: Arc<AtomicBool>,
}

/// Upper bound on events held back during one handover.
const HANDOVER_BUFFER: usize = 256;

/// A same-connection reopen in progress.
struct Handover {
    epoch: u64,
    held: Vec<HubEvent>,
    old_delivered: bool,
}

struct Stream {
    entries: Vec<Entry>,
    epoch: u64,
    remote: Option<RemoteSlot>,
    handover: Option<Handover>,
}

impl Stream {
    fn handlers(&self) -> Vec<(EventHandler, Arc<AtomicBool>)> {
        self.entries
            .iter()
            .map(|e| (e.handler.clone(), e.active.clone()))
            .collect()
    }
}

#[derive(Default)]
struct TableState {
    streams: HashMap<String, Stream>,
    next_id: u64,
    next_epoch: u64,
}

impl TableState {
    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

pub(crate) struct SubscriptionTable {
    state: Mutex<TableState>,
    log: LogSink,
}

impl SubscriptionTable {
    pub(crate) fn new(log: LogSink) -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            log,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `handler` under `event_type`.
    ///
    /// Returns the new id and, when the type has no remote stream yet, the
    /// epoch the caller must open one under.
    pub(crate) fn add(&self, event_type: &str, handler: EventHandler) -> (SubscriptionId, Option<u64>) {
        let mut st = self.lock();
        st.next_id += 1;
        let id = SubscriptionId(st.next_id);

        let needs_remote = st
            .streams
            .get(event_type)
            .is_none_or(|s| s.remote.is_none());
        let open_epoch = needs_remote.then(|| st.bump_epoch());

        let stream = st
            .streams
            .entry(event_type.to_string())
            .or_insert_with(|| Stream {
                entries: Vec::new(),
                epoch: 0,
                remote: None,
                handover: None,
            });
        if let Some(epoch) = open_epoch {
            stream.epoch = epoch;
            stream.handover = None;
        }
        stream.entries.push(Entry {
            id,
            handler,
            active: Arc::new(AtomicBool::new(true)),
        });

        (id, open_epoch)
    }

    /// Builds the transport callback for a remote stream opened under `epoch`.
    pub(crate) fn dispatcher(self: &Arc<Self>, event_type: &str, epoch: u64) -> EventCallback {
        let table = Arc::downgrade(self);
        let event_type = event_type.to_string();
        Arc::new(move |event: HubEvent| {
            if let Some(table) = table.upgrade() {
                table.dispatch(&event_type, epoch, &event);
            }
        })
    }

    /// Delivers `event` to every handler of `event_type`, in registration
    /// order. A panicking handler does not stop delivery to the rest.
    pub(crate) fn dispatch(&self, event_type: &str, epoch: u64, event: &HubEvent) {
        let handlers = {
            let mut st = self.lock();
            let Some(stream) = st.streams.get_mut(event_type) else {
                return;
            };
            if stream.epoch == epoch {
                if let Some(handover) = stream.handover.as_mut() {
                    handover.old_delivered = true;
                    handover.held.clear();
                }
                stream.handlers()
            } else if let Some(handover) = stream.handover.as_mut()
                && handover.epoch == epoch
            {
                if !handover.old_delivered && handover.held.len() < HANDOVER_BUFFER {
                    handover.held.push(event.clone());
                }
                return;
            } else {
                self.log
                    .debug(format!("dropping '{event_type}' event from a superseded stream"));
                return;
            }
        };

        self.deliver(event_type, &handlers, std::slice::from_ref(event));
    }

    fn deliver(&self, event_type: &str, handlers: &[(EventHandler, Arc<AtomicBool>)], events: &[HubEvent]) {
        for event in events {
            for (handler, active) in handlers {
                // Unsubscribed while an earlier handler ran.
                if !active.load(Ordering::Acquire) {
                    continue;
                }
                if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                    self.log
                        .error(format!("event handler for '{event_type}' panicked"));
                }
            }
        }
    }

    /// Records the remote stream opened under `epoch` and makes it current.
    ///
    /// Returns the remote it replaced (to be released by the caller), or the
    /// new one itself when the stream is gone or has moved on. Events held
    /// back during a handover are delivered before returning.
    pub(crate) fn attach_remote(&self, event_type: &str, epoch: u64, slot: RemoteSlot) -> Option<RemoteSlot> {
        let (stale, handlers, held) = {
            let mut st = self.lock();
            let Some(stream) = st.streams.get_mut(event_type) else {
                return Some(slot);
            };
            if stream.epoch > epoch {
                return Some(slot);
            }
            let held = match stream.handover.take() {
                Some(h) if h.epoch == epoch && !h.old_delivered => h.held,
                Some(h) if h.epoch != epoch => {
                    stream.handover = Some(h);
                    Vec::new()
                }
                _ => Vec::new(),
            };
            stream.epoch = epoch;
            let stale = stream.remote.replace(slot);
            let handlers = if held.is_empty() {
                Vec::new()
            } else {
                stream.handlers()
            };
            (stale, handlers, held)
        };

        if !held.is_empty() {
            self.log.debug(format!(
                "replaying {} '{event_type}' event(s) from the reopened stream",
                held.len()
            ));
            self.deliver(event_type, &handlers, &held);
        }
        stale
    }

    /// Removes one handler.
    ///
    /// Returns `None` if `id` is unknown, otherwise the event type and, if
    /// this was its last handler, the remote stream to close.
    pub(crate) fn remove(&self, id: SubscriptionId) -> Option<(String, Option<RemoteSlot>)> {
        let mut st = self.lock();
        let event_type = st
            .streams
            .iter()
            .find(|(_, s)| s.entries.iter().any(|e| e.id == id))
            .map(|(k, _)| k.clone())?;

        let stream = st.streams.get_mut(&event_type)?;
        if let Some(pos) = stream.entries.iter().position(|e| e.id == id) {
            let entry = stream.entries.remove(pos);
            entry.active.store(false, Ordering::Release);
        }
        if !stream.entries.is_empty() {
            return Some((event_type, None));
        }
        let remote = st.streams.remove(&event_type).and_then(|s| s.remote);
        Some((event_type, remote))
    }

    /// Removes every handler of `event_type`. Returns how many were removed
    /// and the remote stream to close.
    pub(crate) fn remove_type(&self, event_type: &str) -> (usize, Option<RemoteSlot>) {
        let mut st = self.lock();
        match st.streams.remove(event_type) {
            Some(stream) => {
                for entry in &stream.entries {
                    entry.active.store(false, Ordering::Release);
                }
                (stream.entries.len(), stream.remote)
            }
            None => (0, None),
        }
    }

    /// Drops every registration.
    pub(crate) fn clear(&self) {
        let mut st = self.lock();
        for stream in st.streams.values() {
            for entry in &stream.entries {
                entry.active.store(false, Ordering::Release);
            }
        }
        st.streams.clear();
    }

    /// Prepares every stream to be reopened on connection `generation`.
    ///
    /// Streams whose remote lives on an older generation switch to the new
    /// epoch immediately. Streams with a remote on this same generation keep
    /// delivering from it until [`attach_remote`](Self::attach_remote) swaps
    /// in the replacement, with the new remote's events held back meanwhile.
    pub(crate) fn begin_rearm(&self, generation: u64) -> Vec<Rearm> {
        let mut st = self.lock();
        let mut keys: Vec<String> = st.streams.keys().cloned().collect();
        keys.sort();

        let mut rearm = Vec::with_capacity(keys.len());
        for event_type in keys {
            let epoch = st.bump_epoch();
            if let Some(stream) = st.streams.get_mut(&event_type) {
                let live_here = stream.remote.is_some_and(|r| r.generation == generation);
                if live_here {
                    stream.handover = Some(Handover {
                        epoch,
                        held: Vec::new(),
                        old_delivered: false,
                    });
                } else {
                    stream.epoch = epoch;
                    stream.remote = None;
                    stream.handover = None;
                }
            }
            rearm.push(Rearm { event_type, epoch });
        }
        rearm
    }

    /// Registered event types, sorted.
    pub(crate) fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.lock().streams.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of handlers registered for `event_type`.
    pub(crate) fn count(&self, event_type: &str) -> usize {
        self.lock()
            .streams
            .get(event_type)
            .map_or(0, |s| s.entries.len())
    }
}
