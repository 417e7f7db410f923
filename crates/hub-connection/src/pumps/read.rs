//! Read pump: routes inbound frames to pending commands and event streams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use hubwire_protocol::constants::{MessageType, WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use hubwire_protocol::envelope::ServerMessage;

use crate::transport::{EventCallback, ListenerCallback, ListenerKind};

/// Replies awaited by in-flight commands, keyed by command id.
pub(crate) type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>>;

/// Event callbacks keyed by the id of the `subscribe_events` command.
pub(crate) type EventRoutes = Arc<StdMutex<HashMap<u64, EventCallback>>>;

/// Lifecycle listeners of one connection.
///
/// The loss is latched: a `Disconnected` listener added after the socket
/// already died is invoked on registration, so a loss that happens before
/// the owner has hooked up its listeners is never missed.
#[derive(Default)]
pub(crate) struct ListenerSet {
    inner: StdMutex<ListenerState>,
}

#[derive(Default)]
struct ListenerState {
    lost: bool,
    entries: Vec<(ListenerKind, ListenerCallback)>,
}

pub(crate) type Listeners = Arc<ListenerSet>;

impl ListenerSet {
    fn lock(&self) -> std::sync::MutexGuard<'_, ListenerState> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn add(&self, kind: ListenerKind, callback: ListenerCallback) {
        let mut state = self.lock();
        state.entries.push((kind, callback.clone()));
        let fire_now = state.lost && kind == ListenerKind::Disconnected;
        drop(state);
        if fire_now {
            callback();
        }
    }

    /// Latches the loss and invokes the `Disconnected` listeners registered
    /// so far. Only the first call fires.
    pub(crate) fn mark_lost(&self) {
        let callbacks: Vec<ListenerCallback> = {
            let mut state = self.lock();
            if state.lost {
                return;
            }
            state.lost = true;
            state
                .entries
                .iter()
                .filter(|(k, _)| *k == ListenerKind::Disconnected)
                .map(|(_, cb)| cb.clone())
                .collect()
        };
        for cb in callbacks {
            cb();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_lost(&self) -> bool {
        self.lock().lost
    }
}

/// Reads frames from the WebSocket and dispatches them.
///
/// Any incoming frame resets the read deadline; if nothing arrives within
/// [`WS_PONG_WAIT`] the connection is considered dead. When the loop ends
/// without a local cancel, `Disconnected` listeners fire.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    routes: EventRoutes,
    listeners: Listeners,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("read deadline expired, closing");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &pending, &routes).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(frame) => {
                                debug!(frame = ?frame, "received close frame");
                                break;
                            }
                            _ => {} // binary frames are not part of the protocol
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    let lost = !cancel.is_cancelled();
    // Stop the write and ping pumps too.
    cancel.cancel();
    // Dropping the senders fails every waiter with `Closed`.
    pending.lock().await.clear();

    if lost {
        listeners.mark_lost();
    }
}

/// Handles a text frame from the WebSocket.
async fn handle_text_message(text: &str, pending: &PendingMap, routes: &EventRoutes) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = ?msg.id, "received message");

    let Some(id) = msg.id else {
        debug!(msg_type = ?msg.msg_type, "dropping frame without id");
        return;
    };

    match msg.msg_type {
        MessageType::Event => {
            let route = routes.lock().ok().and_then(|r| r.get(&id).cloned());
            match (route, msg.event) {
                (Some(cb), Some(event)) => cb(event),
                (None, _) => trace!(id, "event for unknown subscription, dropping"),
                (_, None) => warn!(id, "event frame without event body"),
            }
        }
        MessageType::Result | MessageType::Pong => {
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(msg);
            } else {
                debug!(id, "reply for unknown command, dropping");
            }
        }
        other => debug!(msg_type = ?other, id, "unexpected frame, dropping"),
    }
}
