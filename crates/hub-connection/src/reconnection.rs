//! Reconnection with exponential backoff.
//!
//! Started on connection loss; runs until a reconnect succeeds, the attempt
//! ceiling is hit, credentials are rejected, or it is cancelled by
//! `connect()`, `disconnect()` or an in-place recovery.

use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::manager::{ClientInner, establish};
use crate::transport::Transport;
use crate::types::{ConnectionState, ReconnectPhase};

type LoopSlot = Mutex<Option<(u64, CancellationToken)>>;

/// Cancels the active reconnect loop, if any.
pub(crate) fn cancel_reconnect<T: Transport>(inner: &ClientInner<T>) {
    cancel_any_reconnect(&inner.reconnect_cancel);
}

fn cancel_any_reconnect(slot: &LoopSlot) {
    if let Some((_, token)) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
        token.cancel();
    }
}

/// Clears the slot only if it still holds loop `loop_id`.
fn release_slot(slot: &LoopSlot, loop_id: u64) {
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if guard.as_ref().is_some_and(|(id, _)| *id == loop_id) {
        *guard = None;
    }
}

/// Replaces any running reconnect loop with a fresh one.
pub(crate) fn start_reconnect<T: Transport>(inner: &Arc<ClientInner<T>>) {
    let cancel = CancellationToken::new();
    let loop_id = inner.next_loop_id.fetch_add(1, Ordering::Relaxed) + 1;
    cancel_any_reconnect(&inner.reconnect_cancel);
    *inner
        .reconnect_cancel
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some((loop_id, cancel.clone()));

    tokio::spawn(reconnect_loop(inner.clone(), loop_id, cancel));
}

/// Reconnection loop with exponential backoff.
///
/// Returns a boxed future to break the type cycle with the loss handler,
/// which spawns this loop and is itself spawned from listeners registered
/// by a successful attempt.
fn reconnect_loop<T: Transport>(
    inner: Arc<ClientInner<T>>,
    loop_id: u64,
    cancel: CancellationToken,
) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        let policy = inner.policy.clone();

        loop {
            let failed = inner.attempts.load(Ordering::Acquire);
            if failed >= policy.max_attempts {
                inner.set_phase(ReconnectPhase::Exhausted);
                inner.log.warn(format!(
                    "reconnection failed after {} attempts, giving up",
                    policy.max_attempts
                ));
                break;
            }

            let attempt = failed + 1;
            let delay = policy.delay_for_attempt(attempt);
            inner.set_phase(ReconnectPhase::Scheduling { attempt, delay });
            inner.log.warn(format!(
                "reconnecting in {}ms (attempt {attempt}/{})",
                delay.as_millis(),
                policy.max_attempts
            ));

            // Wait for the backoff delay (or cancellation).
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let _guard = tokio::select! {
                _ = cancel.cancelled() => return,
                guard = inner.lifecycle.lock() => guard,
            };
            if cancel.is_cancelled() || inner.manual_close.load(Ordering::Acquire) {
                return;
            }
            if inner.connection_state() != ConnectionState::Disconnected {
                // Recovered through another path.
                break;
            }

            inner.set_phase(ReconnectPhase::Attempting { attempt });
            inner.state.send_replace(ConnectionState::Connecting);
            inner.log.debug(format!("reconnection attempt {attempt}"));

            match establish(&inner).await {
                Ok(()) => {
                    inner.log.info("reconnection successful");
                    break;
                }
                Err(e) if e.is_auth_failure() => {
                    inner.state.send_replace(ConnectionState::Disconnected);
                    inner.set_phase(ReconnectPhase::Idle);
                    inner.log.error(format!(
                        "authentication failed while reconnecting, giving up: {e}"
                    ));
                    break;
                }
                Err(e) => {
                    inner.state.send_replace(ConnectionState::Disconnected);
                    inner.attempts.fetch_add(1, Ordering::AcqRel);
                    inner
                        .log
                        .warn(format!("reconnection attempt {attempt} failed: {e}"));
                }
            }
        }

        release_slot(&inner.reconnect_cancel, loop_id);
    }) // Box::pin
}
