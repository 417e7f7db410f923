//! Keepalive: control-frame pings at a fixed period.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Queues a Ping every `period` until cancelled or the write side is gone.
///
/// The hub answers with a Pong, which moves the read pump's deadline.
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<Message>,
    period: Duration,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now() + period;
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                trace!("keepalive ping");
                if write_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
