//! Write pump: the only task that touches the socket sink.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Drains the outbound queue into the WebSocket sink.
///
/// On cancellation, frames already queued are still flushed before the close
/// frame so a final command is not lost. A sink error ends the pump at once.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<Message, Error = tungstenite::Error> + Unpin,
{
    let mut sent = 0u64;
    loop {
        let msg = tokio::select! {
            biased;
            msg = write_rx.recv() => msg,
            _ = cancel.cancelled() => break,
        };
        let Some(msg) = msg else { break };
        if let Err(e) = write.send(msg).await {
            error!("WebSocket write error: {e}");
            return;
        }
        sent += 1;
    }

    while let Ok(msg) = write_rx.try_recv() {
        if write.send(msg).await.is_err() {
            return;
        }
        sent += 1;
    }

    debug!(sent, "write pump stopping");
    let _ = write.send(Message::Close(None)).await;
}
