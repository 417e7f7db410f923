//! Hub authentication handshake.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tracing::{debug, trace};

use hubwire_protocol::constants::MessageType;
use hubwire_protocol::envelope::{ClientMessage, ServerMessage};

use crate::transport::TransportError;

/// Performs the `auth_required` / `auth` / `auth_ok` exchange on a freshly
/// opened socket, before any pump is running.
///
/// Returns the hub version reported by the hub, if any.
pub(crate) async fn authenticate<W, R>(
    write: &mut W,
    read: &mut R,
    access_token: &str,
) -> Result<Option<String>, TransportError>
where
    W: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
    R: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let greeting = next_server_message(read).await?;
    if greeting.msg_type != MessageType::AuthRequired {
        return Err(TransportError::Handshake(format!(
            "expected auth_required, got {:?}",
            greeting.msg_type
        )));
    }

    let auth = ClientMessage::Auth {
        access_token: access_token.to_string(),
    };
    let json = serde_json::to_string(&auth)?;
    write.send(tungstenite::Message::Text(json.into())).await?;

    let reply = next_server_message(read).await?;
    match reply.msg_type {
        MessageType::AuthOk => {
            let version = reply.hub_version.or(greeting.hub_version);
            debug!(hub_version = ?version, "authenticated");
            Ok(version)
        }
        MessageType::AuthInvalid => Err(TransportError::AuthInvalid(
            reply.message.unwrap_or_else(|| "auth_invalid".into()),
        )),
        other => Err(TransportError::Handshake(format!(
            "expected auth_ok or auth_invalid, got {other:?}"
        ))),
    }
}

/// Reads until the next text frame and parses it. Control frames are skipped.
async fn next_server_message<R>(read: &mut R) -> Result<ServerMessage, TransportError>
where
    R: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(tungstenite::Message::Text(text))) => {
                return Ok(serde_json::from_str(&text)?);
            }
            Some(Ok(tungstenite::Message::Close(_))) | None => return Err(TransportError::Closed),
            Some(Ok(other)) => trace!(?other, "skipping non-text frame during handshake"),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
