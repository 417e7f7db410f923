use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time allowed for the authentication exchange after the socket opens.
pub const WS_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Read deadline: if *nothing* arrives within this window (no pong, no
/// result, no event) the connection is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send keepalive pings (must be < [`WS_PONG_WAIT`]).
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Maximum message size in bytes (16 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Timeout for command/result round trips.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Authentication
    #[serde(rename = "auth_required")]
    AuthRequired,
    #[serde(rename = "auth")]
    Auth,
    #[serde(rename = "auth_ok")]
    AuthOk,
    #[serde(rename = "auth_invalid")]
    AuthInvalid,

    // Commands from client to hub
    #[serde(rename = "subscribe_events")]
    SubscribeEvents,
    #[serde(rename = "unsubscribe_events")]
    UnsubscribeEvents,
    #[serde(rename = "get_states")]
    GetStates,
    #[serde(rename = "call_service")]
    CallService,
    #[serde(rename = "ping")]
    Ping,

    // Replies and pushes from hub to client
    #[serde(rename = "result")]
    Result,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "event")]
    Event,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Error codes the hub reports inside a failed `result`.
pub const ERR_CODE_NOT_FOUND: &str = "not_found";
pub const ERR_CODE_INVALID_FORMAT: &str = "invalid_format";
pub const ERR_CODE_UNAUTHORIZED: &str = "unauthorized";
pub const ERR_CODE_UNKNOWN_COMMAND: &str = "unknown_command";
pub const ERR_CODE_SERVICE_VALIDATION: &str = "service_validation_error";
