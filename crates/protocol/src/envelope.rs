use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::MessageType;
use crate::types::HubEvent;

/// Error details carried by a failed `result` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Frames sent from the client to the hub.
///
/// Every command except `auth` carries an `id` that the hub echoes back in
/// its `result`/`pong` reply and in every `event` pushed for a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        access_token: String,
    },
    SubscribeEvents {
        id: u64,
        event_type: String,
    },
    UnsubscribeEvents {
        id: u64,
        subscription: u64,
    },
    GetStates {
        id: u64,
    },
    CallService {
        id: u64,
        domain: String,
        service: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_data: Option<serde_json::Value>,
    },
    Ping {
        id: u64,
    },
}

impl ClientMessage {
    /// Returns the command id, or `None` for the `auth` frame.
    pub fn id(&self) -> Option<u64> {
        match self {
            ClientMessage::Auth { .. } => None,
            ClientMessage::SubscribeEvents { id, .. }
            | ClientMessage::UnsubscribeEvents { id, .. }
            | ClientMessage::GetStates { id }
            | ClientMessage::CallService { id, .. }
            | ClientMessage::Ping { id } => Some(*id),
        }
    }

    /// Returns the wire type of this frame.
    pub fn msg_type(&self) -> MessageType {
        match self {
            ClientMessage::Auth { .. } => MessageType::Auth,
            ClientMessage::SubscribeEvents { .. } => MessageType::SubscribeEvents,
            ClientMessage::UnsubscribeEvents { .. } => MessageType::UnsubscribeEvents,
            ClientMessage::GetStates { .. } => MessageType::GetStates,
            ClientMessage::CallService { .. } => MessageType::CallService,
            ClientMessage::Ping { .. } => MessageType::Ping,
        }
    }
}

/// Frames sent from the hub to the client.
///
/// Kept flat (rather than a tagged enum) so the `result` payload can stay a
/// `RawValue` and be parsed lazily by whoever is waiting for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<serde_json::value::RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<HubEvent>,
    /// Human-readable reason attached to `auth_invalid`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_version: Option<String>,
}

impl ServerMessage {
    fn bare(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            id: None,
            success: None,
            result: None,
            error: None,
            event: None,
            message: None,
            hub_version: None,
        }
    }

    /// Creates the greeting the hub sends when a socket opens.
    pub fn auth_required(hub_version: impl Into<String>) -> Self {
        Self {
            hub_version: Some(hub_version.into()),
            ..Self::bare(MessageType::AuthRequired)
        }
    }

    /// Creates an `auth_ok` frame.
    pub fn auth_ok(hub_version: impl Into<String>) -> Self {
        Self {
            hub_version: Some(hub_version.into()),
            ..Self::bare(MessageType::AuthOk)
        }
    }

    /// Creates an `auth_invalid` frame with the rejection reason.
    pub fn auth_invalid(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare(MessageType::AuthInvalid)
        }
    }

    /// Creates a successful `result` reply for command `id`.
    pub fn result_ok<T: Serialize>(id: u64, result: Option<&T>) -> Result<Self, serde_json::Error> {
        let raw = match result {
            Some(r) => {
                let json = serde_json::to_string(r)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            id: Some(id),
            success: Some(true),
            result: raw,
            ..Self::bare(MessageType::Result)
        })
    }

    /// Creates a failed `result` reply for command `id`.
    pub fn result_error(id: u64, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            success: Some(false),
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
            ..Self::bare(MessageType::Result)
        }
    }

    /// Creates an `event` push for the subscription opened by command `id`.
    pub fn event(id: u64, event: HubEvent) -> Self {
        Self {
            id: Some(id),
            event: Some(event),
            ..Self::bare(MessageType::Event)
        }
    }

    /// Creates a `pong` reply for ping command `id`.
    pub fn pong(id: u64) -> Self {
        Self {
            id: Some(id),
            ..Self::bare(MessageType::Pong)
        }
    }

    /// Returns `true` for a `result` frame that reports success, and for `pong`.
    pub fn is_success(&self) -> bool {
        match self.msg_type {
            MessageType::Pong => true,
            MessageType::Result => self.success.unwrap_or(false),
            _ => false,
        }
    }

    /// Deserializes the `result` payload into the given type.
    pub fn parse_result<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.result {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }
}
