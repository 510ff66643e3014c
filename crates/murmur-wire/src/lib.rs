// JSON wire format shared by the websocket handler and the fan-out bus.
//
// Everything on the wire is a tagged object: `{"type": "<kind>", "data": {...}}`
// for server->client events, and a flat object with a `type` discriminator for
// client->server commands. Inbound frames are decoded in two steps (probe the
// discriminator, then decode the kind-specific shape) so a bad payload never
// yields a half-populated command.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame is missing the type discriminator")]
    MissingType,
    #[error("unknown frame type {0:?}")]
    UnknownType(String),
    #[error("malformed {kind} payload: {source}")]
    MalformedPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Server-to-client event kinds.
///
/// The two SCREAMING_CASE variants and the lowercase rest mirror the values
/// clients already match on; they are wire constants, not style choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "message_confirmed")]
    MessageConfirmed,
    #[serde(rename = "new_message")]
    NewMessage,
    #[serde(rename = "edit_message")]
    EditMessage,
    #[serde(rename = "delete_message")]
    DeleteMessage,
    #[serde(rename = "message_delivered")]
    MessageDelivered,
    #[serde(rename = "message_read")]
    MessageRead,
    #[serde(rename = "new_chat")]
    NewChat,
    #[serde(rename = "new_member")]
    NewMember,
    #[serde(rename = "left_member")]
    LeftMember,
    #[serde(rename = "kicked_member")]
    KickedMember,
    #[serde(rename = "INVITED_TO_CHAT")]
    InvitedToChat,
    #[serde(rename = "DELETED_FROM_CHAT")]
    DeletedFromChat,
    #[serde(rename = "PRESENCE_CHANGE")]
    PresenceChange,
}

impl EventKind {
    /// Kinds that carry a persisted message and therefore advance the
    /// recipient's receipt to DELIVERED when written to an endpoint.
    pub fn is_message_bearing(&self) -> bool {
        matches!(
            self,
            EventKind::NewMessage
                | EventKind::NewMember
                | EventKind::LeftMember
                | EventKind::KickedMember
        )
    }
}

/// Tagged event envelope published on the bus and written to endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: EventKind, data: &T) -> Result<Self> {
        Ok(Self {
            kind,
            data: serde_json::to_value(data)?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Message id carried by message-bearing payloads; `None` for the rest.
    pub fn message_id(&self) -> Option<i64> {
        if !self.kind.is_message_bearing() {
            return None;
        }
        self.data.get("message_id").and_then(Value::as_i64)
    }
}

// --- event payloads -------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageConfirmed {
    pub temp_message_id: String,
    pub message_id: i64,
    pub chat_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_chat_id: Option<String>,
    pub created_chat: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub from_user_id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditedMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub new_content: String,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedMessage {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredReceipt {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub chat_id: i64,
    pub user_id: i64,
    pub up_to_id: i64,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChat {
    pub chat_id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
    pub with_user_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Body of `new_member`/`left_member`/`kicked_member` events. Carries the
/// membership event message id so receiving endpoints can acknowledge it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub message_id: i64,
    pub chat_id: i64,
    pub user_id: i64,
}

/// Body of `INVITED_TO_CHAT`/`DELETED_FROM_CHAT`: tells the affected user to
/// refresh their chat list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatListChange {
    pub chat_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceChange {
    pub user_id: i64,
    pub presence: bool,
    pub timestamp: DateTime<Utc>,
}

// --- inbound commands -----------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendMessage {
    pub temp_message_id: String,
    pub content: String,
    // Either the chat already exists...
    #[serde(default)]
    pub chat_id: Option<i64>,
    // ...or the client is opening a fresh private chat.
    #[serde(default)]
    pub temp_chat_id: Option<String>,
    #[serde(default)]
    pub to_user_id: Option<i64>,
    #[serde(default)]
    pub client_send_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EditMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub content: String,
    pub temp_message_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeleteMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub temp_message_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeliveredAck {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadAck {
    pub chat_id: i64,
    pub up_to_id: i64,
}

/// Client-to-server frame, dispatched on the `type` discriminator.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    SendMessage(SendMessage),
    EditMessage(EditMessage),
    DeleteMessage(DeleteMessage),
    MessageDelivered(DeliveredAck),
    MessageRead(ReadAck),
}

#[derive(Deserialize)]
struct FrameProbe {
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl ClientFrame {
    pub fn decode(raw: &[u8]) -> Result<Self> {
        // Step one: only look at the discriminator.
        let probe: FrameProbe = serde_json::from_slice(raw)?;
        let kind = probe.kind.ok_or(Error::MissingType)?;

        // Step two: decode the full, kind-specific shape.
        fn payload<T: for<'de> Deserialize<'de>>(
            raw: &[u8],
            kind: &'static str,
        ) -> Result<T> {
            serde_json::from_slice(raw)
                .map_err(|source| Error::MalformedPayload { kind, source })
        }

        match kind.as_str() {
            "send_message" => Ok(Self::SendMessage(payload(raw, "send_message")?)),
            "edit_message" => Ok(Self::EditMessage(payload(raw, "edit_message")?)),
            "delete_message" => Ok(Self::DeleteMessage(payload(raw, "delete_message")?)),
            "message_delivered" => {
                Ok(Self::MessageDelivered(payload(raw, "message_delivered")?))
            }
            "message_read" => Ok(Self::MessageRead(payload(raw, "message_read")?)),
            _ => Err(Error::UnknownType(kind)),
        }
    }
}
