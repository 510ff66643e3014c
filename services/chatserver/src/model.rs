//! Domain types for chats, memberships, messages and receipts.
//!
//! The string values of the enums below are wire and storage constants:
//! they appear verbatim in JSON responses and in the `chats`, `chat_members`
//! and `message_status` tables, so the serde renames are contracts.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Shape of a chat, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum ChatType {
    #[serde(rename = "PRIVATE")]
    Private,
    #[serde(rename = "GROUP")]
    Group,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Private => "PRIVATE",
            ChatType::Group => "GROUP",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PRIVATE" => Some(ChatType::Private),
            "GROUP" => Some(ChatType::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum MemberRole {
    #[serde(rename = "ADMIN")]
    Admin,
    #[serde(rename = "MEMBER")]
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Admin => "ADMIN",
            MemberRole::Member => "MEMBER",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ADMIN" => Some(MemberRole::Admin),
            "MEMBER" => Some(MemberRole::Member),
            _ => None,
        }
    }
}

/// Per-recipient delivery state. Transitions are monotone:
/// SENT -> DELIVERED -> READ, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub enum ReceiptStatus {
    #[serde(rename = "SENT")]
    Sent,
    #[serde(rename = "DELIVERED")]
    Delivered,
    #[serde(rename = "READ")]
    Read,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Sent => "SENT",
            ReceiptStatus::Delivered => "DELIVERED",
            ReceiptStatus::Read => "READ",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SENT" => Some(ReceiptStatus::Sent),
            "DELIVERED" => Some(ReceiptStatus::Delivered),
            "READ" => Some(ReceiptStatus::Read),
            _ => None,
        }
    }
}

/// What a message row records: a user message or a membership event.
/// EDIT and DELETE are terminal markers on an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum MessageEvent {
    #[serde(rename = "SEND")]
    Send,
    #[serde(rename = "NEW_MEMBER")]
    NewMember,
    #[serde(rename = "LEFT_MEMBER")]
    LeftMember,
    #[serde(rename = "KICKED_MEMBER")]
    KickedMember,
    #[serde(rename = "EDIT")]
    Edit,
    #[serde(rename = "DELETE")]
    Delete,
}

impl MessageEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageEvent::Send => "SEND",
            MessageEvent::NewMember => "NEW_MEMBER",
            MessageEvent::LeftMember => "LEFT_MEMBER",
            MessageEvent::KickedMember => "KICKED_MEMBER",
            MessageEvent::Edit => "EDIT",
            MessageEvent::Delete => "DELETE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SEND" => Some(MessageEvent::Send),
            "NEW_MEMBER" => Some(MessageEvent::NewMember),
            "LEFT_MEMBER" => Some(MessageEvent::LeftMember),
            "KICKED_MEMBER" => Some(MessageEvent::KickedMember),
            "EDIT" => Some(MessageEvent::Edit),
            "DELETE" => Some(MessageEvent::Delete),
            _ => None,
        }
    }
}

/// How a group membership ends. Drives the membership event message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum RemovalKind {
    #[serde(rename = "LEFT")]
    Left,
    #[serde(rename = "KICKED")]
    Kicked,
}

impl RemovalKind {
    pub fn event(&self) -> MessageEvent {
        match self {
            RemovalKind::Left => MessageEvent::LeftMember,
            RemovalKind::Kicked => MessageEvent::KickedMember,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChatMember {
    pub user_id: i64,
    pub role: MemberRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub from_user_id: i64,
    pub event_type: MessageEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub message_id: i64,
    pub user_id: i64,
    pub status: ReceiptStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_values_round_trip_through_strings() {
        for status in [
            ReceiptStatus::Sent,
            ReceiptStatus::Delivered,
            ReceiptStatus::Read,
        ] {
            assert_eq!(ReceiptStatus::parse(status.as_str()), Some(status));
        }
        for event in [
            MessageEvent::Send,
            MessageEvent::NewMember,
            MessageEvent::LeftMember,
            MessageEvent::KickedMember,
            MessageEvent::Edit,
            MessageEvent::Delete,
        ] {
            assert_eq!(MessageEvent::parse(event.as_str()), Some(event));
        }
        assert_eq!(ChatType::parse("PRIVATE"), Some(ChatType::Private));
        assert_eq!(MemberRole::parse("nope"), None);
    }

    #[test]
    fn receipt_status_ordering_matches_progression() {
        assert!(ReceiptStatus::Sent < ReceiptStatus::Delivered);
        assert!(ReceiptStatus::Delivered < ReceiptStatus::Read);
    }

    #[test]
    fn removal_kind_maps_to_membership_events() {
        assert_eq!(RemovalKind::Left.event(), MessageEvent::LeftMember);
        assert_eq!(RemovalKind::Kicked.event(), MessageEvent::KickedMember);
    }
}
