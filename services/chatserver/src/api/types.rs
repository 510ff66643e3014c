//! Request and response bodies for the HTTP surface.
use crate::model::{Chat, ChatMember, MemberRole, Message, RemovalKind};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreatedGroupResponse {
    pub group_id: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AddMemberRequest {
    pub user_id: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RemoveMemberRequest {
    #[serde(rename = "type")]
    pub kind: RemovalKind,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChangeRoleRequest {
    pub role: MemberRole,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MemberListResponse {
    pub items: Vec<ChatMember>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChatListResponse {
    pub items: Vec<Chat>,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct PaginateRequest {
    #[serde(default)]
    pub cursor: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PaginateResponse {
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_cursor: Option<i64>,
    pub has_more: bool,
}
