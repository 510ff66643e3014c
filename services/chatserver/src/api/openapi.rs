//! OpenAPI document for the HTTP surface.
//!
//! The websocket protocol is documented in the wire crate; only the HTTP
//! routes appear here.
use super::error::ErrorResponse;
use super::types::{
    AddMemberRequest, ChangeRoleRequest, ChatListResponse, CreateGroupRequest,
    CreatedGroupResponse, MemberListResponse, PaginateRequest, PaginateResponse,
    RemoveMemberRequest,
};
use super::HealthStatus;
use crate::model::{Chat, ChatMember, ChatType, MemberRole, Message, MessageEvent, RemovalKind};
use axum::Json;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "murmur-chatserver",
        version = "v1",
        description = "Realtime chat backend HTTP API"
    ),
    paths(
        super::system_health,
        super::chats::create_group,
        super::chats::delete_group,
        super::members::add_member,
        super::members::remove_member,
        super::members::change_role,
        super::members::list_members,
        super::users::user_chats,
        super::users::paginate_chat,
    ),
    components(schemas(
        HealthStatus,
        ErrorResponse,
        CreateGroupRequest,
        CreatedGroupResponse,
        AddMemberRequest,
        RemoveMemberRequest,
        ChangeRoleRequest,
        MemberListResponse,
        ChatListResponse,
        PaginateRequest,
        PaginateResponse,
        Chat,
        ChatMember,
        ChatType,
        MemberRole,
        Message,
        MessageEvent,
        RemovalKind,
    )),
    tags(
        (name = "system", description = "Health and discovery"),
        (name = "chats", description = "Group chat management"),
        (name = "members", description = "Membership management"),
        (name = "users", description = "Per-user views")
    )
)]
pub struct ApiDoc;

pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
