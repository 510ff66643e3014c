//! Group membership management with realtime fan-out.
//!
//! Membership changes are also messages (NEW_MEMBER / LEFT_MEMBER /
//! KICKED_MEMBER rows with receipts), so offline members catch up on them
//! exactly like on ordinary messages. The live fan-out here is the
//! best-effort half.
use super::error::{self, ApiError};
use super::types::{AddMemberRequest, ChangeRoleRequest, MemberListResponse, RemoveMemberRequest};
use crate::app::AppState;
use crate::auth::AuthUser;
use crate::model::{MemberRole, RemovalKind};
use crate::store::{ChatStore, StoreError};
use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use murmur_wire::{ChatListChange, Envelope, EventKind, MembershipChange};

async fn require_admin(state: &AppState, user_id: i64, chat_id: i64) -> Result<(), ApiError> {
    match state.store.member_role(user_id, chat_id).await {
        Ok(MemberRole::Admin) => Ok(()),
        Ok(MemberRole::Member) => Err(error::forbidden("admin role required")),
        Err(StoreError::NotFound(_)) => Err(error::forbidden("caller is not a chat member")),
        Err(err) => Err(error::internal("failed to load member role", &err)),
    }
}

/// Fan a membership event out to current members, excluding `skip`.
async fn notify_members(state: &AppState, chat_id: i64, skip: i64, envelope: &Envelope) {
    let members = match state.store.chat_members(chat_id).await {
        Ok(members) => members,
        Err(err) => {
            tracing::error!(chat_id, error = %err, "failed to load members for fan-out");
            return;
        }
    };
    for member in members {
        if member.user_id == skip {
            continue;
        }
        state.delivery.deliver(member.user_id, envelope).await;
    }
}

#[utoipa::path(
    post,
    path = "/chats/{chat_id}/members",
    tag = "members",
    params(("chat_id" = i64, Path, description = "Group chat identifier")),
    request_body = AddMemberRequest,
    responses(
        (status = 201, description = "Member added"),
        (status = 404, description = "No such group", body = super::error::ErrorResponse),
        (status = 409, description = "Already a member", body = super::error::ErrorResponse)
    )
)]
pub async fn add_member(
    Path(chat_id): Path<i64>,
    State(state): State<AppState>,
    Extension(AuthUser(_user_id)): Extension<AuthUser>,
    Json(body): Json<AddMemberRequest>,
) -> Result<StatusCode, ApiError> {
    let message_id = match state.store.add_group_member(chat_id, body.user_id).await {
        Ok(message_id) => message_id,
        Err(StoreError::Conflict(_)) => {
            return Err(error::already_exists("user is already a member"));
        }
        Err(StoreError::NotFound(_)) => return Err(error::not_found("chat not found")),
        Err(err) => return Err(error::internal("failed to add member", &err)),
    };

    // The invitee refreshes their chat list; everyone else sees the join.
    if let Ok(invited) = Envelope::new(EventKind::InvitedToChat, &ChatListChange { chat_id }) {
        state.delivery.deliver(body.user_id, &invited).await;
    }
    if let Ok(joined) = Envelope::new(
        EventKind::NewMember,
        &MembershipChange {
            message_id,
            chat_id,
            user_id: body.user_id,
        },
    ) {
        notify_members(&state, chat_id, body.user_id, &joined).await;
    }
    Ok(StatusCode::CREATED)
}

#[utoipa::path(
    delete,
    path = "/chats/{chat_id}/members/{user_id}",
    tag = "members",
    params(
        ("chat_id" = i64, Path, description = "Group chat identifier"),
        ("user_id" = i64, Path, description = "Member to remove")
    ),
    request_body = RemoveMemberRequest,
    responses(
        (status = 200, description = "Member removed"),
        (status = 403, description = "Admin role required", body = super::error::ErrorResponse),
        (status = 404, description = "No such member", body = super::error::ErrorResponse)
    )
)]
pub async fn remove_member(
    Path((chat_id, target_id)): Path<(i64, i64)>,
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(body): Json<RemoveMemberRequest>,
) -> Result<StatusCode, ApiError> {
    // Self-leave is always allowed; removing anyone else takes an admin.
    if target_id != user_id {
        require_admin(&state, user_id, chat_id).await?;
    }

    let message_id = match state
        .store
        .remove_group_member(chat_id, target_id, body.kind)
        .await
    {
        Ok(message_id) => message_id,
        Err(StoreError::NotFound(_)) => return Err(error::not_found("member not found")),
        Err(err) => return Err(error::internal("failed to remove member", &err)),
    };

    // A kicked user did not initiate the change, so they get told.
    if body.kind == RemovalKind::Kicked {
        if let Ok(removed) =
            Envelope::new(EventKind::DeletedFromChat, &ChatListChange { chat_id })
        {
            state.delivery.deliver(target_id, &removed).await;
        }
    }

    let kind = match body.kind {
        RemovalKind::Left => EventKind::LeftMember,
        RemovalKind::Kicked => EventKind::KickedMember,
    };
    if let Ok(event) = Envelope::new(
        kind,
        &MembershipChange {
            message_id,
            chat_id,
            user_id: target_id,
        },
    ) {
        notify_members(&state, chat_id, target_id, &event).await;
    }
    Ok(StatusCode::OK)
}

#[utoipa::path(
    patch,
    path = "/chats/{chat_id}/members/{user_id}",
    tag = "members",
    params(
        ("chat_id" = i64, Path, description = "Group chat identifier"),
        ("user_id" = i64, Path, description = "Member whose role changes")
    ),
    request_body = ChangeRoleRequest,
    responses(
        (status = 200, description = "Role changed"),
        (status = 403, description = "Admin role required", body = super::error::ErrorResponse),
        (status = 404, description = "No such member", body = super::error::ErrorResponse)
    )
)]
pub async fn change_role(
    Path((chat_id, target_id)): Path<(i64, i64)>,
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(body): Json<ChangeRoleRequest>,
) -> Result<StatusCode, ApiError> {
    require_admin(&state, user_id, chat_id).await?;
    match state
        .store
        .change_member_role(chat_id, target_id, body.role)
        .await
    {
        Ok(()) => Ok(StatusCode::OK),
        Err(StoreError::NotFound(_)) => Err(error::not_found("member not found")),
        Err(err) => Err(error::internal("failed to change role", &err)),
    }
}

#[utoipa::path(
    get,
    path = "/chats/{chat_id}/members",
    tag = "members",
    params(("chat_id" = i64, Path, description = "Chat identifier")),
    responses(
        (status = 200, description = "Member list", body = MemberListResponse)
    )
)]
pub async fn list_members(
    Path(chat_id): Path<i64>,
    State(state): State<AppState>,
    Extension(AuthUser(_user_id)): Extension<AuthUser>,
) -> Result<Json<MemberListResponse>, ApiError> {
    let items = state
        .store
        .chat_members(chat_id)
        .await
        .map_err(|err| error::internal("failed to list members", &err))?;
    Ok(Json(MemberListResponse { items }))
}
