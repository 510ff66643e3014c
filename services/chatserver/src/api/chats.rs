//! Group chat creation and deletion.
use super::error::{self, ApiError};
use super::types::{CreateGroupRequest, CreatedGroupResponse};
use crate::app::AppState;
use crate::auth::AuthUser;
use crate::model::ChatType;
use crate::store::{ChatStore, StoreError};
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

#[utoipa::path(
    post,
    path = "/chats",
    tag = "chats",
    request_body = CreateGroupRequest,
    responses(
        (status = 201, description = "Group created", body = CreatedGroupResponse),
        (status = 400, description = "Invalid name", body = super::error::ErrorResponse)
    )
)]
pub async fn create_group(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(body): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(error::invalid_request("group name must not be empty"));
    }
    let group_id = state
        .store
        .create_group_chat(name, user_id)
        .await
        .map_err(|err| error::internal("failed to create group", &err))?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedGroupResponse { group_id }),
    ))
}

// Deleting a group cascades to members, messages and receipts; only the
// group's author may do it.
#[utoipa::path(
    delete,
    path = "/chats/{chat_id}",
    tag = "chats",
    params(("chat_id" = i64, Path, description = "Group chat identifier")),
    responses(
        (status = 200, description = "Group deleted"),
        (status = 403, description = "Caller is not the author", body = super::error::ErrorResponse),
        (status = 404, description = "No such group", body = super::error::ErrorResponse)
    )
)]
pub async fn delete_group(
    Path(chat_id): Path<i64>,
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<StatusCode, ApiError> {
    let chat = match state.store.chat(chat_id).await {
        Ok(chat) => chat,
        Err(StoreError::NotFound(_)) => return Err(error::not_found("chat not found")),
        Err(err) => return Err(error::internal("failed to load chat", &err)),
    };
    if chat.chat_type != ChatType::Group {
        return Err(error::not_found("chat is not a group"));
    }
    if chat.author_id != Some(user_id) {
        return Err(error::forbidden("only the group author may delete it"));
    }
    match state.store.delete_group_chat(chat_id).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(StoreError::NotFound(_)) => Err(error::not_found("chat not found")),
        Err(err) => Err(error::internal("failed to delete group", &err)),
    }
}
