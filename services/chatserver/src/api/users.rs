//! Per-user chat listing and history pagination.
use super::error::{self, ApiError};
use super::types::{ChatListResponse, PaginateRequest, PaginateResponse};
use crate::app::AppState;
use crate::auth::AuthUser;
use crate::store::{ChatStore, StoreError};
use axum::Json;
use axum::extract::{Extension, Path, State};

#[utoipa::path(
    get,
    path = "/users/chats",
    tag = "users",
    responses(
        (status = 200, description = "Chats the caller belongs to", body = ChatListResponse)
    )
)]
pub async fn user_chats(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<ChatListResponse>, ApiError> {
    let items = state
        .store
        .user_chats(user_id)
        .await
        .map_err(|err| error::internal("failed to list chats", &err))?;
    Ok(Json(ChatListResponse { items }))
}

// Cursor pagination, newest first: 20 rows per page, `new_cursor` feeds the
// next request, `has_more` says whether to bother.
#[utoipa::path(
    get,
    path = "/users/chat/{chat_id}",
    tag = "users",
    params(("chat_id" = i64, Path, description = "Chat identifier")),
    request_body(content = PaginateRequest, description = "Optional cursor"),
    responses(
        (status = 200, description = "History page", body = PaginateResponse),
        (status = 403, description = "Caller is not a member", body = super::error::ErrorResponse)
    )
)]
pub async fn paginate_chat(
    Path(chat_id): Path<i64>,
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    body: Option<Json<PaginateRequest>>,
) -> Result<Json<PaginateResponse>, ApiError> {
    // History is only visible to members.
    match state.store.member_role(user_id, chat_id).await {
        Ok(_) => {}
        Err(StoreError::NotFound(_)) => {
            return Err(error::forbidden("caller is not a chat member"));
        }
        Err(err) => return Err(error::internal("failed to load member role", &err)),
    }

    let cursor = body.and_then(|Json(body)| body.cursor);
    let page = state
        .store
        .paginate_chat(chat_id, cursor)
        .await
        .map_err(|err| error::internal("failed to paginate chat", &err))?;
    Ok(Json(PaginateResponse {
        messages: page.messages,
        new_cursor: page.next_cursor,
        has_more: page.has_more,
    }))
}
