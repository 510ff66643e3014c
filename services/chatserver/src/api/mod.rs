//! HTTP surface for chat management.
//!
//! The realtime path lives on `/ws`; everything here is the thin CRUD
//! surface around it. Handlers talk to the store directly and hand fan-out
//! events to the delivery engine, mapping store errors onto the taxonomy in
//! [`error`].
use crate::app::AppState;
use crate::store::ChatStore;
use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod chats;
pub mod error;
pub mod members;
pub mod openapi;
pub mod types;
pub mod users;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthStatus {
    pub status: String,
}

/// Liveness endpoint; checks the store so a dead database shows up here.
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "system",
    responses(
        (status = 200, description = "Service healthy", body = HealthStatus),
        (status = 500, description = "Storage unavailable", body = error::ErrorResponse)
    )
)]
pub async fn system_health(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, error::ApiError> {
    if let Err(err) = state.store.health_check().await {
        return Err(error::internal("storage unavailable", &err));
    }
    Ok(Json(HealthStatus {
        status: "ok".to_string(),
    }))
}
