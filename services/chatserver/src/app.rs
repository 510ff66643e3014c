//! HTTP application wiring.
//!
//! Builds the axum router, attaches the auth middleware and tracing layer,
//! and defines the shared state injected into handlers. Route composition
//! lives here so `main` stays small and the whole surface is testable with
//! `tower::ServiceExt::oneshot`.
use crate::api;
use crate::auth;
use crate::delivery::Delivery;
use crate::heartbeat::HeartbeatEngine;
use crate::hub::Hub;
use crate::observability;
use crate::store::ChatStore;
use crate::ws;
use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post};
use murmur_bus::Bus;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub bus: Arc<dyn Bus>,
    pub delivery: Arc<Delivery>,
    pub heartbeat: Arc<HeartbeatEngine>,
    pub hub: Hub,
    pub jwt_secret: String,
    pub shutdown: CancellationToken,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ChatStore>,
        bus: Arc<dyn Bus>,
        delivery: Arc<Delivery>,
        heartbeat: Arc<HeartbeatEngine>,
        hub: Hub,
        jwt_secret: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            bus,
            delivery,
            heartbeat,
            hub,
            jwt_secret,
            shutdown,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            let parent = observability::trace_context_from_headers(request.headers());
            let span = tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
            );
            span.set_parent(parent);
            span
        });

    let protected = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/chats", post(api::chats::create_group))
        .route("/chats/:chat_id", delete(api::chats::delete_group))
        .route(
            "/chats/:chat_id/members",
            get(api::members::list_members).post(api::members::add_member),
        )
        .route(
            "/chats/:chat_id/members/:user_id",
            delete(api::members::remove_member).patch(api::members::change_role),
        )
        .route("/users/chats", get(api::users::user_chats))
        .route("/users/chat/:chat_id", get(api::users::paginate_chat))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .merge(protected)
        .route("/healthz", get(api::system_health))
        .route("/openapi.json", get(api::openapi::openapi_json))
        .layer(trace_layer)
        .with_state(state)
}
