//! HTTP surface tests against in-memory backends.
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chatserver::app::{AppState, build_router};
use chatserver::auth::mint_access_token;
use chatserver::delivery::Delivery;
use chatserver::heartbeat::{HeartbeatEngine, HeartbeatParams};
use chatserver::hub::Hub;
use chatserver::presence::MemoryPresence;
use chatserver::store::ChatStore;
use chatserver::store::memory::MemoryStore;
use murmur_bus::MemoryBus;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const SECRET: &str = "integration-secret";

struct TestApp {
    router: Router,
    store: MemoryStore,
}

fn test_app() -> TestApp {
    let params = HeartbeatParams::default();
    let store = MemoryStore::new();
    let bus = Arc::new(MemoryBus::new());
    let presence = Arc::new(MemoryPresence::new());
    let delivery = Arc::new(Delivery::new(bus.clone(), presence.clone(), params));
    let heartbeat = Arc::new(HeartbeatEngine::new(
        presence,
        Arc::new(store.clone()),
        delivery.clone(),
        params,
    ));
    let state = AppState::new(
        Arc::new(store.clone()),
        bus,
        delivery,
        heartbeat,
        Hub::spawn(),
        SECRET.to_string(),
        CancellationToken::new(),
    );
    TestApp {
        router: build_router(state),
        store,
    }
}

fn bearer(user_id: i64) -> String {
    let token = mint_access_token(user_id, SECRET, Duration::from_secs(300)).expect("mint");
    format!("Bearer {token}")
}

fn json_request(method: &str, uri: &str, user_id: i64, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", bearer(user_id))
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn bare_request(method: &str, uri: &str, user_id: i64) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", bearer(user_id))
        .body(Body::empty())
        .expect("request")
}

async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn requests_without_a_token_are_unauthorized() {
    let app = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/chats")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::json!({"name": "room"}).to_string()))
        .expect("request");
    let response = app.router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let payload = read_json(response).await;
    assert_eq!(payload["code"], "Unauthorized");
}

#[tokio::test]
async fn garbage_tokens_are_rejected_with_token_invalid() {
    let app = test_app();
    let request = Request::builder()
        .method("GET")
        .uri("/users/chats")
        .header("authorization", "Bearer garbage")
        .body(Body::empty())
        .expect("request");
    let response = app.router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let payload = read_json(response).await;
    assert_eq!(payload["code"], "TOKEN_INVALID");
}

#[tokio::test]
async fn group_lifecycle_create_add_list_delete() {
    let app = test_app();

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/chats",
            1,
            serde_json::json!({"name": "launch"}),
        ))
        .await
        .expect("create");
    assert_eq!(response.status(), StatusCode::CREATED);
    let payload = read_json(response).await;
    let group_id = payload["group_id"].as_i64().expect("group_id");

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/chats/{group_id}/members"),
            1,
            serde_json::json!({"user_id": 2}),
        ))
        .await
        .expect("add");
    assert_eq!(response.status(), StatusCode::CREATED);

    // Adding the same member again conflicts.
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/chats/{group_id}/members"),
            1,
            serde_json::json!({"user_id": 2}),
        ))
        .await
        .expect("add again");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let payload = read_json(response).await;
    assert_eq!(payload["code"], "ALREADY_EXISTS");

    let response = app
        .router
        .clone()
        .oneshot(bare_request(
            "GET",
            &format!("/chats/{group_id}/members"),
            1,
        ))
        .await
        .expect("list");
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    assert_eq!(payload["items"].as_array().expect("items").len(), 2);

    // Non-author cannot delete the group.
    let response = app
        .router
        .clone()
        .oneshot(bare_request("DELETE", &format!("/chats/{group_id}"), 2))
        .await
        .expect("delete as member");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .router
        .clone()
        .oneshot(bare_request("DELETE", &format!("/chats/{group_id}"), 1))
        .await
        .expect("delete as author");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn kick_by_non_admin_is_forbidden_and_changes_nothing() {
    let app = test_app();
    let chat_id = app.store.create_group_chat("room", 1).await.expect("group");
    app.store.add_group_member(chat_id, 3).await.expect("member");
    app.store.add_group_member(chat_id, 4).await.expect("member");

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "DELETE",
            &format!("/chats/{chat_id}/members/4"),
            3,
            serde_json::json!({"type": "KICKED"}),
        ))
        .await
        .expect("kick");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let payload = read_json(response).await;
    assert_eq!(payload["code"], "FORBIDDEN");

    let members = app.store.chat_members(chat_id).await.expect("members");
    assert!(members.iter().any(|m| m.user_id == 4), "membership intact");
}

#[tokio::test]
async fn members_may_leave_on_their_own() {
    let app = test_app();
    let chat_id = app.store.create_group_chat("room", 1).await.expect("group");
    app.store.add_group_member(chat_id, 3).await.expect("member");

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "DELETE",
            &format!("/chats/{chat_id}/members/3"),
            3,
            serde_json::json!({"type": "LEFT"}),
        ))
        .await
        .expect("leave");
    assert_eq!(response.status(), StatusCode::OK);
    let members = app.store.chat_members(chat_id).await.expect("members");
    assert!(!members.iter().any(|m| m.user_id == 3));
}

#[tokio::test]
async fn admins_can_promote_and_promoted_members_can_kick() {
    let app = test_app();
    let chat_id = app.store.create_group_chat("room", 1).await.expect("group");
    app.store.add_group_member(chat_id, 2).await.expect("member");
    app.store.add_group_member(chat_id, 3).await.expect("member");

    // Member 2 cannot change roles yet.
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/chats/{chat_id}/members/2"),
            2,
            serde_json::json!({"role": "ADMIN"}),
        ))
        .await
        .expect("self promote");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/chats/{chat_id}/members/2"),
            1,
            serde_json::json!({"role": "ADMIN"}),
        ))
        .await
        .expect("promote");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "DELETE",
            &format!("/chats/{chat_id}/members/3"),
            2,
            serde_json::json!({"type": "KICKED"}),
        ))
        .await
        .expect("kick");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn pagination_pages_through_history() {
    let app = test_app();
    let (chat_id, _) = app
        .store
        .get_or_create_private_chat(1, 2)
        .await
        .expect("chat");
    for n in 0..25 {
        app.store
            .insert_message(
                chat_id,
                1,
                chatserver::model::MessageEvent::Send,
                Some(&format!("m{n}")),
            )
            .await
            .expect("insert");
    }

    let response = app
        .router
        .clone()
        .oneshot(bare_request("GET", &format!("/users/chat/{chat_id}"), 1))
        .await
        .expect("first page");
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    assert_eq!(payload["messages"].as_array().expect("messages").len(), 20);
    assert_eq!(payload["has_more"], true);
    let cursor = payload["new_cursor"].as_i64().expect("cursor");

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "GET",
            &format!("/users/chat/{chat_id}"),
            1,
            serde_json::json!({"cursor": cursor}),
        ))
        .await
        .expect("second page");
    let payload = read_json(response).await;
    assert_eq!(payload["messages"].as_array().expect("messages").len(), 5);
    assert_eq!(payload["has_more"], false);

    // Outsiders get nothing.
    let response = app
        .router
        .clone()
        .oneshot(bare_request("GET", &format!("/users/chat/{chat_id}"), 9))
        .await
        .expect("outsider");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn user_chats_lists_only_own_chats() {
    let app = test_app();
    app.store.get_or_create_private_chat(1, 2).await.expect("chat");
    app.store.create_group_chat("other", 3).await.expect("group");

    let response = app
        .router
        .clone()
        .oneshot(bare_request("GET", "/users/chats", 1))
        .await
        .expect("chats");
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    assert_eq!(payload["items"].as_array().expect("items").len(), 1);
}

#[tokio::test]
async fn health_and_openapi_are_public() {
    let app = test_app();
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("healthz");
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    assert_eq!(payload["status"], "ok");

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/openapi.json")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("openapi");
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    assert_eq!(payload["info"]["title"], "murmur-chatserver");
}

#[tokio::test]
async fn empty_group_name_is_invalid() {
    let app = test_app();
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/chats",
            1,
            serde_json::json!({"name": "   "}),
        ))
        .await
        .expect("create");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let payload = read_json(response).await;
    assert_eq!(payload["code"], "INVALID_REQUEST");
}
