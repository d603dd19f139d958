//! REST surface exercised through the router without a socket.

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use parley_app_server::{AppState, ScriptedBridge, ServerConfig, create_router_with_state};
use parley_protocol::{HistoryMessage, Role};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;

fn state() -> (tempfile::TempDir, Arc<AppState>) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        storage_dir: dir.path().to_path_buf(),
        public_base_url: "https://chat.example".into(),
        ..ServerConfig::default()
    };
    let state = AppState::with_bridge(config, Arc::new(ScriptedBridge::default())).unwrap();
    (dir, Arc::new(state))
}

async fn call(state: &Arc<AppState>, method: &str, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = create_router_with_state(Arc::clone(state))
        .oneshot(request)
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn root_and_health_report_liveness() {
    let (_dir, state) = state();

    let (status, body) = call(&state, "GET", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = call(&state, "GET", "/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["live_sessions"], 0);
}

#[tokio::test]
async fn create_get_and_end_session() {
    let (_dir, state) = state();

    let (status, created) = call(&state, "POST", "/api/v1/sessions").await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["session_id"].as_str().unwrap().to_string();
    assert_eq!(
        created["redirect_url"],
        format!("https://chat.example/chat/{id}")
    );

    state
        .storage()
        .append_message(&id, &HistoryMessage::text(Role::User, "hi"))
        .unwrap();

    let (status, session) = call(&state, "GET", &format!("/api/v1/sessions/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["status"], "active");
    assert_eq!(session["turn_running"], false);
    assert_eq!(session["messages"][0]["content"], "hi");
    assert_eq!(session["messages"][0]["ordinal"], 0);

    let (status, ended) = call(&state, "POST", &format!("/api/v1/sessions/{id}/end")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ended["status"], "ended");

    let (status, _) = call(&state, "POST", &format!("/api/v1/sessions/{id}/end")).await;
    assert_eq!(status, StatusCode::OK);

    let (_, session) = call(&state, "GET", &format!("/api/v1/sessions/{id}")).await;
    assert_eq!(session["status"], "ended");
}

#[tokio::test]
async fn unknown_and_invalid_sessions() {
    let (_dir, state) = state();

    let (status, body) = call(&state, "GET", "/api/v1/sessions/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = call(&state, "POST", "/api/v1/sessions/missing/end").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&state, "GET", "/api/v1/sessions/bad%20id").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn list_sessions_pages() {
    let (_dir, state) = state();
    for _ in 0..3 {
        call(&state, "POST", "/api/v1/sessions").await;
    }

    let (_, all) = call(&state, "GET", "/api/v1/sessions").await;
    assert_eq!(all.as_array().unwrap().len(), 3);

    let (_, page) = call(&state, "GET", "/api/v1/sessions?limit=2&offset=2").await;
    assert_eq!(page.as_array().unwrap().len(), 1);
}
