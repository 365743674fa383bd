use crate::create_app;
use crate::state::AppState;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use bollard::Docker;
use cloudbrowser_common::NullLogSink;
use cloudbrowser_core::pool::PoolConfig;
use cloudbrowser_core::{AdminControl, AdmissionQueue, ContainerPool, RealtimeChannel, SessionManager};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const ADMIN_USER: &str = "admin";
const ADMIN_PASSWORD: &str = "test-password";

/// No warm containers are created here (`pool_size: 0`) — these tests
/// exercise routing, validation, and the admin auth gate, not container
/// lifecycle, which `cloudbrowser-core`'s own tests already cover without
/// a Docker daemon. `ContainerPool::init` still talks to Docker for the
/// network-ensure and orphan-reap steps, so a local daemon must be
/// reachable to run this module.
async fn test_state() -> AppState {
    let docker = Arc::new(Docker::connect_with_local_defaults().unwrap());
    let pool_config = PoolConfig {
        image: "cloudbrowser/sandbox:latest".to_string(),
        pool_size: 0,
        port_range_start: 20000,
        port_range_end: 20001,
        policy_mount: None,
        assets_mount: None,
        enable_gpu: false,
    };
    let pool = ContainerPool::init(docker, pool_config).await.unwrap();

    let log_sink: Arc<dyn cloudbrowser_common::LogSink> = Arc::new(NullLogSink);
    let sessions = SessionManager::new(pool.clone(), log_sink, Duration::from_secs(600), 10);
    let queue = AdmissionQueue::new(pool.clone(), sessions.clone());
    let realtime = RealtimeChannel::new(sessions.clone());
    let admin = AdminControl::new(pool.clone(), sessions.clone(), queue.clone(), realtime.clone(), 10);

    AppState {
        pool,
        sessions,
        queue,
        realtime,
        admin,
        admin_user: ADMIN_USER.to_string(),
        admin_password: ADMIN_PASSWORD.to_string(),
    }
}

async fn test_app() -> Router {
    create_app(test_state().await, "*")
}

fn basic_auth_header(user: &str, password: &str) -> String {
    use base64::Engine;
    format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}")))
}

#[tokio::test]
async fn health_reports_ok_with_empty_pool() {
    let app = test_app().await;

    let response = app
        .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["pool"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn create_session_rejects_missing_url() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/session")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_session_enqueues_with_valid_url() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/session")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"url":"example.com"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["queueId"].as_str().is_some());
}

#[tokio::test]
async fn create_session_rejects_while_paused() {
    let state = test_state().await;
    state.admin.pause().await;
    let app = create_app(state, "*");

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/session")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"url":"example.com"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unknown_session_id_is_not_found() {
    let app = test_app().await;

    let response = app
        .oneshot(Request::builder().uri("/api/session/does-not-exist").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_exposes_prometheus_text() {
    let app = test_app().await;

    let response = app
        .oneshot(Request::builder().uri("/api/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("cloud_browser_active_sessions"));
    assert!(text.contains("cloud_browser_pool_size"));
}

#[tokio::test]
async fn admin_routes_reject_missing_credentials() {
    let app = test_app().await;

    let response = app
        .oneshot(Request::builder().uri("/api/admin/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
}

#[tokio::test]
async fn admin_routes_reject_wrong_credentials() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/admin/stats")
                .header(header::AUTHORIZATION, basic_auth_header(ADMIN_USER, "wrong"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_routes_accept_correct_credentials() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/admin/stats")
                .header(header::AUTHORIZATION, basic_auth_header(ADMIN_USER, ADMIN_PASSWORD))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["poolSize"], 0);
}

#[tokio::test]
async fn admin_pool_size_rejects_out_of_bounds() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/admin/config/pool-size")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, basic_auth_header(ADMIN_USER, ADMIN_PASSWORD))
                .body(Body::from(r#"{"size":9999}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
