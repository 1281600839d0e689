mod common;

use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum_test::TestServer;
use utoipa::OpenApi;

use relay_api::config::Config;

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_instance_and_timestamp() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server.get("/health").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["instance_id"], "test-instance");
    assert!(body["ts"].as_i64().unwrap() > 1_600_000_000);
}

#[tokio::test]
async fn health_is_public_when_api_key_is_set() {
    let (app, _state) = common::test_app_with(Config {
        auth_api_key: Some("s3cret".to_string()),
        ..common::test_config()
    });
    let server = TestServer::new(app).unwrap();

    server.get("/health").await.assert_status_ok();
    server.get("/status").await.assert_status_ok();
}

// ---------------------------------------------------------------------------
// GET /status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_starts_empty() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let body: serde_json::Value = server.get("/status").await.json();
    assert_eq!(body["instance_id"], "test-instance");
    assert_eq!(body["connections"], 0);
    assert_eq!(body["subscribed_sessions"], 0);
}

// ---------------------------------------------------------------------------
// WebSocket upgrade gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upgrade_without_key_is_unauthorized() {
    let (app, _state) = common::test_app_with(Config {
        auth_api_key: Some("s3cret".to_string()),
        ..common::test_config()
    });
    let server = TestServer::new(app).unwrap();

    let resp = server.get("/ws/session/room-1/").await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    assert_eq!(body["error"]["message"], "Authorization header missing");

    let resp = server
        .get("/ws/session/room-1/")
        .add_header(AUTHORIZATION, "wrong")
        .await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["message"], "Invalid authorization key");
}

// ---------------------------------------------------------------------------
// OpenAPI document
// ---------------------------------------------------------------------------

#[test]
fn openapi_document_lists_http_routes() {
    let doc = relay_api::routes::ApiDoc::openapi();
    assert!(doc.paths.paths.contains_key("/health"));
    assert!(doc.paths.paths.contains_key("/status"));
}

// ---------------------------------------------------------------------------
// Router-level checks (no server)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn query_key_is_checked_before_upgrade() {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    let (app, _state) = common::test_app_with(Config {
        auth_api_key: Some("s3cret".to_string()),
        ..common::test_config()
    });

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/ws/session/room-1?auth=nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}
