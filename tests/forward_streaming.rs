//! Integration tests for the /v1/messages forwarding endpoint, exercising
//! the full axum stack against a mock upstream.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    middleware,
    routing::post,
};
use claudefront::{config::Config, handlers::AppState, middleware::request_id_middleware};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tower::ServiceExt;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

fn test_config(mock_url: &str, db_path: &str) -> Config {
    let toml_str = format!(
        r#"
[server]
host = "127.0.0.1"
port = 3000
request_timeout_seconds = 5

[retry]
max_attempts = 2
base_delay_ms = 1
max_delay_ms = 5

[request_suspend]
enabled = false

[[endpoints]]
name = "primary"
url = "{mock_url}"
token = "sk-ant-test"
priority = 1
group = "main"
group_priority = 1

[tracking]
database_path = "{db_path}"
"#
    );
    toml::from_str(&toml_str).expect("test config should parse")
}

fn test_app(config: Config) -> Router {
    let config = Arc::new(config);
    let state = AppState::new(config).expect("AppState should construct");

    Router::new()
        .route("/v1/messages", post(claudefront::handlers::forward::handler))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
}

fn temp_db_path() -> (NamedTempFile, String) {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_string_lossy().to_string();
    (file, path)
}

#[tokio::test]
async fn forwards_buffered_json_response() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_json(serde_json::json!({
                    "id": "msg_1",
                    "model": "claude-3-5-sonnet-20241022",
                    "usage": { "input_tokens": 10, "output_tokens": 5 }
                })),
        )
        .mount(&mock_server)
        .await;

    let (_guard, db_path) = temp_db_path();
    let app = test_app(test_config(&mock_server.uri(), &db_path));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"model":"claude-3-5-sonnet-20241022","messages":[]}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["id"], "msg_1");
}

#[tokio::test]
async fn forwards_sse_stream_response() {
    let mock_server = MockServer::start().await;
    let sse_body = "event: message_start\ndata: {\"message\":{\"model\":\"claude-3-5-haiku-20241022\",\"usage\":{\"input_tokens\":3}}}\n\n\
event: content_block_delta\ndata: {\"delta\":{\"text\":\"hi\"}}\n\n\
event: message_delta\ndata: {\"usage\":{\"output_tokens\":2}}\n\n";

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body),
        )
        .mount(&mock_server)
        .await;

    let (_guard, db_path) = temp_db_path();
    let app = test_app(test_config(&mock_server.uri(), &db_path));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"model":"claude-3-5-haiku-20241022","stream":true,"messages":[]}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "text/event-stream");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("content_block_delta"));
}

#[tokio::test]
async fn returns_bad_gateway_when_upstream_unreachable() {
    let (_guard, db_path) = temp_db_path();
    let app = test_app(test_config("http://127.0.0.1:1", &db_path));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"model":"claude-3-5-haiku-20241022","messages":[]}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    // The handler waits for the controller's first outcome before
    // committing a status, so an endpoint that never connects surfaces as
    // 502 rather than a 200 with a truncated body.
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["type"], "api_error");
}
