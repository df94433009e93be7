//! The Claude-compatible forwarding endpoint (§4.M).
//!
//! Spawns the Retry Controller's loop and waits for its first
//! `ForwardEvent::Head` before committing a response: a successful upstream
//! call streams through with its actual status and headers, while a
//! terminal failure maps to the client status §7 requires (502/504/429)
//! instead of always 200.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::controller::{ForwardEvent, ForwardRequest};
use crate::handlers::AppState;
use crate::lifecycle::LifecycleManager;
use crate::middleware::RequestId;

const CLIENT_CHANNEL_CAPACITY: usize = 64;

pub async fn handler(State(state): State<AppState>, request: Request) -> Response {
    let request_id = request.extensions().get::<RequestId>().copied().unwrap_or_default();
    let method = request.method().clone();
    let path_and_query = request.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_else(|| "/".to_string());
    let headers = request.headers().clone();

    let body = match axum::body::to_bytes(request.into_body(), 32 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return crate::error::AppError::Validation(format!("failed to read request body: {e}")).into_response();
        }
    };

    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let user_agent = headers.get("user-agent").and_then(|v| v.to_str().ok()).map(|v| v.to_string());

    let lifecycle = LifecycleManager::new(request_id.as_uuid(), client_ip, user_agent, state.usage_tx(), state.bus().clone(), state.metrics().clone());

    let (tx, mut rx) = mpsc::channel::<ForwardEvent>(CLIENT_CHANNEL_CAPACITY);
    let forward_req = ForwardRequest { method, path_and_query, headers, body };

    let controller = state.controller().clone();
    tokio::spawn(async move {
        controller.run(lifecycle, forward_req, tx).await;
    });

    // The controller always sends exactly one Head before any Body, so this
    // is the only point where the client status/headers are decided. `None`
    // only happens if the controller task panicked before sending anything.
    let (status, response_headers) = match rx.recv().await {
        Some(ForwardEvent::Head { status, headers }) => (status, headers),
        Some(ForwardEvent::Body(_)) | None => (StatusCode::BAD_GATEWAY, HeaderMap::new()),
    };

    let body_stream = ReceiverStream::new(rx).filter_map(|event| async move {
        match event {
            ForwardEvent::Body(bytes) => Some(Ok::<Bytes, std::io::Error>(bytes)),
            ForwardEvent::Head { .. } => None,
        }
    });

    let mut builder = Response::builder().status(status);
    if let Some(builder_headers) = builder.headers_mut() {
        *builder_headers = response_headers;
    }
    builder.body(Body::from_stream(body_stream)).expect("building a streaming response cannot fail")
}
