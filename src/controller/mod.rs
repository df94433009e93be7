//! Retry Controller (§4.E).
//!
//! The outer forwarding loop for one client request: drives the Endpoint
//! Registry, Group Manager, Error Classifier, Retry Policy, Lifecycle
//! Manager and Suspension Queue to completion. Grounded on the teacher's
//! `shared/query.rs::execute_query_with_retry` loop shape (attempt, classify,
//! decide, sleep-or-switch), generalized from a flat attempt counter to the
//! group/endpoint selection this proxy needs.

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::{ModelPricing, RetryConfig, SuspendConfig};
use crate::groups::GroupManager;
use crate::lifecycle::{LifecycleManager, Status};
use crate::metrics::Metrics;
use crate::registry::EndpointRegistry;
use crate::retry::{ForwardFailure, PolicyParams, RetryContext, classify, decide};
use crate::stream;
use crate::suspension::{ResumeSignal, SuspensionQueue};

const HOP_BY_HOP: &[&str] = &["host", "content-length", "connection", "authorization"];

pub struct ForwardRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What the forwarding handler receives over `client_tx` (§4.M). Exactly one
/// `Head` is sent, always before any `Body`, carrying the status and headers
/// the handler commits to the client response; every later message is a raw
/// body chunk. The handler never builds a response before the first message
/// arrives, so the client status reflects the actual outcome (§7) instead of
/// always being 200.
pub enum ForwardEvent {
    Head { status: StatusCode, headers: HeaderMap },
    Body(Bytes),
}

/// Maps a terminal lifecycle status to the HTTP status returned to the
/// client (§7): `timeout` -> 504, `rate_limited` -> 429, `error`/`auth_error`
/// -> the last observed upstream status if one was seen, else 502.
fn client_status_for(status: Status, last_upstream: Option<u16>) -> StatusCode {
    match status {
        Status::Timeout => StatusCode::GATEWAY_TIMEOUT,
        Status::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        Status::Error | Status::AuthError => {
            last_upstream.and_then(|code| StatusCode::from_u16(code).ok()).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(status: Status) -> Vec<u8> {
    let (error_type, message): (&str, &str) = match status {
        Status::Timeout => ("timeout_error", "request timed out"),
        Status::RateLimited => ("rate_limit_error", "rate limited"),
        Status::AuthError => ("authentication_error", "authentication failed upstream"),
        Status::Cancelled => ("cancelled", "request cancelled by client"),
        _ => ("api_error", "no endpoint available"),
    };
    serde_json::json!({
        "type": "error",
        "error": { "type": error_type, "message": message }
    })
    .to_string()
    .into_bytes()
}

pub struct Controller {
    registry: Arc<EndpointRegistry>,
    groups: Arc<GroupManager>,
    suspension: Arc<SuspensionQueue>,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
    policy_params: PolicyParams,
    suspend_config: SuspendConfig,
    server_timeout_default: u64,
    pricing: HashMap<String, ModelPricing>,
}

impl Controller {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        groups: Arc<GroupManager>,
        suspension: Arc<SuspensionQueue>,
        metrics: Arc<Metrics>,
        http: reqwest::Client,
        retry: &RetryConfig,
        suspend_config: SuspendConfig,
        server_timeout_default: u64,
        pricing: HashMap<String, ModelPricing>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            groups,
            suspension,
            metrics,
            http,
            policy_params: PolicyParams {
                max_attempts: retry.max_attempts,
                base_delay: Duration::from_millis(retry.base_delay_ms),
                max_delay: Duration::from_millis(retry.max_delay_ms),
                multiplier: retry.multiplier,
            },
            suspend_config,
            server_timeout_default,
            pricing,
        })
    }

    /// Runs the full forwarding loop to completion, sending exactly one
    /// `ForwardEvent::Head` before any `Body` on `client_tx`, and leaving
    /// `lifecycle` in a terminal status on return. Intended to be spawned by
    /// the HTTP handler, which waits for that first event before committing
    /// a response to the client (§4.M, §7).
    pub async fn run(self: Arc<Self>, lifecycle: Arc<LifecycleManager>, req: ForwardRequest, client_tx: mpsc::Sender<ForwardEvent>) {
        let mut tried_groups: HashSet<String> = HashSet::new();
        let mut current_group: Option<String> = None;
        let mut group_endpoints = Vec::new();
        let mut endpoint_idx = 0usize;

        loop {
            if current_group.is_none() || endpoint_idx >= group_endpoints.len() {
                let Some(group_name) = self.groups.next_group(&tried_groups).await else {
                    self.terminate(&lifecycle, &client_tx, Status::Error).await;
                    return;
                };
                tried_groups.insert(group_name.clone());
                group_endpoints = self.registry.list_for_group(&group_name).await;
                current_group = Some(group_name);
                endpoint_idx = 0;
                if group_endpoints.is_empty() {
                    continue;
                }
            }

            let endpoint = group_endpoints[endpoint_idx].clone();
            let group_name = current_group.clone().expect("set above");

            lifecycle.increment_attempt(endpoint.name(), &group_name).await;

            let timeout_secs = endpoint.timeout_seconds(self.server_timeout_default);
            let outcome = self
                .attempt_once(&endpoint, &req, timeout_secs, lifecycle.clone(), client_tx.clone())
                .await;

            let failure = match outcome {
                Ok(()) => return,
                Err(failure) => failure,
            };

            let ctx = classify(&failure);
            lifecycle.handle_error(ctx.kind).await;

            let snapshot = lifecycle.snapshot().await;
            let retry_ctx = RetryContext { per_endpoint_attempt: snapshot.per_endpoint_attempt, global_attempt: snapshot.global_attempt };
            let decision = decide(ctx.kind, retry_ctx, &self.policy_params, ctx.suggested_delay);
            self.metrics.record_retry_decision(ctx.kind, decision_label(&decision));

            if let Some(final_status) = decision.final_status {
                if decision.suspend {
                    if !self.handle_suspend(&lifecycle, &client_tx, final_status, decision.delay).await {
                        return;
                    }
                    tried_groups.clear();
                    current_group = None;
                    endpoint_idx = 0;
                    continue;
                }
                self.terminate(&lifecycle, &client_tx, final_status).await;
                return;
            }

            if decision.retry_same {
                lifecycle.update_status(Status::Retry, None, None).await;
                tokio::time::sleep(decision.delay).await;
                continue;
            }

            if decision.switch_endpoint {
                lifecycle.update_status(Status::Retry, None, None).await;
                tokio::time::sleep(decision.delay).await;
                endpoint_idx += 1;
                continue;
            }
        }
    }

    /// Enqueues the request and waits for resume, timeout, or client
    /// cancellation. Returns `true` if the caller should reset and continue
    /// the forwarding loop, `false` if a terminal status has already been
    /// recorded and the caller must return. A rejected enqueue (e.g.
    /// `max_suspended_requests == 0`) behaves exactly like suspension being
    /// disabled, not a generic error (§8 boundary case).
    async fn handle_suspend(
        &self,
        lifecycle: &Arc<LifecycleManager>,
        client_tx: &mpsc::Sender<ForwardEvent>,
        timeout_status: Status,
        timeout: Duration,
    ) -> bool {
        if !self.suspend_config.enabled {
            self.terminate(lifecycle, client_tx, timeout_status).await;
            return false;
        }
        let request_id = lifecycle.request_id().await;
        let deadline = if timeout.is_zero() { Duration::from_secs(self.suspend_config.timeout_seconds) } else { timeout };
        match self.suspension.enqueue(request_id, deadline).await {
            Ok(rx) => {
                lifecycle.update_status(Status::Suspended, None, None).await;
                match rx.await {
                    Ok(ResumeSignal::Resumed) => true,
                    Ok(ResumeSignal::TimedOut) | Err(_) => {
                        self.terminate(lifecycle, client_tx, timeout_status).await;
                        false
                    }
                }
            }
            Err(()) => {
                self.terminate(lifecycle, client_tx, timeout_status).await;
                false
            }
        }
    }

    /// Sends the single terminal `Head`/`Body` pair for a request that never
    /// reached a successful upstream response, then marks `lifecycle`
    /// terminal. No-op on the wire if the client already disconnected.
    async fn terminate(&self, lifecycle: &Arc<LifecycleManager>, client_tx: &mpsc::Sender<ForwardEvent>, status: Status) {
        let last_upstream = lifecycle.snapshot().await.final_http_status;
        let client_status = client_status_for(status, last_upstream);
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let _ = client_tx.send(ForwardEvent::Head { status: client_status, headers }).await;
        let _ = client_tx.send(ForwardEvent::Body(Bytes::from(error_body(status)))).await;
        lifecycle.complete(status, None).await;
    }

    async fn attempt_once(
        &self,
        endpoint: &crate::registry::Endpoint,
        req: &ForwardRequest,
        timeout_secs: u64,
        lifecycle: Arc<LifecycleManager>,
        client_tx: mpsc::Sender<ForwardEvent>,
    ) -> Result<(), ForwardFailure> {
        let url = format!("{}{}", endpoint.url().trim_end_matches('/'), req.path_and_query);
        let mut builder = self
            .http
            .request(req.method.clone(), &url)
            .timeout(Duration::from_secs(timeout_secs))
            .header("Authorization", format!("Bearer {}", endpoint.token()))
            .body(req.body.clone());

        for (name, value) in req.headers.iter() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_str().as_bytes()), HeaderValue::from_bytes(value.as_bytes())) {
                builder = builder.header(name, value);
            }
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return Err(stream::classify_transport_error(&e)),
        };

        stream::process(response, lifecycle, client_tx, &self.pricing).await
    }
}

fn decision_label(decision: &crate::retry::RetryDecision) -> &'static str {
    if decision.retry_same {
        "retry_same"
    } else if decision.switch_endpoint {
        "switch_endpoint"
    } else if decision.suspend {
        "suspend"
    } else {
        "terminate"
    }
}
