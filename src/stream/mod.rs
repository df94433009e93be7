//! Stream Processor (§4.H).
//!
//! Pipes the upstream response body to the client while parsing
//! Server-Sent-Events inline to extract model name and token usage. Replaces
//! the teacher's SDK-mediated query path with direct `reqwest` streaming,
//! since the SSE framing here is Claude's wire format rather than an SDK
//! abstraction over it.

use axum::body::Bytes;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::ModelPricing;
use crate::controller::ForwardEvent;
use crate::lifecycle::{LifecycleManager, Status, TokenUsage};
use crate::retry::{ForwardFailure, classify};
use crate::tracking::cost::compute_cost;

const SSE_CONTENT_TYPE: &str = "text/event-stream";

/// Response headers stripped before forwarding to the client (§4.M):
/// `content-length`/`transfer-encoding` no longer describe the re-chunked
/// body, and `connection` is hop-by-hop.
const RESPONSE_HOP_BY_HOP: &[&str] = &["content-length", "transfer-encoding", "connection"];

fn forwarded_headers(upstream: &reqwest::header::HeaderMap) -> axum::http::HeaderMap {
    let mut headers = axum::http::HeaderMap::new();
    for (name, value) in upstream.iter() {
        if RESPONSE_HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    headers
}

#[derive(Debug, Clone, serde::Deserialize)]
struct SseMessageStart {
    message: SseMessageStartInner,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct SseMessageStartInner {
    model: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct SseMessageDelta {
    usage: Option<SseUsage>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct SseUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

/// Splits a raw SSE byte buffer into complete `event:`/`data:` blocks,
/// returning the unconsumed tail to prepend to the next chunk.
fn split_events(buffer: &str) -> (Vec<&str>, &str) {
    let mut events = Vec::new();
    let mut rest = buffer;
    while let Some(pos) = rest.find("\n\n") {
        events.push(&rest[..pos]);
        rest = &rest[pos + 2..];
    }
    (events, rest)
}

fn parse_event(block: &str) -> Option<(String, String)> {
    let mut event_name = None;
    let mut data = String::new();
    for line in block.lines() {
        if let Some(name) = line.strip_prefix("event:") {
            event_name = Some(name.trim().to_string());
        } else if let Some(payload) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(payload.trim());
        }
    }
    event_name.map(|name| (name, data))
}

/// Result of draining the upstream stream: whether any token-usage signal
/// was observed at all (drives the §4.H no-signal-200 fallback).
struct DrainOutcome {
    saw_usage_signal: bool,
}

async fn drain_sse<S>(
    mut byte_stream: S,
    lifecycle: &Arc<LifecycleManager>,
    client_tx: &mpsc::Sender<ForwardEvent>,
) -> Result<DrainOutcome, ForwardFailure>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let mut buffer = String::new();
    let mut saw_usage_signal = false;

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(|e| ForwardFailure::Stream(e.to_string()))?;
        if client_tx.send(ForwardEvent::Body(chunk.clone())).await.is_err() {
            return Err(ForwardFailure::ClientCancelled);
        }

        buffer.push_str(&String::from_utf8_lossy(&chunk));
        let (events, rest) = split_events(&buffer);
        let mut consumed = 0;
        for block in &events {
            consumed += block.len() + 2;
            if let Some((name, data)) = parse_event(block) {
                match name.as_str() {
                    "message_start" => {
                        if let Ok(parsed) = serde_json::from_str::<SseMessageStart>(&data) {
                            if let Some(model) = parsed.message.model {
                                lifecycle.mark_model(&model).await;
                            }
                        }
                    }
                    "message_delta" => {
                        if let Ok(parsed) = serde_json::from_str::<SseMessageDelta>(&data) {
                            if let Some(usage) = parsed.usage {
                                lifecycle
                                    .mark_tokens(TokenUsage {
                                        input: usage.input_tokens,
                                        output: usage.output_tokens,
                                        cache_creation: usage.cache_creation_input_tokens,
                                        cache_read: usage.cache_read_input_tokens,
                                    })
                                    .await;
                                saw_usage_signal = true;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        let _ = rest;
        buffer = buffer.split_off(consumed.min(buffer.len()));
    }

    Ok(DrainOutcome { saw_usage_signal })
}

/// Drives one upstream response to completion: forwards bytes to `client_tx`
/// verbatim, parses SSE if the content type says so, and leaves the
/// lifecycle record in a terminal, non-`processing` state on return (§4.H).
pub async fn process(
    response: reqwest::Response,
    lifecycle: Arc<LifecycleManager>,
    client_tx: mpsc::Sender<ForwardEvent>,
    pricing: &HashMap<String, ModelPricing>,
) -> Result<(), ForwardFailure> {
    let status = response.status();
    let is_sse = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with(SSE_CONTENT_TYPE))
        .unwrap_or(false);

    lifecycle.update_status(Status::Processing, None, Some(status.as_u16())).await;

    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(std::time::Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(status = status.as_u16(), body_len = body.len(), "upstream returned non-2xx");
        return Err(ForwardFailure::Http { status: status.as_u16(), retry_after });
    }

    // Success is final for the whole request (the controller never retries
    // past a 2xx), so this is the one point in the whole forwarding loop
    // that commits the client-facing status/headers.
    let head = ForwardEvent::Head { status, headers: forwarded_headers(response.headers()) };
    if client_tx.send(head).await.is_err() {
        return Err(ForwardFailure::ClientCancelled);
    }

    if is_sse {
        let byte_stream = response.bytes_stream();
        let outcome = drain_sse(byte_stream, &lifecycle, &client_tx).await?;
        if outcome.saw_usage_signal {
            record_cost(&lifecycle, pricing).await;
            lifecycle.complete(Status::Completed, Some(status.as_u16())).await;
        } else {
            fallback_complete(&lifecycle, status.as_u16()).await;
        }
        Ok(())
    } else {
        let bytes = response.bytes().await.map_err(|e| ForwardFailure::Stream(e.to_string()))?;
        if client_tx.send(ForwardEvent::Body(bytes.clone())).await.is_err() {
            return Err(ForwardFailure::ClientCancelled);
        }
        let saw_usage = serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .and_then(|v| v.get("usage").cloned())
            .is_some();
        if saw_usage {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                if let Some(model) = value.get("model").and_then(|m| m.as_str()) {
                    lifecycle.mark_model(model).await;
                }
                if let Some(usage) = value.get("usage") {
                    lifecycle
                        .mark_tokens(TokenUsage {
                            input: usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                            output: usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                            cache_creation: usage.get("cache_creation_input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                            cache_read: usage.get("cache_read_input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                        })
                        .await;
                }
            }
            record_cost(&lifecycle, pricing).await;
            lifecycle.complete(Status::Completed, Some(status.as_u16())).await;
        } else {
            fallback_complete(&lifecycle, status.as_u16()).await;
        }
        Ok(())
    }
}

/// Computes the dollar cost of the request's final model/usage (§4.I) from
/// the configured per-model pricing table, defaulting to zero cost for a
/// model with no pricing entry, and records it before the lifecycle record
/// goes terminal.
async fn record_cost(lifecycle: &Arc<LifecycleManager>, pricing: &HashMap<String, ModelPricing>) {
    let snapshot = lifecycle.snapshot().await;
    let Some(model) = snapshot.model.as_deref() else { return };
    let model_pricing = pricing.get(model).copied().unwrap_or(ModelPricing {
        input: 0.0,
        output: 0.0,
        cache_creation: 0.0,
        cache_read: 0.0,
    });
    lifecycle.set_cost(compute_cost(&model_pricing, &snapshot.usage)).await;
}

/// §4.H fallback: a successful response with no token-usage signal (e.g.
/// `/v1/models`) still must leave the record terminal, never `processing`.
async fn fallback_complete(lifecycle: &Arc<LifecycleManager>, http_status: u16) {
    lifecycle.mark_model("default").await;
    lifecycle.complete(Status::Completed, Some(http_status)).await;
}

/// Classifies a `reqwest` call error (not an HTTP-status error) for the
/// retry controller.
pub fn classify_transport_error(err: &reqwest::Error) -> ForwardFailure {
    if err.is_timeout() {
        ForwardFailure::Timeout
    } else if err.is_connect() || err.is_request() {
        ForwardFailure::Network(err.to_string())
    } else if err.is_decode() {
        ForwardFailure::Parsing(err.to_string())
    } else {
        ForwardFailure::Unknown(err.to_string())
    }
}

pub fn classify_forward_failure(failure: &ForwardFailure) -> crate::retry::ErrorContext {
    classify(failure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_events_separates_complete_blocks_and_keeps_tail() {
        let buf = "event: message_start\ndata: {}\n\nevent: ping\ndata: {}\n\nincomplete";
        let (events, rest) = split_events(buf);
        assert_eq!(events.len(), 2);
        assert_eq!(rest, "incomplete");
    }

    #[test]
    fn parse_event_extracts_name_and_joined_data() {
        let block = "event: message_delta\ndata: {\"usage\":{\"output_tokens\":5}}";
        let (name, data) = parse_event(block).unwrap();
        assert_eq!(name, "message_delta");
        assert!(data.contains("output_tokens"));
    }

    #[test]
    fn parse_event_returns_none_without_event_line() {
        assert!(parse_event("data: {}").is_none());
    }

    #[test]
    fn message_start_payload_parses_model_name() {
        let payload = r#"{"message":{"model":"claude-3-5-haiku"}}"#;
        let parsed: SseMessageStart = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed.message.model.as_deref(), Some("claude-3-5-haiku"));
    }

    #[test]
    fn message_delta_payload_parses_usage() {
        let payload = r#"{"usage":{"input_tokens":25,"output_tokens":97}}"#;
        let parsed: SseMessageDelta = serde_json::from_str(payload).unwrap();
        let usage = parsed.usage.unwrap();
        assert_eq!(usage.input_tokens, 25);
        assert_eq!(usage.output_tokens, 97);
    }

    fn lifecycle() -> (Arc<LifecycleManager>, mpsc::Receiver<crate::lifecycle::UsageEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let bus = Arc::new(crate::bus::EventBus::new(
            std::time::Duration::from_millis(0),
            Arc::new(crate::metrics::Metrics::new().unwrap()),
        ));
        let metrics = Arc::new(crate::metrics::Metrics::new().unwrap());
        (LifecycleManager::new(uuid::Uuid::new_v4(), None, None, tx, bus, metrics), rx)
    }

    #[tokio::test]
    async fn record_cost_uses_configured_pricing_for_the_marked_model() {
        let (lifecycle, _rx) = lifecycle();
        lifecycle.mark_model("claude-3-5-sonnet-20241022").await;
        lifecycle.mark_tokens(TokenUsage { input: 25, output: 97, cache_creation: 0, cache_read: 0 }).await;

        let mut pricing = HashMap::new();
        pricing.insert(
            "claude-3-5-sonnet-20241022".to_string(),
            ModelPricing { input: 3.00, output: 15.00, cache_creation: 0.0, cache_read: 0.0 },
        );

        record_cost(&lifecycle, &pricing).await;
        let cost = lifecycle.snapshot().await.cost;
        assert!((cost - 0.001530).abs() < 1e-9, "cost was {cost}");
    }

    #[tokio::test]
    async fn record_cost_defaults_to_zero_for_unpriced_model() {
        let (lifecycle, _rx) = lifecycle();
        lifecycle.mark_model("unlisted-model").await;
        lifecycle.mark_tokens(TokenUsage { input: 1000, output: 1000, cache_creation: 0, cache_read: 0 }).await;

        record_cost(&lifecycle, &HashMap::new()).await;
        assert_eq!(lifecycle.snapshot().await.cost, 0.0);
    }
}
