//! Lifecycle Manager (§4.G) and the Request Lifecycle Record (§3).
//!
//! Single writer for one request's status and counters, grounded on the
//! teacher's per-request `RequestId` extension pattern
//! (`middleware/request_id.rs`) generalized from "carry an id" to "carry and
//! serialize the full mutable record". Every mutation publishes a usage
//! event (consumed by the Usage Tracker) and a lifecycle event (consumed by
//! the Event Bus); once the record reaches a terminal status, further
//! mutations are no-ops.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus, Topic};
use crate::error::ErrorKind;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Forwarding,
    Retry,
    Processing,
    Completed,
    Suspended,
    Error,
    Timeout,
    Cancelled,
    AuthError,
    RateLimited,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Timeout | Self::Cancelled | Self::AuthError | Self::RateLimited
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Forwarding => "forwarding",
            Self::Retry => "retry",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Suspended => "suspended",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::AuthError => "auth_error",
            Self::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
}

#[derive(Debug, Clone)]
pub struct LifecycleRecord {
    pub request_id: Uuid,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub start: DateTime<Utc>,
    pub status: Status,
    pub attempted_endpoints: Vec<String>,
    pub current_endpoint: Option<String>,
    pub current_group: Option<String>,
    pub per_endpoint_attempt: u32,
    pub global_attempt: u32,
    pub retry_count: u32,
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub cost: f64,
    pub duration_ms: Option<u64>,
    pub final_http_status: Option<u16>,
}

impl LifecycleRecord {
    fn new(request_id: Uuid, client_ip: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            request_id,
            client_ip,
            user_agent,
            start: Utc::now(),
            status: Status::Pending,
            attempted_endpoints: Vec::new(),
            current_endpoint: None,
            current_group: None,
            per_endpoint_attempt: 0,
            global_attempt: 0,
            retry_count: 0,
            model: None,
            usage: TokenUsage::default(),
            cost: 0.0,
            duration_ms: None,
            final_http_status: None,
        }
    }
}

/// Tagged union of lifecycle signals, produced on any mutator and consumed
/// by the Usage Tracker's batched writer (§3 Usage Event).
#[derive(Debug, Clone)]
pub enum UsageEvent {
    Started { record: LifecycleRecord },
    Updated { record: LifecycleRecord },
    Completed { record: LifecycleRecord },
}

impl UsageEvent {
    pub fn record(&self) -> &LifecycleRecord {
        match self {
            Self::Started { record } | Self::Updated { record } | Self::Completed { record } => record,
        }
    }
}

pub struct LifecycleManager {
    record: Mutex<LifecycleRecord>,
    usage_tx: mpsc::Sender<UsageEvent>,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
}

impl LifecycleManager {
    pub fn new(
        request_id: Uuid,
        client_ip: Option<String>,
        user_agent: Option<String>,
        usage_tx: mpsc::Sender<UsageEvent>,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let record = LifecycleRecord::new(request_id, client_ip, user_agent);
        let manager = Arc::new(Self {
            record: Mutex::new(record),
            usage_tx,
            bus,
            metrics,
        });
        let initial = manager.snapshot_sync();
        manager.publish(UsageEvent::Started { record: initial.clone() }, initial);
        manager
    }

    pub async fn request_id(&self) -> Uuid {
        self.record.lock().await.request_id
    }

    fn snapshot_sync(&self) -> LifecycleRecord {
        // Only used at construction, before any other clone of `self` exists.
        self.record.try_lock().expect("no contention at construction").clone()
    }

    fn publish(&self, event: UsageEvent, record: LifecycleRecord) {
        let tx = self.usage_tx.clone();
        if tx.try_send(event).is_err() {
            self.metrics.usage_event_dropped();
        }
        let bus = self.bus.clone();
        tokio::spawn(async move {
            bus.publish(
                Topic::RequestLifecycle,
                BusEvent::LifecycleTransition {
                    request_id: record.request_id.to_string(),
                    status: record.status.as_str().to_string(),
                },
            )
            .await;
        });
    }

    async fn mutate<F>(&self, f: F) -> LifecycleRecord
    where
        F: FnOnce(&mut LifecycleRecord),
    {
        let mut record = self.record.lock().await;
        if record.status.is_terminal() {
            return record.clone();
        }
        f(&mut record);
        record.clone()
    }

    /// Increments the global attempt counter exactly once per forward call
    /// (§4.E invariant, §8 invariant 2) and returns the new value.
    pub async fn increment_attempt(&self, endpoint: &str, group: &str) -> u32 {
        let updated = self
            .mutate(|r| {
                r.global_attempt += 1;
                if r.current_endpoint.as_deref() != Some(endpoint) {
                    r.per_endpoint_attempt = 1;
                } else {
                    r.per_endpoint_attempt += 1;
                }
                r.current_endpoint = Some(endpoint.to_string());
                r.current_group = Some(group.to_string());
                r.attempted_endpoints.push(endpoint.to_string());
                r.status = Status::Forwarding;
            })
            .await;
        self.publish(UsageEvent::Updated { record: updated.clone() }, updated.clone());
        updated.global_attempt
    }

    pub async fn update_status(&self, status: Status, retry_count: Option<u32>, http_status: Option<u16>) {
        let updated = self
            .mutate(|r| {
                r.status = status;
                if let Some(rc) = retry_count {
                    r.retry_count = rc;
                }
                if let Some(hs) = http_status {
                    r.final_http_status = Some(hs);
                }
            })
            .await;
        self.metrics.record_request(status.as_str());
        let terminal = status.is_terminal();
        self.publish(
            if terminal { UsageEvent::Completed { record: updated.clone() } } else { UsageEvent::Updated { record: updated.clone() } },
            updated,
        );
    }

    pub async fn handle_error(&self, kind: ErrorKind) {
        tracing::debug!(error_kind = kind.as_str(), "lifecycle recording error");
        let updated = self.mutate(|r| r.retry_count += 1).await;
        self.publish(UsageEvent::Updated { record: updated.clone() }, updated);
    }

    /// Sets the model name; a no-op if already set (§8 invariant 3: exactly
    /// one recorded model per request).
    pub async fn mark_model(&self, name: &str) {
        let updated = self
            .mutate(|r| {
                if r.model.is_none() {
                    r.model = Some(name.to_string());
                }
            })
            .await;
        self.publish(UsageEvent::Updated { record: updated.clone() }, updated);
    }

    /// Overwrites token usage; the last `message_delta` wins (§8 invariant 3).
    pub async fn mark_tokens(&self, usage: TokenUsage) {
        let updated = self.mutate(|r| r.usage = usage).await;
        self.publish(UsageEvent::Updated { record: updated.clone() }, updated);
    }

    pub async fn set_cost(&self, cost: f64) {
        let updated = self.mutate(|r| r.cost = cost).await;
        self.publish(UsageEvent::Updated { record: updated.clone() }, updated);
    }

    pub async fn complete(&self, status: Status, http_status: Option<u16>) {
        let started = { self.record.lock().await.start };
        let duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
        let updated = self
            .mutate(|r| {
                r.status = status;
                r.duration_ms = Some(duration_ms);
                if let Some(hs) = http_status {
                    r.final_http_status = Some(hs);
                }
            })
            .await;
        self.metrics.record_request(status.as_str());
        let _ = self.metrics.record_forward_duration(status.as_str(), duration_ms as f64 / 1000.0);
        self.publish(UsageEvent::Completed { record: updated.clone() }, updated);
    }

    pub async fn snapshot(&self) -> LifecycleRecord {
        self.record.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<LifecycleManager>, mpsc::Receiver<UsageEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let bus = Arc::new(EventBus::new(std::time::Duration::from_millis(0), Arc::new(Metrics::new().unwrap())));
        let metrics = Arc::new(Metrics::new().unwrap());
        let manager = LifecycleManager::new(Uuid::new_v4(), None, None, tx, bus, metrics);
        (manager, rx)
    }

    #[tokio::test]
    async fn new_record_starts_pending_and_emits_started_event() {
        let (manager, mut rx) = manager();
        assert_eq!(manager.snapshot().await.status, Status::Pending);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, UsageEvent::Started { .. }));
    }

    #[tokio::test]
    async fn increment_attempt_tracks_global_and_per_endpoint_counts() {
        let (manager, _rx) = manager();
        assert_eq!(manager.increment_attempt("e1", "main").await, 1);
        assert_eq!(manager.increment_attempt("e1", "main").await, 2);
        assert_eq!(manager.increment_attempt("e2", "main").await, 3);
        let record = manager.snapshot().await;
        assert_eq!(record.per_endpoint_attempt, 1);
        assert_eq!(record.attempted_endpoints, vec!["e1", "e1", "e2"]);
    }

    #[tokio::test]
    async fn terminal_status_ignores_further_mutations() {
        let (manager, _rx) = manager();
        manager.complete(Status::Completed, Some(200)).await;
        manager.mark_model("should-be-ignored").await;
        let record = manager.snapshot().await;
        assert_eq!(record.model, None);
        assert_eq!(record.status, Status::Completed);
    }

    #[tokio::test]
    async fn mark_model_is_idempotent() {
        let (manager, _rx) = manager();
        manager.mark_model("claude-3-5-haiku").await;
        manager.mark_model("different-model").await;
        assert_eq!(manager.snapshot().await.model, Some("claude-3-5-haiku".to_string()));
    }

    #[tokio::test]
    async fn mark_tokens_overwrites_with_latest() {
        let (manager, _rx) = manager();
        manager
            .mark_tokens(TokenUsage { input: 10, output: 5, cache_creation: 0, cache_read: 0 })
            .await;
        manager
            .mark_tokens(TokenUsage { input: 25, output: 97, cache_creation: 0, cache_read: 0 })
            .await;
        assert_eq!(manager.snapshot().await.usage.input, 25);
    }

    #[tokio::test]
    async fn full_usage_channel_does_not_panic() {
        let (tx, _rx) = mpsc::channel(1);
        let bus = Arc::new(EventBus::new(std::time::Duration::from_millis(0), Arc::new(Metrics::new().unwrap())));
        let metrics = Arc::new(Metrics::new().unwrap());
        let manager = LifecycleManager::new(Uuid::new_v4(), None, None, tx, bus, metrics);
        for i in 0..10 {
            manager.increment_attempt(&format!("e{i}"), "main").await;
        }
    }
}
