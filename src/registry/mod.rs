//! Endpoint Registry (§4.A).
//!
//! Holds the endpoint pool and runtime health/priority/cooldown state.
//! Endpoints are long-lived and shared (§3 Ownership); the registry is read
//! under `RwLock` by every forwarding task and written only by the health
//! checker or the management API, mirroring the teacher's
//! `models/health.rs` split between static config and guarded runtime state.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;

use crate::bus::{BusEvent, EventBus, Topic};
use crate::config::EndpointConfig;

#[derive(Debug, Clone)]
struct EndpointState {
    healthy: bool,
    never_checked: bool,
    last_check: Option<DateTime<Utc>>,
    last_response_time_ms: Option<u64>,
    cooldown_until: Option<DateTime<Utc>>,
    priority: u32,
}

pub struct Endpoint {
    config: EndpointConfig,
    state: RwLock<EndpointState>,
}

impl Endpoint {
    fn new(config: EndpointConfig) -> Self {
        let priority = config.priority();
        Self {
            config,
            state: RwLock::new(EndpointState {
                healthy: false,
                never_checked: true,
                last_check: None,
                last_response_time_ms: None,
                cooldown_until: None,
                priority,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }
    pub fn url(&self) -> &str {
        self.config.url()
    }
    pub fn token(&self) -> &str {
        self.config.token()
    }
    pub fn group(&self) -> &str {
        self.config.group()
    }
    pub fn group_priority(&self) -> u32 {
        self.config.group_priority()
    }
    pub fn timeout_seconds(&self, server_default: u64) -> u64 {
        self.config.timeout_seconds(server_default)
    }

    pub async fn priority(&self) -> u32 {
        self.state.read().await.priority
    }

    pub async fn is_healthy(&self) -> bool {
        self.state.read().await.healthy
    }

    pub async fn in_cooldown(&self) -> bool {
        match self.state.read().await.cooldown_until {
            Some(until) => Utc::now() < until,
            None => false,
        }
    }

    /// Eligible for ordinary selection: healthy and not cooling down.
    pub async fn is_selectable(&self) -> bool {
        self.is_healthy().await && !self.in_cooldown().await
    }

    pub async fn snapshot(&self) -> EndpointStatus {
        let state = self.state.read().await;
        EndpointStatus {
            name: self.name().to_string(),
            group: self.group().to_string(),
            priority: state.priority,
            healthy: state.healthy,
            never_checked: state.never_checked,
            last_check: state.last_check,
            last_response_time_ms: state.last_response_time_ms,
            in_cooldown: state
                .cooldown_until
                .map(|until| Utc::now() < until)
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub name: String,
    pub group: String,
    pub priority: u32,
    pub healthy: bool,
    pub never_checked: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_response_time_ms: Option<u64>,
    pub in_cooldown: bool,
}

pub struct EndpointRegistry {
    endpoints: Vec<Arc<Endpoint>>,
    by_name: HashMap<String, Arc<Endpoint>>,
    bus: Arc<EventBus>,
}

impl EndpointRegistry {
    pub fn new(configs: Vec<EndpointConfig>, bus: Arc<EventBus>) -> Self {
        let endpoints: Vec<Arc<Endpoint>> = configs.into_iter().map(|c| Arc::new(Endpoint::new(c))).collect();
        let by_name = endpoints.iter().map(|e| (e.name().to_string(), e.clone())).collect();
        Self { endpoints, by_name, bus }
    }

    /// Endpoints belonging to `group`, ordered ascending by priority with
    /// ties broken lexicographically by name (§4.A).
    pub async fn list_for_group(&self, group: &str) -> Vec<Arc<Endpoint>> {
        let mut members: Vec<Arc<Endpoint>> =
            self.endpoints.iter().filter(|e| e.group() == group).cloned().collect();
        let mut keyed = Vec::with_capacity(members.len());
        for endpoint in members.drain(..) {
            let priority = endpoint.priority().await;
            keyed.push((priority, endpoint.name().to_string(), endpoint));
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        keyed.into_iter().map(|(_, _, e)| e).collect()
    }

    pub fn list(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.by_name.get(name).cloned()
    }

    pub async fn set_priority(&self, name: &str, priority: u32) -> Result<(), String> {
        if priority < 1 {
            return Err(format!("priority must be >= 1, got {priority}"));
        }
        let endpoint = self.by_name(name).ok_or_else(|| format!("unknown endpoint '{name}'"))?;
        endpoint.state.write().await.priority = priority;
        Ok(())
    }

    pub async fn mark_healthy(&self, name: &str, response_time_ms: u64) {
        let Some(endpoint) = self.by_name(name) else { return };
        let flipped = {
            let mut state = endpoint.state.write().await;
            let flipped = !state.healthy;
            state.healthy = true;
            state.never_checked = false;
            state.last_check = Some(Utc::now());
            state.last_response_time_ms = Some(response_time_ms);
            flipped
        };
        if flipped {
            self.bus
                .publish(Topic::EndpointHealth, BusEvent::EndpointHealthy { endpoint: name.to_string() })
                .await;
        }
    }

    pub async fn mark_unhealthy(&self, name: &str, reason: &str) {
        let Some(endpoint) = self.by_name(name) else { return };
        let flipped = {
            let mut state = endpoint.state.write().await;
            let flipped = state.healthy;
            state.healthy = false;
            state.never_checked = false;
            state.last_check = Some(Utc::now());
            flipped
        };
        if flipped {
            self.bus
                .publish(
                    Topic::EndpointHealth,
                    BusEvent::EndpointUnhealthy { endpoint: name.to_string(), reason: reason.to_string() },
                )
                .await;
        }
    }

    pub async fn start_cooldown(&self, name: &str, duration: StdDuration) {
        let Some(endpoint) = self.by_name(name) else { return };
        let deadline = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
        endpoint.state.write().await.cooldown_until = Some(deadline);
    }

    /// One-shot manual health probe against `GET {url}` returning the probe
    /// result directly (does not wait for the background checker's cycle).
    pub async fn check_now(&self, client: &reqwest::Client, name: &str) -> Result<bool, String> {
        let endpoint = self.by_name(name).ok_or_else(|| format!("unknown endpoint '{name}'"))?;
        let started = std::time::Instant::now();
        let healthy = client
            .get(endpoint.url())
            .header("Authorization", format!("Bearer {}", endpoint.token()))
            .timeout(StdDuration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success() || r.status().as_u16() == 404)
            .unwrap_or(false);

        if healthy {
            self.mark_healthy(name, started.elapsed().as_millis() as u64).await;
        } else {
            self.mark_unhealthy(name, "manual health check failed").await;
        }
        Ok(healthy)
    }
}

/// Background health-checker loop (§4.A): probes every endpoint on an
/// interval, independent of request traffic.
pub async fn run_health_checker(
    registry: Arc<EndpointRegistry>,
    client: reqwest::Client,
    interval: StdDuration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let names: Vec<String> = registry.list().iter().map(|e| e.name().to_string()).collect();
        for name in names {
            if let Err(e) = registry.check_now(&client, &name).await {
                tracing::warn!(endpoint = %name, error = %e, "health probe failed to run");
            }
        }
    }
}
