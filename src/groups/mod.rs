//! Group Manager (§4.B).
//!
//! Groups are derived from endpoint configuration (`endpoint.group`,
//! `endpoint.group_priority`) rather than configured as their own top-level
//! entity — generalizes the teacher's fixed three-tier `ModelsConfig{fast,
//! balanced,deep}` into N named groups. Priority direction is inverted from
//! the teacher's selector (there, higher priority wins; here, per §3, lower
//! priority is preferred) — see DESIGN.md.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;

use crate::bus::{BusEvent, EventBus, Topic};
use crate::registry::EndpointRegistry;

#[derive(Debug, Clone, Default)]
struct GroupState {
    paused: bool,
    force_activated: bool,
    cooldown_until: Option<DateTime<Utc>>,
}

pub struct GroupManager {
    registry: Arc<EndpointRegistry>,
    priorities: HashMap<String, u32>,
    states: RwLock<HashMap<String, GroupState>>,
    bus: Arc<EventBus>,
}

#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub name: String,
    pub priority: u32,
    pub paused: bool,
    pub force_activated: bool,
    pub in_cooldown: bool,
    pub healthy_endpoints: usize,
    pub total_endpoints: usize,
}

impl GroupManager {
    pub fn new(registry: Arc<EndpointRegistry>, bus: Arc<EventBus>) -> Self {
        let mut priorities = HashMap::new();
        let mut states = HashMap::new();
        for endpoint in registry.list() {
            priorities
                .entry(endpoint.group().to_string())
                .and_modify(|p: &mut u32| *p = (*p).min(endpoint.group_priority()))
                .or_insert(endpoint.group_priority());
            states.entry(endpoint.group().to_string()).or_insert_with(GroupState::default);
        }
        Self {
            registry,
            priorities,
            states: RwLock::new(states),
            bus,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.priorities.keys().cloned().collect()
    }

    fn priority_of(&self, name: &str) -> u32 {
        self.priorities.get(name).copied().unwrap_or(u32::MAX)
    }

    async fn in_cooldown(&self, name: &str) -> bool {
        self.states
            .read()
            .await
            .get(name)
            .and_then(|s| s.cooldown_until)
            .map(|until| Utc::now() < until)
            .unwrap_or(false)
    }

    /// Selects the next group to try for a request, given the set of groups
    /// already attempted this wave (§4.B). If a force-activated candidate is
    /// selected, its force-activation is consumed here so a subsequent wave
    /// falls back to ordinary priority/health selection (Open Question b).
    pub async fn next_group(&self, tried: &HashSet<String>) -> Option<String> {
        let mut candidates = Vec::new();
        for name in self.priorities.keys() {
            if tried.contains(name) {
                continue;
            }
            let states = self.states.read().await;
            let state = states.get(name).cloned().unwrap_or_default();
            drop(states);
            if state.paused || self.in_cooldown(name).await {
                continue;
            }
            candidates.push((name.clone(), state));
        }

        if let Some((name, _)) = candidates
            .iter()
            .filter(|(_, s)| s.force_activated)
            .min_by(|a, b| self.priority_of(&a.0).cmp(&self.priority_of(&b.0)).then_with(|| a.0.cmp(&b.0)))
            .cloned()
        {
            self.states.write().await.entry(name.clone()).and_modify(|s| s.force_activated = false);
            return Some(name);
        }

        let mut healthy_candidates = Vec::new();
        for (name, _) in &candidates {
            let members = self.registry.list_for_group(name).await;
            let mut any_healthy = false;
            for endpoint in &members {
                if endpoint.is_selectable().await {
                    any_healthy = true;
                    break;
                }
            }
            if any_healthy {
                healthy_candidates.push(name.clone());
            }
        }

        healthy_candidates
            .into_iter()
            .min_by(|a, b| self.priority_of(a).cmp(&self.priority_of(b)).then_with(|| a.cmp(b)))
    }

    pub async fn pause(&self, name: &str) {
        self.states.write().await.entry(name.to_string()).or_default().paused = true;
        self.bus
            .publish(Topic::GroupStatus, BusEvent::GroupStatusChanged { group: name.to_string(), reason: "paused".into() })
            .await;
    }

    pub async fn resume(&self, name: &str) {
        self.states.write().await.entry(name.to_string()).or_default().paused = false;
        self.bus
            .publish(Topic::GroupStatus, BusEvent::GroupStatusChanged { group: name.to_string(), reason: "resumed".into() })
            .await;
    }

    pub async fn force_activate(&self, name: &str) {
        self.states.write().await.entry(name.to_string()).or_default().force_activated = true;
        self.bus
            .publish(Topic::GroupStatus, BusEvent::GroupStatusChanged { group: name.to_string(), reason: "force_activated".into() })
            .await;
    }

    pub async fn start_cooldown(&self, name: &str, duration: StdDuration) {
        let deadline = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
        self.states.write().await.entry(name.to_string()).or_default().cooldown_until = Some(deadline);
    }

    pub async fn status(&self, name: &str) -> Option<GroupStatus> {
        if !self.priorities.contains_key(name) {
            return None;
        }
        let state = self.states.read().await.get(name).cloned().unwrap_or_default();
        let members = self.registry.list_for_group(name).await;
        let mut healthy = 0;
        for endpoint in &members {
            if endpoint.is_healthy().await {
                healthy += 1;
            }
        }
        Some(GroupStatus {
            name: name.to_string(),
            priority: self.priority_of(name),
            paused: state.paused,
            force_activated: state.force_activated,
            in_cooldown: self.in_cooldown(name).await,
            healthy_endpoints: healthy,
            total_endpoints: members.len(),
        })
    }

    pub async fn all_statuses(&self) -> Vec<GroupStatus> {
        let mut out = Vec::new();
        for name in self.names() {
            if let Some(status) = self.status(&name).await {
                out.push(status);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::EndpointConfig;
    use crate::metrics::Metrics;
    use crate::registry::EndpointRegistry;

    fn endpoint(name: &str, priority: u32, group: &str, group_priority: u32) -> EndpointConfig {
        let toml_str = format!(
            r#"name = "{name}"
url = "https://example.com"
token = "x"
priority = {priority}
group = "{group}"
group_priority = {group_priority}
"#
        );
        toml::from_str(&toml_str).unwrap()
    }

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new(StdDuration::from_millis(0), Arc::new(Metrics::new().unwrap())))
    }

    async fn setup(endpoints: Vec<EndpointConfig>) -> (Arc<EndpointRegistry>, GroupManager) {
        let b = bus();
        let registry = Arc::new(EndpointRegistry::new(endpoints, b.clone()));
        let manager = GroupManager::new(registry.clone(), b);
        (registry, manager)
    }

    #[tokio::test]
    async fn lower_group_priority_preferred_when_healthy() {
        let (registry, manager) = setup(vec![
            endpoint("e-main", 1, "main", 2),
            endpoint("e-backup", 1, "backup", 1),
        ])
        .await;
        registry.mark_healthy("e-main", 5).await;
        registry.mark_healthy("e-backup", 5).await;

        let tried = HashSet::new();
        assert_eq!(manager.next_group(&tried).await, Some("backup".to_string()));
    }

    #[tokio::test]
    async fn unhealthy_group_is_skipped_for_a_healthy_one() {
        let (registry, manager) = setup(vec![
            endpoint("e-main", 1, "main", 1),
            endpoint("e-backup", 1, "backup", 2),
        ])
        .await;
        registry.mark_healthy("e-backup", 5).await;
        // "main" has priority 1 (preferred) but no healthy endpoints.
        let tried = HashSet::new();
        assert_eq!(manager.next_group(&tried).await, Some("backup".to_string()));
    }

    #[tokio::test]
    async fn paused_group_is_never_selected() {
        let (registry, manager) = setup(vec![endpoint("e1", 1, "main", 1)]).await;
        registry.mark_healthy("e1", 5).await;
        manager.pause("main").await;
        assert_eq!(manager.next_group(&HashSet::new()).await, None);
    }

    #[tokio::test]
    async fn force_activate_bypasses_health_for_one_wave_only() {
        let (_registry, manager) = setup(vec![endpoint("e1", 1, "main", 1)]).await;
        // e1 never marked healthy.
        manager.force_activate("main").await;
        assert_eq!(manager.next_group(&HashSet::new()).await, Some("main".to_string()));
        // Second wave: force-activation consumed, group is unhealthy, so unselectable.
        assert_eq!(manager.next_group(&HashSet::new()).await, None);
    }

    #[tokio::test]
    async fn tried_groups_are_excluded() {
        let (registry, manager) = setup(vec![endpoint("e1", 1, "main", 1)]).await;
        registry.mark_healthy("e1", 5).await;
        let mut tried = HashSet::new();
        tried.insert("main".to_string());
        assert_eq!(manager.next_group(&tried).await, None);
    }
}
