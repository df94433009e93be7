//! HTTP request handlers for the proxy.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::EventBus;
use crate::config::Config;
use crate::controller::Controller;
use crate::error::StartupError;
use crate::groups::GroupManager;
use crate::metrics::Metrics;
use crate::registry::EndpointRegistry;
use crate::suspension::SuspensionQueue;
use crate::tracking::UsageTracker;

pub mod forward;
pub mod health;
pub mod management;
pub mod metrics;

const BUS_MIN_INTERVAL: Duration = Duration::from_millis(100);
const USAGE_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Application state shared across all handlers. All fields are cheaply
/// clonable (`Arc` or an internally-`Arc`'d client), mirroring the teacher's
/// `AppState` pattern.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    registry: Arc<EndpointRegistry>,
    groups: Arc<GroupManager>,
    suspension: Arc<SuspensionQueue>,
    controller: Arc<Controller>,
    metrics: Arc<Metrics>,
    bus: Arc<EventBus>,
    tracker: Arc<UsageTracker>,
    usage_tx: tokio::sync::mpsc::Sender<crate::lifecycle::UsageEvent>,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Result<Self, StartupError> {
        let metrics = Arc::new(Metrics::new().map_err(|e| StartupError::Config(e.to_string()))?);
        let bus = Arc::new(EventBus::new(BUS_MIN_INTERVAL, metrics.clone()));
        let registry = Arc::new(EndpointRegistry::new(config.endpoints.clone(), bus.clone()));
        let groups = Arc::new(GroupManager::new(registry.clone(), bus.clone()));
        let suspension = SuspensionQueue::new(config.request_suspend.max_suspended_requests, metrics.clone());

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| StartupError::Config(format!("failed to build http client: {e}")))?;

        let controller = Controller::new(
            registry.clone(),
            groups.clone(),
            suspension.clone(),
            metrics.clone(),
            http,
            &config.retry,
            config.request_suspend.clone(),
            config.server.request_timeout_seconds,
            config.model_pricing.clone(),
        );

        let tz = config.tracking.tz().map_err(StartupError::Config)?;
        let tracker = UsageTracker::open(&config.tracking.database_path, tz)?;
        let (usage_tx, usage_rx) = crate::tracking::bounded_channel(config.tracking.buffer_size);
        tracker.spawn_writer(usage_rx, config.tracking.batch_size, USAGE_FLUSH_INTERVAL);

        Ok(Self {
            config,
            registry,
            groups,
            suspension,
            controller,
            metrics,
            bus,
            tracker,
            usage_tx,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }
    pub fn groups(&self) -> &Arc<GroupManager> {
        &self.groups
    }
    pub fn suspension(&self) -> &Arc<SuspensionQueue> {
        &self.suspension
    }
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
    pub fn tracker(&self) -> &Arc<UsageTracker> {
        &self.tracker
    }
    pub fn usage_tx(&self) -> tokio::sync::mpsc::Sender<crate::lifecycle::UsageEvent> {
        self.usage_tx.clone()
    }

    /// Spawns the health-checker and suspension-recovery background tasks.
    /// Separate from `new` so tests can build an `AppState` without
    /// starting timers.
    pub fn spawn_background_tasks(&self, health_check_interval: Duration, http: reqwest::Client) {
        tokio::spawn(crate::registry::run_health_checker(self.registry.clone(), http, health_check_interval));

        let bus = self.bus.clone();
        let suspension = self.suspension.clone();
        tokio::spawn(async move {
            let mut health_rx = bus.subscribe(crate::bus::Topic::EndpointHealth).await;
            let mut group_rx = bus.subscribe(crate::bus::Topic::GroupStatus).await;
            loop {
                tokio::select! {
                    event = health_rx.recv() => {
                        match event {
                            Some(crate::bus::BusEvent::EndpointHealthy { .. }) => suspension.notify_recovery().await,
                            Some(_) => {}
                            None => break,
                        }
                    }
                    event = group_rx.recv() => {
                        match event {
                            Some(crate::bus::BusEvent::GroupStatusChanged { reason, .. })
                                if reason == "resumed" || reason == "force_activated" =>
                            {
                                suspension.notify_recovery().await;
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
        });
    }
}
