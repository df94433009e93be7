//! Event Bus (§4.J): typed pub/sub with per-topic rate limiting.
//!
//! The core publishes onto the bus with no knowledge of any transport; a
//! dashboard or log sink subscribes independently and owns its own
//! back-pressure policy. Publishing never blocks the forwarding path:
//! subscriber sends are non-blocking and a full channel just drops the event
//! (counted), the same way the teacher never lets a metrics-recording
//! failure fail the request it's describing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::metrics::Metrics;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    RequestLifecycle,
    EndpointHealth,
    GroupStatus,
    ConnectionStats,
    System,
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    EndpointHealthy {
        endpoint: String,
    },
    EndpointUnhealthy {
        endpoint: String,
        reason: String,
    },
    GroupStatusChanged {
        group: String,
        reason: String,
    },
    GroupHealthStatsChanged {
        group: String,
        healthy: usize,
        total: usize,
    },
    LifecycleTransition {
        request_id: String,
        status: String,
    },
}

struct TopicState {
    subscribers: Vec<mpsc::Sender<BusEvent>>,
    last_broadcast: Option<Instant>,
}

impl Default for TopicState {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            last_broadcast: None,
        }
    }
}

pub struct EventBus {
    topics: Mutex<HashMap<Topic, TopicState>>,
    min_interval: Duration,
    metrics: Arc<Metrics>,
}

impl EventBus {
    pub fn new(min_interval: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            min_interval,
            metrics,
        }
    }

    pub async fn subscribe(&self, topic: Topic) -> mpsc::Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut topics = self.topics.lock().await;
        topics.entry(topic).or_default().subscribers.push(tx);
        rx
    }

    /// Publishes `event` on `topic`. Drops the event entirely (without
    /// reaching any subscriber) if it arrives within `min_interval` of the
    /// last broadcast event on that topic (§4.J, invariant 6 in §8).
    pub async fn publish(&self, topic: Topic, event: BusEvent) {
        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic).or_default();

        let now = Instant::now();
        if let Some(last) = state.last_broadcast {
            if now.duration_since(last) < self.min_interval {
                self.metrics.bus_event_dropped();
                return;
            }
        }
        state.last_broadcast = Some(now);

        state.subscribers.retain(|tx| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.bus_event_dropped();
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().unwrap())
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(Duration::from_millis(0), metrics());
        let mut rx = bus.subscribe(Topic::EndpointHealth).await;
        bus.publish(
            Topic::EndpointHealth,
            BusEvent::EndpointHealthy { endpoint: "e1".into() },
        )
        .await;
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, BusEvent::EndpointHealthy { endpoint } if endpoint == "e1"));
    }

    #[tokio::test]
    async fn rate_limits_within_min_interval() {
        let bus = EventBus::new(Duration::from_secs(60), metrics());
        let mut rx = bus.subscribe(Topic::System).await;
        bus.publish(Topic::System, BusEvent::GroupStatusChanged { group: "a".into(), reason: "x".into() }).await;
        bus.publish(Topic::System, BusEvent::GroupStatusChanged { group: "b".into(), reason: "y".into() }).await;
        // Only the first event should have been delivered.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = EventBus::new(Duration::from_secs(60), metrics());
        let mut health_rx = bus.subscribe(Topic::EndpointHealth).await;
        let mut group_rx = bus.subscribe(Topic::GroupStatus).await;
        bus.publish(Topic::EndpointHealth, BusEvent::EndpointHealthy { endpoint: "e1".into() }).await;
        bus.publish(Topic::GroupStatus, BusEvent::GroupStatusChanged { group: "a".into(), reason: "x".into() }).await;
        assert!(health_rx.try_recv().is_ok());
        assert!(group_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_without_error() {
        let bus = EventBus::new(Duration::from_millis(0), metrics());
        {
            let _rx = bus.subscribe(Topic::System).await;
        }
        // subscriber dropped; publish should just prune it, not panic
        bus.publish(Topic::System, BusEvent::GroupStatusChanged { group: "a".into(), reason: "x".into() }).await;
    }
}
