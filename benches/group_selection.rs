//! Group Manager selection benchmark (§4.B).
//!
//! Measures `GroupManager::next_group`'s cost across a handful of groups,
//! the hot path run once per forward attempt.

use std::sync::Arc;
use std::time::Duration;

use claudefront::bus::EventBus;
use claudefront::config::EndpointConfig;
use claudefront::groups::GroupManager;
use claudefront::metrics::Metrics;
use claudefront::registry::EndpointRegistry;
use criterion::{Criterion, criterion_group, criterion_main};

fn endpoint(name: &str, group: &str, group_priority: u32) -> EndpointConfig {
    let toml_str = format!(
        r#"name = "{name}"
url = "https://example.com"
token = "x"
priority = 1
group = "{group}"
group_priority = {group_priority}
"#
    );
    toml::from_str(&toml_str).unwrap()
}

fn setup() -> (Arc<EndpointRegistry>, Arc<GroupManager>) {
    let bus = Arc::new(EventBus::new(Duration::from_millis(0), Arc::new(Metrics::new().unwrap())));
    let endpoints = vec![
        endpoint("main-1", "main", 1),
        endpoint("main-2", "main", 1),
        endpoint("backup-1", "backup", 2),
        endpoint("backup-2", "backup", 2),
        endpoint("overflow-1", "overflow", 3),
    ];
    let registry = Arc::new(EndpointRegistry::new(endpoints, bus.clone()));
    let groups = Arc::new(GroupManager::new(registry.clone(), bus));
    (registry, groups)
}

fn bench_next_group(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (registry, groups) = runtime.block_on(async {
        let (registry, groups) = setup();
        registry.mark_healthy("main-1", 5).await;
        registry.mark_healthy("backup-1", 5).await;
        registry.mark_healthy("overflow-1", 5).await;
        (registry, groups)
    });
    let _ = &registry;

    c.bench_function("next_group_healthy_tiers", |b| {
        b.to_async(&runtime).iter(|| async { groups.next_group(&Default::default()).await })
    });
}

criterion_group!(benches, bench_next_group);
criterion_main!(benches);
