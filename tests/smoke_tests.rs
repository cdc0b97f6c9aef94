use calsync::components::{CalendarSync, Component, ComponentManager};
use calsync::config::{Config, MirrorKind, ProviderKind};
use calsync::models::{DateRange, Draft, EventDetails};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

fn memory_config() -> Arc<RwLock<Config>> {
    Arc::new(RwLock::new(Config {
        provider: ProviderKind::Memory,
        mirror: MirrorKind::Memory,
        ..Config::default()
    }))
}

/// Smoke test to verify that the default config selects the offline backends
#[tokio::test]
async fn test_default_config_is_offline() {
    let config = Config::default();
    assert_eq!(config.provider, ProviderKind::Memory);
    assert_eq!(config.mirror, MirrorKind::Memory);
    assert!(config.is_component_enabled("calendar_sync"));
}

/// Smoke test to verify that the component manager wires up calendar sync
#[tokio::test]
async fn test_component_manager_initialises_calendar_sync() {
    let mut manager = ComponentManager::new(memory_config());
    manager.register(CalendarSync::new());
    manager.init_all(None).await.unwrap();

    let sync = manager.get::<CalendarSync>().expect("calendar_sync registered");
    let services = sync.services().await.expect("services built");

    sync.on_authenticated().await.unwrap();
    // Signing in twice keeps the one poller
    sync.on_authenticated().await.unwrap();
    assert!(services.scheduler.is_running());

    let start = Utc::now() + Duration::days(1);
    let event = services
        .engine
        .create(&Draft::new(EventDetails::new("Smoke", start, start + Duration::hours(1))))
        .await
        .unwrap();
    assert_eq!(
        services
            .engine
            .store()
            .events(&DateRange::new(start - Duration::hours(1), start + Duration::hours(2)))
            .len(),
        1
    );
    assert!(manager.get_component_by_name("calendar_sync").is_some());

    manager.shutdown_all().await.unwrap();
    assert!(!services.scheduler.is_running());
    // Logging out again is harmless
    sync.on_logout().await.unwrap();
    assert_eq!(services.engine.get(&event.id).map(|e| e.id), Some(event.id));
}

/// Disabled components are registered but never initialised
#[tokio::test]
async fn test_disabled_component_is_skipped() {
    let config = memory_config();
    config.write().await.components.insert("calendar_sync".into(), false);
    let mut manager = ComponentManager::new(config);
    manager.register(CalendarSync::new());
    manager.init_all(None).await.unwrap();

    let sync = manager.get::<CalendarSync>().unwrap();
    assert!(sync.services().await.is_none());
    assert!(sync.on_authenticated().await.is_err());
    assert_eq!(sync.name(), "calendar_sync");
}

/// A Redis mirror cannot be built without a running Redis actor
#[tokio::test]
async fn test_redis_mirror_requires_redis() {
    let config = Arc::new(RwLock::new(Config {
        mirror: MirrorKind::Redis,
        ..Config::default()
    }));
    let sync = CalendarSync::new();
    assert!(sync.init(config, None).await.is_err());
    assert!(sync.services().await.is_none());
}
