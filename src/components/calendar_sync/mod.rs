//! Calendar synchronisation: engine, cache, poller and contact suggestions

pub mod contacts;
pub mod engine;
pub mod event_store;
pub mod planner;
pub mod refresh;
pub mod scheduler;
pub mod write_tracker;

pub use contacts::{AttendeeHistory, ContactSuggester};
pub use engine::ReconciliationEngine;
pub use event_store::{EventStore, ReconcileStats, Version, VersionSnapshot};
pub use planner::{plan, PlannedOp, SeriesContext};
pub use scheduler::{PollOutcome, PollingScheduler, DEFAULT_POLL_INTERVAL};
pub use write_tracker::{WriteGuard, WriteTracker};

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::google_calendar::{GoogleCalendarClient, RedisTokenSource, StaticToken, TokenSource};
use super::memory::{InMemoryMirror, InMemoryProvider};
use super::redis_service::RedisActorHandle;
use crate::config::{Config, MirrorKind, ProviderKind};
use crate::error::{component_error, config_error, env_error, Error, ProviderError, SyncResult};
use crate::traits::{MirrorStore, ProviderClient};

/// Everything a caller needs once the component is initialised
#[derive(Clone)]
pub struct SyncServices {
    pub engine: ReconciliationEngine,
    pub scheduler: Arc<PollingScheduler>,
    pub contacts: ContactSuggester,
}

fn build_provider(config: &Config, redis: Option<&RedisActorHandle>) -> SyncResult<Arc<dyn ProviderClient>> {
    match config.provider {
        ProviderKind::Memory => Ok(Arc::new(InMemoryProvider::new())),
        ProviderKind::Google => {
            let tokens: Arc<dyn TokenSource> = match (&config.google_access_token, redis) {
                (Some(token), _) => Arc::new(StaticToken::new(token.clone())),
                (None, Some(redis)) => Arc::new(RedisTokenSource::new(redis.clone())),
                (None, None) => return Err(env_error("GOOGLE_ACCESS_TOKEN")),
            };
            let client = GoogleCalendarClient::new(
                &config.google_api_base_url,
                &config.google_people_base_url,
                config.google_calendar_id.clone(),
                tokens,
                config.retry_policy(),
            )
            .map_err(|e| config_error(&format!("Invalid Google API URL: {}", e)))?;
            Ok(Arc::new(client))
        }
    }
}

fn build_mirror(config: &Config, redis: Option<&RedisActorHandle>) -> SyncResult<Arc<dyn MirrorStore>> {
    match (config.mirror, redis) {
        (MirrorKind::Memory, _) => Ok(Arc::new(InMemoryMirror::new())),
        (MirrorKind::Redis, Some(redis)) => Ok(Arc::new(redis.clone())),
        (MirrorKind::Redis, None) => Err(component_error("Redis mirror selected but Redis is not running")),
    }
}

/// Wire provider, mirror, engine and poller together from `config`
pub fn build_services(config: &Config, redis: Option<&RedisActorHandle>) -> SyncResult<SyncServices> {
    let provider = build_provider(config, redis)?;
    let mirror = build_mirror(config, redis)?;
    let history = Arc::new(match &config.attendee_history_path {
        Some(path) => AttendeeHistory::open(path)?,
        None => AttendeeHistory::in_memory(),
    });

    let engine = ReconciliationEngine::new(
        Arc::clone(&provider),
        mirror,
        config.sync_window(),
        Some(Arc::clone(&history)),
    );
    let scheduler = Arc::new(PollingScheduler::new(&engine, config.poll_interval()));
    let contacts = ContactSuggester::new(provider, history);

    Ok(SyncServices { engine, scheduler, contacts })
}

/// Keeps the calendar in sync while the user is signed in
#[derive(Default)]
pub struct CalendarSync {
    services: RwLock<Option<SyncServices>>,
}

impl CalendarSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the services if the component has been initialised
    pub async fn services(&self) -> Option<SyncServices> {
        self.services.read().await.clone()
    }

    /// Start polling. Calling this while polling is already running is a no-op.
    pub async fn on_authenticated(&self) -> SyncResult<()> {
        let services = self
            .services()
            .await
            .ok_or_else(|| component_error("calendar_sync is not initialised"))?;

        let result = services.scheduler.start(|err: &ProviderError| {
            if let ProviderError::AuthExpired(_) = err {
                warn!("Calendar access expired; sign in again to resume syncing");
            }
        });
        match result {
            Err(Error::SchedulerAlreadyRunning) => Ok(()),
            other => other,
        }
    }

    /// Stop polling. Calling this while signed out is a no-op.
    pub async fn on_logout(&self) -> SyncResult<()> {
        let Some(services) = self.services().await else {
            return Ok(());
        };
        match services.scheduler.stop().await {
            Err(Error::SchedulerNotRunning) => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl super::Component for CalendarSync {
    fn name(&self) -> &'static str {
        "calendar_sync"
    }

    async fn init(&self, config: Arc<RwLock<Config>>, redis_handle: Option<RedisActorHandle>) -> SyncResult<()> {
        let mut services = self.services.write().await;
        if services.is_none() {
            let config = config.read().await;
            *services = Some(build_services(&config, redis_handle.as_ref())?);
            info!(
                "Calendar sync ready ({:?} provider, {:?} mirror)",
                config.provider, config.mirror
            );
        }
        Ok(())
    }

    async fn shutdown(&self) -> SyncResult<()> {
        self.on_logout().await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
