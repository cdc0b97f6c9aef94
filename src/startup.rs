use crate::components::redis_service::{RedisActor, RedisActorHandle};
use crate::components::{CalendarSync, ComponentManager};
use crate::config::{Config, MirrorKind, ProviderKind};
use crate::error::Error;
use crate::shutdown;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize logging with environment-based configuration
pub fn init_logging() -> miette::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,calsync=debug,hyper=warn,reqwest=warn")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Other(format!("Failed to set up logging: {}", e)))?;

    Ok(())
}

/// Load and initialize the application config
pub async fn load_config() -> miette::Result<Arc<RwLock<Config>>> {
    match Config::load() {
        Ok(config) => Ok(Arc::new(RwLock::new(config))),
        Err(e) => {
            error!("Failed to load configuration: {:?}", e);
            Err(e.into())
        }
    }
}

fn needs_redis(config: &Config) -> bool {
    config.mirror == MirrorKind::Redis
        || (config.provider == ProviderKind::Google && config.google_access_token.is_none())
}

/// Spawn the Redis actor if the configuration uses Redis for anything
async fn start_redis(config: &Arc<RwLock<Config>>) -> miette::Result<Option<RedisActorHandle>> {
    let config = config.read().await;
    if !needs_redis(&config) {
        return Ok(None);
    }

    let (mut redis_actor, redis_handle) = RedisActor::new(&config.redis_url)?;
    tokio::spawn(async move {
        redis_actor.run().await;
    });
    info!("Redis actor started");
    Ok(Some(redis_handle))
}

/// Build the components and keep the calendar in sync until a shutdown signal arrives
pub async fn run(config: Arc<RwLock<Config>>) -> miette::Result<()> {
    let redis_handle = start_redis(&config).await?;

    let mut component_manager = ComponentManager::new(Arc::clone(&config));
    component_manager.register(CalendarSync::new());
    let component_manager = Arc::new(component_manager);

    component_manager.init_all(redis_handle.clone()).await?;

    match component_manager.get::<CalendarSync>() {
        Some(sync) if sync.services().await.is_some() => {
            sync.on_authenticated().await?;
        }
        _ => info!("Calendar sync is not running; waiting for shutdown"),
    }

    let (shutdown_send, shutdown_recv) = oneshot::channel();
    let shutdown_components = Arc::clone(&component_manager);
    tokio::spawn(async move {
        shutdown::handle_signals(shutdown_send, shutdown_components, redis_handle).await;
    });

    if shutdown_recv.await.is_err() {
        error!("Signal handler exited without completing shutdown");
    }
    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_is_only_needed_for_the_redis_mirror_or_stored_tokens() {
        let mut config = Config::default();
        assert!(!needs_redis(&config));

        config.provider = ProviderKind::Google;
        assert!(needs_redis(&config));

        config.google_access_token = Some("token".into());
        assert!(!needs_redis(&config));

        config.mirror = MirrorKind::Redis;
        assert!(needs_redis(&config));
    }
}
