use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client as RedisClient};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{config_error, MirrorError, SyncResult};
use crate::models::CalendarEvent;
use crate::traits::MirrorStore;

// Redis key constants
pub mod keys {
    /// Hash of event id -> JSON mirror record
    pub const MIRROR_EVENTS: &str = "calsync:mirror:events";
    pub const GOOGLE_CALENDAR_TOKEN: &str = "google_calendar_token";
}

type Reply<T> = mpsc::Sender<Result<T, MirrorError>>;

/// Commands that can be sent to the Redis actor
pub enum RedisCommand {
    Upsert(Box<CalendarEvent>, Reply<()>),
    Remove(String, Reply<()>),
    RemoveByMaster(String, Reply<()>),
    List(Reply<Vec<CalendarEvent>>),
    GetToken(Reply<Option<Value>>),
    Shutdown,
}

/// The Redis actor owns the connection and processes commands one at a time
pub struct RedisActor {
    client: RedisClient,
    connection: Option<MultiplexedConnection>,
    command_rx: mpsc::Receiver<RedisCommand>,
}

/// Handle for communicating with the Redis actor
#[derive(Clone)]
pub struct RedisActorHandle {
    command_tx: mpsc::Sender<RedisCommand>,
}

impl RedisActorHandle {
    /// A handle whose actor is already gone; every request fails
    pub fn empty() -> Self {
        let (command_tx, _) = mpsc::channel(32);
        Self { command_tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> RedisCommand,
    ) -> Result<T, MirrorError> {
        let (response_tx, mut response_rx) = mpsc::channel(1);
        self.command_tx
            .send(make(response_tx))
            .await
            .map_err(|e| MirrorError::Unavailable(format!("Actor mailbox error: {}", e)))?;

        response_rx
            .recv()
            .await
            .ok_or_else(|| MirrorError::Unavailable("Response channel closed".into()))?
    }

    /// Get the stored OAuth token record, if any
    pub async fn get_token(&self) -> Result<Option<Value>, MirrorError> {
        self.request(RedisCommand::GetToken).await
    }

    /// Shutdown the actor
    pub async fn shutdown(&self) -> SyncResult<()> {
        let _ = self.command_tx.send(RedisCommand::Shutdown).await;
        Ok(())
    }
}

#[async_trait]
impl MirrorStore for RedisActorHandle {
    async fn upsert(&self, event: &CalendarEvent) -> Result<(), MirrorError> {
        let event = Box::new(event.clone());
        self.request(|tx| RedisCommand::Upsert(event, tx)).await
    }

    async fn remove(&self, id: &str) -> Result<(), MirrorError> {
        let id = id.to_string();
        self.request(|tx| RedisCommand::Remove(id, tx)).await
    }

    async fn remove_by_master(&self, master_id: &str) -> Result<(), MirrorError> {
        let master_id = master_id.to_string();
        self.request(|tx| RedisCommand::RemoveByMaster(master_id, tx)).await
    }

    async fn list(&self) -> Result<Vec<CalendarEvent>, MirrorError> {
        self.request(RedisCommand::List).await
    }
}

fn write_failure(what: &str, err: redis::RedisError) -> MirrorError {
    MirrorError::WriteFailed(format!("{}: {}", what, err))
}

fn read_failure(what: &str, err: impl std::fmt::Display) -> MirrorError {
    MirrorError::ReadFailed(format!("{}: {}", what, err))
}

impl RedisActor {
    /// Create a new actor and return its handle. The connection is opened lazily.
    pub fn new(redis_url: &str) -> SyncResult<(Self, RedisActorHandle)> {
        let client = RedisClient::open(redis_url)
            .map_err(|e| config_error(&format!("Invalid REDIS_URL '{}': {}", redis_url, e)))?;
        let (command_tx, command_rx) = mpsc::channel(32);

        let actor = Self { client, connection: None, command_rx };
        Ok((actor, RedisActorHandle { command_tx }))
    }

    /// Start the actor's processing loop
    pub async fn run(&mut self) {
        info!("Redis actor started");

        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                RedisCommand::Upsert(event, response_tx) => {
                    let result = self.upsert_event(&event).await;
                    let _ = response_tx.send(result).await;
                }
                RedisCommand::Remove(id, response_tx) => {
                    let result = self.remove_event(&id).await;
                    let _ = response_tx.send(result).await;
                }
                RedisCommand::RemoveByMaster(master_id, response_tx) => {
                    let result = self.remove_series(&master_id).await;
                    let _ = response_tx.send(result).await;
                }
                RedisCommand::List(response_tx) => {
                    let result = self.list_events().await;
                    let _ = response_tx.send(result).await;
                }
                RedisCommand::GetToken(response_tx) => {
                    let result = self.get_token_from_redis().await;
                    let _ = response_tx.send(result).await;
                }
                RedisCommand::Shutdown => {
                    info!("Redis actor shutting down");
                    break;
                }
            }
        }

        info!("Redis actor shut down");
    }

    /// Cached multiplexed connection, reopened after a failure
    async fn connection(&mut self) -> Result<MultiplexedConnection, MirrorError> {
        if let Some(conn) = &self.connection {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| MirrorError::Unavailable(format!("Failed to connect to Redis: {}", e)))?;
        self.connection = Some(conn.clone());
        Ok(conn)
    }

    fn forget_connection<T>(&mut self, result: &Result<T, MirrorError>) {
        if result.is_err() {
            self.connection = None;
        }
    }

    async fn upsert_event(&mut self, event: &CalendarEvent) -> Result<(), MirrorError> {
        let json = serde_json::to_string(event)
            .map_err(|e| MirrorError::WriteFailed(format!("Failed to serialize event: {}", e)))?;
        let mut conn = self.connection().await?;

        let result: Result<(), MirrorError> = conn
            .hset(keys::MIRROR_EVENTS, &event.id, json)
            .await
            .map_err(|e| write_failure("Failed to save event to Redis", e));
        self.forget_connection(&result);
        debug!("Mirrored event {}", event.id);
        result
    }

    async fn remove_event(&mut self, id: &str) -> Result<(), MirrorError> {
        let mut conn = self.connection().await?;
        let result: Result<i64, MirrorError> = conn
            .hdel(keys::MIRROR_EVENTS, id)
            .await
            .map_err(|e| write_failure("Failed to remove event from Redis", e));
        self.forget_connection(&result);

        match result? {
            0 => Err(MirrorError::NotFound(id.to_string())),
            _ => Ok(()),
        }
    }

    async fn remove_series(&mut self, master_id: &str) -> Result<(), MirrorError> {
        let members: Vec<String> = self
            .list_events()
            .await?
            .into_iter()
            .filter(|e| e.recurring_event_id() == Some(master_id))
            .map(|e| e.id)
            .collect();
        if members.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection().await?;
        let result: Result<i64, MirrorError> = conn
            .hdel(keys::MIRROR_EVENTS, &members)
            .await
            .map_err(|e| write_failure("Failed to remove series from Redis", e));
        self.forget_connection(&result);
        debug!("Removed {} mirrored instances of {}", members.len(), master_id);
        result.map(|_| ())
    }

    async fn list_events(&mut self) -> Result<Vec<CalendarEvent>, MirrorError> {
        let mut conn = self.connection().await?;
        let result: Result<HashMap<String, String>, MirrorError> = conn
            .hgetall(keys::MIRROR_EVENTS)
            .await
            .map_err(|e| read_failure("Failed to read events from Redis", e));
        self.forget_connection(&result);

        let events = result?
            .into_iter()
            .filter_map(|(id, json)| match serde_json::from_str::<CalendarEvent>(&json) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Skipping unreadable mirror record {}: {}", id, e);
                    None
                }
            })
            .collect();
        Ok(events)
    }

    async fn get_token_from_redis(&mut self) -> Result<Option<Value>, MirrorError> {
        let mut conn = self.connection().await?;
        let result: Result<Option<String>, MirrorError> = conn
            .get(keys::GOOGLE_CALENDAR_TOKEN)
            .await
            .map_err(|e| read_failure("Failed to read token from Redis", e));
        self.forget_connection(&result);

        result?
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| read_failure("Failed to deserialize token", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_actor_reports_the_mirror_unavailable() {
        let handle = RedisActorHandle::empty();
        assert!(matches!(handle.remove("abc").await, Err(MirrorError::Unavailable(_))));
        assert!(matches!(handle.list().await, Err(MirrorError::Unavailable(_))));
        assert!(matches!(handle.get_token().await, Err(MirrorError::Unavailable(_))));
        assert!(handle.shutdown().await.is_ok());
    }

    #[test]
    fn read_and_write_failures_are_told_apart() {
        let read = read_failure("Failed to read events from Redis", "boom");
        assert_eq!(read.to_string(), "Mirror read failed: Failed to read events from Redis: boom");
        assert!(matches!(read, MirrorError::ReadFailed(_)));
    }

    #[test]
    fn invalid_urls_are_config_errors() {
        assert!(RedisActor::new("not a url").is_err());
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let (mut actor, handle) = RedisActor::new("redis://127.0.0.1:6379").unwrap();
        let task = tokio::spawn(async move { actor.run().await });
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
