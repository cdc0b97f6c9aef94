use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::components::redis_service::RedisActorHandle;
use crate::error::ProviderError;

/// Where the Google client gets its bearer token from
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, ProviderError>;
}

/// A fixed token, usually from `GOOGLE_ACCESS_TOKEN`
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, ProviderError> {
        if self.0.is_empty() {
            return Err(ProviderError::AuthExpired("no access token configured".into()));
        }
        Ok(self.0.clone())
    }
}

/// Token record written to Redis by the login flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix timestamp in seconds
    pub expires_at: i64,
}

impl StoredToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now().timestamp()
    }
}

/// Reads the token stored in Redis on every request.
/// Refreshing happens outside this crate; an expired record is reported as such.
#[derive(Clone)]
pub struct RedisTokenSource {
    redis: RedisActorHandle,
}

impl RedisTokenSource {
    pub fn new(redis: RedisActorHandle) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl TokenSource for RedisTokenSource {
    async fn access_token(&self) -> Result<String, ProviderError> {
        let stored = self
            .redis
            .get_token()
            .await
            .map_err(|e| ProviderError::Unknown(format!("Failed to read token from Redis: {}", e)))?
            .ok_or_else(|| ProviderError::AuthExpired("no token stored, sign in first".into()))?;

        let token: StoredToken = serde_json::from_value(stored)
            .map_err(|e| ProviderError::Unknown(format!("Failed to parse token JSON: {}", e)))?;

        if token.is_expired() {
            return Err(ProviderError::AuthExpired("stored token has expired".into()));
        }
        Ok(token.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_static_token_is_treated_as_signed_out() {
        let result = StaticToken::new("").access_token().await;
        assert!(matches!(result, Err(ProviderError::AuthExpired(_))));
    }

    #[test]
    fn past_expiry_is_expired() {
        let token = StoredToken {
            access_token: "abc".into(),
            refresh_token: None,
            expires_at: Utc::now().timestamp() - 10,
        };
        assert!(token.is_expired());
    }
}
