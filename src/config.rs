use crate::error::{env_error, SyncResult};
use crate::utils::retry::RetryPolicy;
use crate::utils::time::SyncWindow;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Where committed events live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Memory,
}

/// Where mirror records are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorKind {
    Redis,
    Memory,
}

impl FromStr for ProviderKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "google" => Ok(ProviderKind::Google),
            "memory" => Ok(ProviderKind::Memory),
            _ => Err(env_error("CALENDAR_PROVIDER")),
        }
    }
}

impl FromStr for MirrorKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Ok(MirrorKind::Redis),
            "memory" => Ok(MirrorKind::Memory),
            _ => Err(env_error("MIRROR_BACKEND")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub provider: ProviderKind,
    pub mirror: MirrorKind,
    /// Google Calendar ID to keep in sync
    pub google_calendar_id: String,
    /// Bearer token; when absent the token stored in Redis is used
    pub google_access_token: Option<String>,
    pub google_api_base_url: String,
    pub google_people_base_url: String,
    pub redis_url: String,
    pub poll_interval_secs: u64,
    pub sync_days_back: u32,
    pub sync_days_ahead: u32,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Attendee history file; kept in memory only when unset
    pub attendee_history_path: Option<PathBuf>,
    /// Map of component names to their enabled status
    pub components: HashMap<String, bool>,
}

impl Default for Config {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let window = SyncWindow::default();
        let mut components = HashMap::new();
        components.insert("calendar_sync".to_string(), true);

        Self {
            provider: ProviderKind::Memory,
            mirror: MirrorKind::Memory,
            google_calendar_id: "primary".to_string(),
            google_access_token: None,
            google_api_base_url: crate::components::google_calendar::DEFAULT_API_BASE_URL.to_string(),
            google_people_base_url: crate::components::google_calendar::DEFAULT_PEOPLE_BASE_URL
                .to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            poll_interval_secs: 30,
            sync_days_back: window.days_back,
            sync_days_ahead: window.days_ahead,
            retry_max_attempts: retry.max_attempts,
            retry_base_delay_ms: retry.base_delay.as_millis() as u64,
            retry_max_delay_ms: retry.max_delay.as_millis() as u64,
            attendee_history_path: None,
            components,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> SyncResult<T> {
    match lookup(name) {
        Some(value) => value.trim().parse::<T>().map_err(|_| env_error(name)),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment and config file
    pub fn load() -> SyncResult<Self> {
        // Load .env file if it exists
        dotenv().ok();

        let mut config = Self::from_lookup(|name| env::var(name).ok())?;

        // Load components configuration from file if it exists
        if let Ok(content) = fs::read_to_string("config/components.toml") {
            let file_components = toml::from_str::<HashMap<String, bool>>(&content)?;
            config.components.extend(file_components);
        }

        Ok(config)
    }

    /// Build a configuration from variables returned by `lookup`, defaults for the rest
    pub fn from_lookup(source: impl Fn(&str) -> Option<String>) -> SyncResult<Self> {
        let defaults = Self::default();
        let lookup = |name: &str| source(name).filter(|v| !v.trim().is_empty());

        let provider = parse_var(&lookup, "CALENDAR_PROVIDER", ProviderKind::Google)?;
        let mirror = parse_var(&lookup, "MIRROR_BACKEND", MirrorKind::Redis)?;

        let google_calendar_id = match (provider, lookup("GOOGLE_CALENDAR_ID")) {
            (_, Some(id)) => id,
            (ProviderKind::Google, None) => return Err(env_error("GOOGLE_CALENDAR_ID")),
            (ProviderKind::Memory, None) => defaults.google_calendar_id,
        };

        let config = Config {
            provider,
            mirror,
            google_calendar_id,
            google_access_token: lookup("GOOGLE_ACCESS_TOKEN"),
            google_api_base_url: lookup("GOOGLE_API_BASE_URL").unwrap_or(defaults.google_api_base_url),
            google_people_base_url: lookup("GOOGLE_PEOPLE_BASE_URL")
                .unwrap_or(defaults.google_people_base_url),
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            poll_interval_secs: parse_var(&lookup, "POLL_INTERVAL_SECS", defaults.poll_interval_secs)?,
            sync_days_back: parse_var(&lookup, "SYNC_DAYS_BACK", defaults.sync_days_back)?,
            sync_days_ahead: parse_var(&lookup, "SYNC_DAYS_AHEAD", defaults.sync_days_ahead)?,
            retry_max_attempts: parse_var(&lookup, "RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
            retry_base_delay_ms: parse_var(&lookup, "RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms)?,
            retry_max_delay_ms: parse_var(&lookup, "RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms)?,
            attendee_history_path: lookup("ATTENDEE_HISTORY_PATH").map(PathBuf::from),
            components: defaults.components,
        };

        if config.poll_interval_secs == 0 {
            return Err(env_error("POLL_INTERVAL_SECS"));
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sync_window(&self) -> SyncWindow {
        SyncWindow { days_back: self.sync_days_back, days_ahead: self.sync_days_ahead }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    /// Check if a component is enabled
    pub fn is_component_enabled(&self, name: &str) -> bool {
        *self.components.get(name).unwrap_or(&false)
    }

    /// Update component enabled status
    pub fn set_component_enabled(&mut self, name: &str, enabled: bool) -> SyncResult<()> {
        self.components.insert(name.to_string(), enabled);
        self.save_components(Path::new("config"))
    }

    /// Save component configuration to `dir/components.toml`
    fn save_components(&self, dir: &Path) -> SyncResult<()> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }

        let toml_str = toml::to_string(&self.components)
            .map_err(|e| crate::error::config_error(&e.to_string()))?;
        fs::write(dir.join("components.toml"), toml_str)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn google_provider_needs_a_calendar_id() {
        assert!(Config::from_lookup(vars(&[])).is_err());

        let config = Config::from_lookup(vars(&[("GOOGLE_CALENDAR_ID", "team@example.com")])).unwrap();
        assert_eq!(config.provider, ProviderKind::Google);
        assert_eq!(config.mirror, MirrorKind::Redis);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn numeric_settings_are_validated() {
        let config = Config::from_lookup(vars(&[
            ("CALENDAR_PROVIDER", "memory"),
            ("MIRROR_BACKEND", "memory"),
            ("POLL_INTERVAL_SECS", "5"),
            ("RETRY_MAX_ATTEMPTS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.retry_policy().max_attempts, 2);

        let bad = Config::from_lookup(vars(&[("CALENDAR_PROVIDER", "memory"), ("SYNC_DAYS_BACK", "soon")]));
        assert!(bad.is_err());
        let zero = Config::from_lookup(vars(&[("CALENDAR_PROVIDER", "memory"), ("POLL_INTERVAL_SECS", "0")]));
        assert!(zero.is_err());
    }

    #[test]
    fn component_toggles_round_trip_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.components.insert("calendar_sync".into(), false);
        config.save_components(dir.path()).unwrap();

        let content = fs::read_to_string(dir.path().join("components.toml")).unwrap();
        let loaded: HashMap<String, bool> = toml::from_str(&content).unwrap();
        assert_eq!(loaded.get("calendar_sync"), Some(&false));
    }
}
