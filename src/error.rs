use miette::Diagnostic;
use thiserror::Error;

use crate::components::calendar_sync::planner::PlannedOp;
use crate::models::EventId;

/// Errors reported by a calendar provider
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum ProviderError {
    #[error("Provider authentication expired: {0}")]
    #[diagnostic(code(calsync::provider::auth), help("re-authenticate and retry"))]
    AuthExpired(String),

    #[error("Provider rate limit still exceeded after {attempts} attempts")]
    #[diagnostic(code(calsync::provider::rate_limit))]
    RateLimited { attempts: u32 },

    #[error("Event not found at provider: {0}")]
    #[diagnostic(code(calsync::provider::not_found))]
    NotFound(String),

    #[error("Provider rejected the request: {0}")]
    #[diagnostic(code(calsync::provider::validation))]
    Validation(String),

    #[error("Provider error: {0}")]
    #[diagnostic(code(calsync::provider::unknown))]
    Unknown(String),
}

impl ProviderError {
    /// Whether the request may succeed if sent again after a pause
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }
}

/// Errors reported by the persistence mirror
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum MirrorError {
    #[error("Mirror write failed: {0}")]
    #[diagnostic(code(calsync::mirror::write_failed))]
    WriteFailed(String),

    #[error("Mirror read failed: {0}")]
    #[diagnostic(code(calsync::mirror::read_failed))]
    ReadFailed(String),

    #[error("Mirror unavailable: {0}")]
    #[diagnostic(code(calsync::mirror::unavailable))]
    Unavailable(String),

    #[error("No mirror record for {0}")]
    #[diagnostic(code(calsync::mirror::not_found))]
    NotFound(EventId),
}

/// The three stores disagree and the local state could not be fixed without guessing
#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
pub enum ConsistencyError {
    #[error("Delete stopped after {} of {} steps: {reason}", .completed.len(), .completed.len() + .pending.len())]
    #[diagnostic(code(calsync::consistency::partial_delete))]
    PartialDeleteFailure {
        completed: Vec<PlannedOp>,
        pending: Vec<PlannedOp>,
        reason: String,
    },

    #[error("Event {id} may be stale locally after a failed write")]
    #[diagnostic(code(calsync::consistency::stale_write))]
    StaleWrite { id: EventId },

    #[error("Event {id} exists at the provider without a mirror record")]
    #[diagnostic(
        code(calsync::consistency::mirror_orphan),
        help("reconcile this event manually")
    )]
    MirrorOrphan { id: EventId },
}

/// Main error type for the crate
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Mirror(#[from] MirrorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error("Invalid event: {0}")]
    #[diagnostic(code(calsync::validation))]
    Validation(String),

    #[error("Environment error: {0}")]
    #[diagnostic(code(calsync::environment))]
    Environment(String),

    #[error("Configuration error: {0}")]
    #[diagnostic(code(calsync::config))]
    Config(String),

    #[error("Component error: {0}")]
    #[diagnostic(code(calsync::component))]
    Component(String),

    #[error("Polling scheduler is already running")]
    #[diagnostic(code(calsync::scheduler::already_running))]
    SchedulerAlreadyRunning,

    #[error("Polling scheduler is not running")]
    #[diagnostic(code(calsync::scheduler::not_running))]
    SchedulerNotRunning,

    #[error(transparent)]
    #[diagnostic(code(calsync::io))]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(calsync::serialization))]
    Serialization(String),

    #[error("Other error: {0}")]
    #[diagnostic(code(calsync::other))]
    Other(String),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Type alias for Result with our Error type
pub type SyncResult<T> = Result<T, Error>;

/// Helper to create environment errors
pub fn env_error(var: &str) -> Error {
    Error::Environment(format!("Invalid or missing environment variable: {}", var))
}

/// Helper to create configuration errors
pub fn config_error(message: &str) -> Error {
    Error::Config(message.to_string())
}

/// Helper to create component errors
pub fn component_error(message: &str) -> Error {
    Error::Component(message.to_string())
}

/// Helper to create validation errors
pub fn validation_error(message: &str) -> Error {
    Error::Validation(message.to_string())
}
