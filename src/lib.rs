//! Keeps a calendar provider, a persisted mirror and an in-memory cache
//! consistent while recurring events are created, edited and deleted.

pub mod components;
pub mod config;
pub mod error;
pub mod models;
pub mod shutdown;
pub mod startup;
pub mod traits;
pub mod utils;

pub use components::calendar_sync::{
    AttendeeHistory, ContactSuggester, EventStore, PlannedOp, PollingScheduler,
    ReconciliationEngine,
};
pub use error::{ConsistencyError, Error, MirrorError, ProviderError, SyncResult};
pub use models::{CalendarEvent, DateRange, DeleteScope, Draft, EventDetails, Recurrence};
pub use traits::{MirrorStore, ProviderClient};
