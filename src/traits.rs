use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{MirrorError, ProviderError};
use crate::models::{CalendarEvent, DateRange, DeleteScope, Draft};

/// A finite stream of events; every call to `list_events` starts a new one
pub type EventStream<'a> = BoxStream<'a, Result<CalendarEvent, ProviderError>>;

/// The external calendar, authoritative for scheduling facts
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Lists non-recurring events and expanded series occurrences overlapping `range`.
    /// Series masters are not part of the listing.
    fn list_events(&self, range: DateRange) -> EventStream<'_>;

    async fn get_event(&self, id: &str) -> Result<CalendarEvent, ProviderError>;

    /// Commits a draft. The provider assigns the id and, when the draft has attendees, a meeting link
    async fn create_event(&self, draft: &Draft) -> Result<CalendarEvent, ProviderError>;

    async fn update_event(&self, event: &CalendarEvent) -> Result<CalendarEvent, ProviderError>;

    async fn delete_event(&self, id: &str, scope: DeleteScope) -> Result<(), ProviderError>;

    /// Best-effort attendee suggestions
    async fn search_contacts(&self, query: &str) -> Result<Vec<String>, ProviderError>;

    /// Whether deleting an instance id removes just that occurrence
    fn supports_instance_delete(&self) -> bool {
        true
    }
}

/// Secondary persisted record of committed events, keyed by provider id
#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn upsert(&self, event: &CalendarEvent) -> Result<(), MirrorError>;

    async fn remove(&self, id: &str) -> Result<(), MirrorError>;

    /// Removes every record whose recurring event id is `master_id`
    async fn remove_by_master(&self, master_id: &str) -> Result<(), MirrorError>;

    async fn list(&self) -> Result<Vec<CalendarEvent>, MirrorError>;
}
