//! A provider that keeps its calendar in memory.
//!
//! Used for offline runs and as the provider in tests. Series are expanded
//! the same way Google does with `singleEvents=true`: listings contain
//! non-recurring events and occurrences, never masters.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use super::mock_behaviour::MockBehaviour;
use crate::error::ProviderError;
use crate::models::{CalendarEvent, DateRange, DeleteScope, Draft, EventId, Recurrence};
use crate::traits::{EventStream, ProviderClient};

const INSTANCE_ID_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Id of the occurrence of `master_id` originally starting at `original_start`
pub fn instance_id(master_id: &str, original_start: DateTime<Utc>) -> EventId {
    format!("{}_{}", master_id, original_start.format(INSTANCE_ID_FORMAT))
}

/// Holds the next gated call until the test releases it
#[derive(Default)]
pub struct CallGate {
    started: Notify,
    release: Notify,
}

impl CallGate {
    /// Resolves once the gated call has started and is waiting
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
struct CalendarState {
    /// Non-recurring events and series masters
    events: BTreeMap<EventId, CalendarEvent>,
    /// Occurrences that were edited individually
    overrides: BTreeMap<EventId, CalendarEvent>,
}

impl CalendarState {
    /// Master and original start of an occurrence id, if the master's rule still produces it
    fn resolve_instance(&self, id: &str) -> Option<(&CalendarEvent, DateTime<Utc>)> {
        let (master_id, original_start) = match self.overrides.get(id).and_then(|e| e.recurrence.as_ref()) {
            Some(Recurrence::Instance { master_id, original_start }) => (master_id.as_str(), *original_start),
            _ => {
                let (master_id, stamp) = id.rsplit_once('_')?;
                let original_start = NaiveDateTime::parse_from_str(stamp, INSTANCE_ID_FORMAT)
                    .ok()?
                    .and_utc();
                (master_id, original_start)
            }
        };
        let master = self.events.get(master_id)?;
        let rule = master.recurrence_rule()?;
        rule.has_occurrence(master.start(), original_start)
            .then_some((master, original_start))
    }

    /// Forget edits of occurrences the master's rule no longer produces
    fn prune_overrides(&mut self, master_id: &str) {
        let stale: Vec<EventId> = self
            .overrides
            .iter()
            .filter(|(id, e)| e.recurring_event_id() == Some(master_id) && self.resolve_instance(id).is_none())
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            debug!("Dropping edited occurrence {} outside its series", id);
            self.overrides.remove(&id);
        }
    }

    fn generated_instance(master: &CalendarEvent, original_start: DateTime<Utc>) -> CalendarEvent {
        let mut details = master.details.clone();
        details.start = original_start;
        details.end = original_start + master.details.duration();
        CalendarEvent {
            id: instance_id(&master.id, original_start),
            details,
            recurrence: Some(Recurrence::Instance {
                master_id: master.id.clone(),
                original_start,
            }),
            meeting_link: master.meeting_link.clone(),
        }
    }

    fn instance(&self, id: &str) -> Option<CalendarEvent> {
        let (master, original_start) = self.resolve_instance(id)?;
        match self.overrides.get(id) {
            Some(edited) => Some(edited.clone()),
            None => Some(Self::generated_instance(master, original_start)),
        }
    }

    fn listing(&self, range: &DateRange) -> Vec<CalendarEvent> {
        let mut listed = Vec::new();
        let mut seen = BTreeSet::new();

        for event in self.events.values() {
            let Some(rule) = event.recurrence_rule() else {
                if event.overlaps(range) {
                    listed.push(event.clone());
                }
                continue;
            };

            for start in rule.occurrences(event.start(), event.details.duration(), range) {
                let id = instance_id(&event.id, start);
                let occurrence = match self.overrides.get(&id) {
                    Some(edited) => edited.clone(),
                    None => Self::generated_instance(event, start),
                };
                if occurrence.overlaps(range) {
                    seen.insert(id);
                    listed.push(occurrence);
                }
            }
        }

        // Edited occurrences moved into the range from outside it
        for (id, edited) in &self.overrides {
            if !seen.contains(id) && edited.overlaps(range) && self.resolve_instance(id).is_some() {
                listed.push(edited.clone());
            }
        }

        listed.sort_by(|a, b| a.start().cmp(&b.start()).then_with(|| a.id.cmp(&b.id)));
        listed
    }
}

/// In-memory calendar provider with failure injection
pub struct InMemoryProvider {
    state: Mutex<CalendarState>,
    behaviour: Arc<Mutex<MockBehaviour>>,
    contacts: Mutex<Vec<String>>,
    listing_gate: Mutex<Option<Arc<CallGate>>>,
    update_gate: Mutex<Option<Arc<CallGate>>>,
    update_calls: AtomicUsize,
    native_instance_delete: bool,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CalendarState::default()),
            behaviour: Arc::new(Mutex::new(MockBehaviour::new())),
            contacts: Mutex::new(Vec::new()),
            listing_gate: Mutex::new(None),
            update_gate: Mutex::new(None),
            update_calls: AtomicUsize::new(0),
            native_instance_delete: true,
        }
    }

    /// Share a behaviour the caller can tweak while the provider is in use
    pub fn with_behaviour(mut self, behaviour: Arc<Mutex<MockBehaviour>>) -> Self {
        self.behaviour = behaviour;
        self
    }

    /// Pretend occurrences cannot be deleted by id
    pub fn without_instance_delete(mut self) -> Self {
        self.native_instance_delete = false;
        self
    }

    pub fn with_contacts<I, S>(self, contacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.contacts.lock() = contacts.into_iter().map(Into::into).collect();
        self
    }

    pub fn behaviour(&self) -> Arc<Mutex<MockBehaviour>> {
        Arc::clone(&self.behaviour)
    }

    /// The next listing reads the calendar, then waits for [`CallGate::release`]
    pub fn hold_next_listing(&self) -> Arc<CallGate> {
        let gate = Arc::new(CallGate::default());
        *self.listing_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// The next update waits for [`CallGate::release`] before it is applied
    pub fn hold_next_update(&self) -> Arc<CallGate> {
        let gate = Arc::new(CallGate::default());
        *self.update_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Number of `update_event` calls received so far
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Insert an event as if someone else had created it at the provider
    pub fn insert_external(&self, event: CalendarEvent) {
        self.state.lock().events.insert(event.id.clone(), event);
    }

    /// Number of masters and non-recurring events held
    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn assign_meeting_link(event: &mut CalendarEvent, previous: Option<&CalendarEvent>) {
        event.meeting_link = previous.and_then(|p| p.meeting_link.clone());
        if event.meeting_link.is_none() && !event.details.attendees.is_empty() {
            event.meeting_link = Some(format!("https://meet.example.com/{}", event.id));
        }
    }
}

#[async_trait]
impl ProviderClient for InMemoryProvider {
    fn list_events(&self, range: DateRange) -> EventStream<'_> {
        if let Err(err) = self.behaviour.lock().can_list() {
            return stream::once(async move { Err(err) }).boxed();
        }

        let events = self.state.lock().listing(&range);
        let gate = self.listing_gate.lock().take();
        debug!("Listing {} events for {}", events.len(), range);

        stream::once(async move {
            if let Some(gate) = gate {
                gate.started.notify_one();
                gate.release.notified().await;
            }
            stream::iter(events.into_iter().map(Ok::<_, ProviderError>))
        })
        .flatten()
        .boxed()
    }

    async fn get_event(&self, id: &str) -> Result<CalendarEvent, ProviderError> {
        self.behaviour.lock().can_get()?;
        let state = self.state.lock();
        state
            .events
            .get(id)
            .cloned()
            .or_else(|| state.instance(id))
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    async fn create_event(&self, draft: &Draft) -> Result<CalendarEvent, ProviderError> {
        self.behaviour.lock().can_create()?;
        draft
            .validate()
            .map_err(|e| ProviderError::Validation(e.to_string()))?;

        let mut event = CalendarEvent {
            id: Uuid::new_v4().simple().to_string(),
            details: draft.details.clone(),
            recurrence: draft.recurrence_rule.clone().map(Recurrence::Master),
            meeting_link: None,
        };
        Self::assign_meeting_link(&mut event, None);

        debug!("Created event {}", event.id);
        self.state.lock().events.insert(event.id.clone(), event.clone());
        Ok(event)
    }

    async fn update_event(&self, event: &CalendarEvent) -> Result<CalendarEvent, ProviderError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.update_gate.lock().take();
        if let Some(gate) = gate {
            gate.started.notify_one();
            gate.release.notified().await;
        }

        self.behaviour.lock().can_update()?;
        event
            .validate()
            .map_err(|e| ProviderError::Validation(e.to_string()))?;

        let mut state = self.state.lock();
        if let Some(previous) = state.events.get(&event.id) {
            let mut updated = event.clone();
            if previous.is_master() != updated.is_master() {
                return Err(ProviderError::Validation(format!(
                    "event {} cannot change between series and single event",
                    event.id
                )));
            }
            Self::assign_meeting_link(&mut updated, Some(previous));
            state.events.insert(updated.id.clone(), updated.clone());
            if updated.is_master() {
                state.prune_overrides(&updated.id);
            }
            return Ok(updated);
        }

        let previous = state
            .instance(&event.id)
            .ok_or_else(|| ProviderError::NotFound(event.id.clone()))?;
        let mut updated = event.clone();
        updated.recurrence = previous.recurrence.clone();
        Self::assign_meeting_link(&mut updated, Some(&previous));
        state.overrides.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete_event(&self, id: &str, scope: DeleteScope) -> Result<(), ProviderError> {
        self.behaviour.lock().can_delete()?;
        let mut state = self.state.lock();
        debug!("Deleting event {} ({})", id, scope);

        if let Some(removed) = state.events.remove(id) {
            if removed.is_master() {
                state
                    .overrides
                    .retain(|_, e| e.recurring_event_id() != Some(removed.id.as_str()));
            }
            return Ok(());
        }

        if !self.native_instance_delete {
            return Err(ProviderError::Validation(format!(
                "occurrence {} cannot be deleted on its own",
                id
            )));
        }

        let (master_id, original_start) = state
            .resolve_instance(id)
            .map(|(master, at)| (master.id.clone(), at))
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        state.overrides.remove(id);
        if let Some(master) = state.events.get_mut(&master_id) {
            if let Some(Recurrence::Master(rule)) = &master.recurrence {
                master.recurrence = Some(Recurrence::Master(rule.excluding(original_start)));
            }
        }
        Ok(())
    }

    async fn search_contacts(&self, query: &str) -> Result<Vec<String>, ProviderError> {
        self.behaviour.lock().can_search_contacts()?;
        let query = query.trim().to_lowercase();
        Ok(self
            .contacts
            .lock()
            .iter()
            .filter(|c| c.to_lowercase().contains(&query))
            .cloned()
            .collect())
    }

    fn supports_instance_delete(&self) -> bool {
        self.native_instance_delete
    }
}
