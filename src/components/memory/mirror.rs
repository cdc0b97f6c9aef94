use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::mock_behaviour::MockBehaviour;
use crate::error::MirrorError;
use crate::models::{CalendarEvent, EventId};
use crate::traits::MirrorStore;

/// Mirror records kept in process memory
pub struct InMemoryMirror {
    records: Mutex<BTreeMap<EventId, CalendarEvent>>,
    behaviour: Arc<Mutex<MockBehaviour>>,
}

impl Default for InMemoryMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMirror {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            behaviour: Arc::new(Mutex::new(MockBehaviour::new())),
        }
    }

    pub fn with_behaviour(mut self, behaviour: Arc<Mutex<MockBehaviour>>) -> Self {
        self.behaviour = behaviour;
        self
    }

    pub fn behaviour(&self) -> Arc<Mutex<MockBehaviour>> {
        Arc::clone(&self.behaviour)
    }

    pub fn get(&self, id: &str) -> Option<CalendarEvent> {
        self.records.lock().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<EventId> {
        self.records.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl MirrorStore for InMemoryMirror {
    async fn upsert(&self, event: &CalendarEvent) -> Result<(), MirrorError> {
        self.behaviour.lock().can_upsert()?;
        self.records.lock().insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), MirrorError> {
        self.behaviour.lock().can_remove()?;
        self.records
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| MirrorError::NotFound(id.to_string()))
    }

    async fn remove_by_master(&self, master_id: &str) -> Result<(), MirrorError> {
        self.behaviour.lock().can_remove_by_master()?;
        self.records
            .lock()
            .retain(|_, e| e.recurring_event_id() != Some(master_id));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CalendarEvent>, MirrorError> {
        self.behaviour.lock().can_list_mirror()?;
        Ok(self.records.lock().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventDetails, Recurrence};
    use chrono::{TimeZone, Utc};

    fn record(id: &str, master: Option<&str>) -> CalendarEvent {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        CalendarEvent {
            id: id.to_string(),
            details: EventDetails::new("x", start, start),
            recurrence: master.map(|m| Recurrence::Instance {
                master_id: m.to_string(),
                original_start: start,
            }),
            meeting_link: None,
        }
    }

    #[tokio::test]
    async fn remove_by_master_only_touches_the_series() {
        let mirror = InMemoryMirror::new();
        mirror.upsert(&record("a_1", Some("a"))).await.unwrap();
        mirror.upsert(&record("a_2", Some("a"))).await.unwrap();
        mirror.upsert(&record("b", None)).await.unwrap();

        mirror.remove_by_master("a").await.unwrap();

        assert_eq!(mirror.ids(), vec!["b".to_string()]);
        assert_eq!(mirror.remove("a_1").await, Err(MirrorError::NotFound("a_1".into())));
    }
}
