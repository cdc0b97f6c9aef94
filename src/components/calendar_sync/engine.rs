//! Keeps provider, mirror and cache in agreement across writes.
//!
//! The provider is committed first and is authoritative. Every operation
//! runs on its own task, so once the provider commit has started the mirror
//! write and any compensation happen even if the caller goes away.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::contacts::{remember_attendees, AttendeeHistory};
use super::event_store::{EventStore, ReconcileStats};
use super::planner::{plan, PlannedOp, SeriesContext};
use super::refresh::refresh_range;
use super::write_tracker::WriteTracker;
use crate::error::{ConsistencyError, Error, MirrorError, ProviderError, SyncResult};
use crate::models::{CalendarEvent, DateRange, DeleteScope, Draft, EventId};
use crate::traits::{MirrorStore, ProviderClient};
use crate::utils::time::SyncWindow;

struct EngineInner {
    provider: Arc<dyn ProviderClient>,
    mirror: Arc<dyn MirrorStore>,
    store: Arc<EventStore>,
    writes: Arc<WriteTracker>,
    history: Option<Arc<AttendeeHistory>>,
    orphans: Mutex<BTreeSet<EventId>>,
    window: SyncWindow,
}

/// Entry point for every calendar mutation
#[derive(Clone)]
pub struct ReconciliationEngine {
    inner: Arc<EngineInner>,
}

impl ReconciliationEngine {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        mirror: Arc<dyn MirrorStore>,
        window: SyncWindow,
        history: Option<Arc<AttendeeHistory>>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                provider,
                mirror,
                store: Arc::new(EventStore::new()),
                writes: Arc::new(WriteTracker::new()),
                history,
                orphans: Mutex::new(BTreeSet::new()),
                window,
            }),
        }
    }

    async fn detached<T, F>(what: &'static str, work: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: Future<Output = SyncResult<T>> + Send + 'static,
    {
        tokio::spawn(work)
            .await
            .map_err(|e| Error::Other(format!("{} task failed: {}", what, e)))?
    }

    /// Commit a new event and return it with its provider-assigned id
    pub async fn create(&self, draft: &Draft) -> SyncResult<CalendarEvent> {
        draft.validate()?;
        let inner = Arc::clone(&self.inner);
        let draft = draft.clone();
        Self::detached("create", async move { inner.create(draft).await }).await
    }

    pub async fn update(&self, event: &CalendarEvent) -> SyncResult<CalendarEvent> {
        event.validate()?;
        let inner = Arc::clone(&self.inner);
        let event = event.clone();
        Self::detached("update", async move { inner.update(event).await }).await
    }

    pub async fn delete(&self, id: &str, scope: DeleteScope) -> SyncResult<()> {
        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        Self::detached("delete", async move { inner.delete(id, scope).await }).await
    }

    pub fn get(&self, id: &str) -> Option<CalendarEvent> {
        self.inner.store.get(id)
    }

    /// Cached events overlapping `range`, read when the stream is first polled
    pub fn events(&self, range: DateRange) -> BoxStream<'static, CalendarEvent> {
        let store = Arc::clone(&self.inner.store);
        stream::once(async move { stream::iter(store.events(&range)) })
            .flatten()
            .boxed()
    }

    /// Events committed at the provider that could neither be mirrored nor rolled back
    pub fn orphans(&self) -> Vec<EventId> {
        self.inner.orphans.lock().iter().cloned().collect()
    }

    /// Forget an orphan once it has been reconciled by hand
    pub fn clear_orphan(&self, id: &str) -> bool {
        self.inner.orphans.lock().remove(id)
    }

    pub async fn refresh(&self, range: DateRange) -> SyncResult<ReconcileStats> {
        Ok(refresh_range(&*self.inner.provider, &self.inner.store, range).await?)
    }

    pub fn store(&self) -> Arc<EventStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn writes(&self) -> Arc<WriteTracker> {
        Arc::clone(&self.inner.writes)
    }

    pub fn provider(&self) -> Arc<dyn ProviderClient> {
        Arc::clone(&self.inner.provider)
    }

    pub fn window(&self) -> SyncWindow {
        self.inner.window
    }
}

impl EngineInner {
    async fn create(&self, draft: Draft) -> SyncResult<CalendarEvent> {
        let range = draft.affected_range();
        let _write = self.writes.begin(&format!("draft:{}", Uuid::new_v4()), range).await;

        let created = self.provider.create_event(&draft).await?;
        info!("Created event {} at provider", created.id);

        if let Err(mirror_err) = self.mirror.upsert(&created).await {
            warn!("Mirror write failed for new event {}: {}", created.id, mirror_err);
            return Err(self.compensate_create(&created, mirror_err).await);
        }

        self.store.write_local(created.clone());
        if created.is_master() {
            self.pull_series(&created).await;
        }
        remember_attendees(self.history.as_deref(), &created.details.attendees);
        Ok(created)
    }

    /// Undo a provider create whose mirror write failed
    async fn compensate_create(&self, created: &CalendarEvent, mirror_err: MirrorError) -> Error {
        match self.provider.delete_event(&created.id, DeleteScope::All).await {
            Ok(()) | Err(ProviderError::NotFound(_)) => {
                info!("Rolled back provider create of {}", created.id);
                mirror_err.into()
            }
            Err(e) => {
                error!("Compensating delete of {} failed, flagging as orphan: {}", created.id, e);
                self.orphans.lock().insert(created.id.clone());
                self.force_refresh(created.affected_range()).await;
                ConsistencyError::MirrorOrphan { id: created.id.clone() }.into()
            }
        }
    }

    /// Cache the occurrences of a new series that fall into the sync window
    async fn pull_series(&self, master: &CalendarEvent) {
        let Some(range) = master.affected_range().intersection(&self.window.current()) else {
            return;
        };
        let listing: Result<Vec<CalendarEvent>, _> = self.provider.list_events(range).try_collect().await;
        match listing {
            Ok(events) => {
                let mut pulled = 0;
                for event in events.into_iter().filter(|e| e.recurring_event_id() == Some(master.id.as_str())) {
                    self.store.write_local(event);
                    pulled += 1;
                }
                debug!("Pulled {} occurrences of new series {}", pulled, master.id);
            }
            Err(e) => warn!("Could not list occurrences of new series {}: {}", master.id, e),
        }
    }

    async fn update(&self, event: CalendarEvent) -> SyncResult<CalendarEvent> {
        let range = match self.store.get(&event.id) {
            Some(cached) => cached.affected_range().union(&event.affected_range()),
            None => event.affected_range(),
        };
        let _write = self.writes.begin(event.series_key(), range).await;

        let previous = match self.store.get(&event.id) {
            Some(cached) => Some(cached),
            None => self.provider.get_event(&event.id).await.ok(),
        };
        self.store.write_local(event.clone());

        let committed = match self.provider.update_event(&event).await {
            Ok(committed) => committed,
            Err(err) => {
                warn!("Provider rejected update of {}: {}", event.id, err);
                self.refetch(&event.id, previous).await;
                return Err(err.into());
            }
        };

        if let Err(mirror_err) = self.mirror.upsert(&committed).await {
            warn!("Mirror write failed for update of {}: {}", committed.id, mirror_err);
            return Err(self.roll_back_update(committed, previous, mirror_err, range).await);
        }

        self.store.write_local(committed.clone());
        if committed.is_master() {
            // The rule may have changed, so cached occurrences are suspect
            self.force_refresh(range).await;
        }
        remember_attendees(self.history.as_deref(), &committed.details.attendees);
        Ok(committed)
    }

    /// Replace a failed speculative write with what the provider really has
    async fn refetch(&self, id: &str, previous: Option<CalendarEvent>) {
        match self.provider.get_event(id).await {
            Ok(current) => {
                self.store.write_local(current);
            }
            Err(ProviderError::NotFound(_)) => {
                self.store.remove_local(id);
            }
            Err(e) => {
                warn!("Re-fetch of {} failed, restoring cached value: {}", id, e);
                match previous {
                    Some(previous) => self.store.write_local(previous),
                    None => self.store.remove_local(id),
                };
            }
        }
    }

    async fn roll_back_update(
        &self,
        committed: CalendarEvent,
        previous: Option<CalendarEvent>,
        mirror_err: MirrorError,
        range: DateRange,
    ) -> Error {
        if let Some(previous) = previous {
            match self.provider.update_event(&previous).await {
                Ok(restored) => {
                    info!("Rolled back provider update of {}", restored.id);
                    self.store.write_local(restored);
                    return mirror_err.into();
                }
                Err(e) => warn!("Rollback of {} failed: {}", committed.id, e),
            }
        }

        let id = committed.id.clone();
        self.store.write_local(committed);
        self.force_refresh(range).await;
        ConsistencyError::StaleWrite { id }.into()
    }

    async fn delete(&self, id: String, scope: DeleteScope) -> SyncResult<()> {
        let target = self.lookup(&id).await?;
        let range = target.affected_range();
        let _write = self.writes.begin(target.series_key(), range).await;
        let target = self.store.get(&id).unwrap_or(target);

        let ctx = self.series_context(&target).await;
        let ops = plan(&target, scope, &ctx)?;
        debug!("Deleting {} ({}) in {} steps", id, scope, ops.len());
        self.execute(ops, range).await
    }

    async fn lookup(&self, id: &str) -> SyncResult<CalendarEvent> {
        match self.store.get(id) {
            Some(event) => Ok(event),
            None => Ok(self.provider.get_event(id).await?),
        }
    }

    async fn series_context(&self, target: &CalendarEvent) -> SeriesContext {
        let native_instance_delete = self.provider.supports_instance_delete();
        let master_id = match (target.is_master(), target.recurring_event_id()) {
            (true, _) => target.id.clone(),
            (false, Some(master_id)) => master_id.to_string(),
            (false, None) => {
                return SeriesContext { native_instance_delete, ..SeriesContext::default() };
            }
        };

        let master = if target.is_master() {
            Some(target.clone())
        } else {
            match self.store.get(&master_id) {
                Some(master) => Some(master),
                None => self.provider.get_event(&master_id).await.ok(),
            }
        };

        let mut instances: BTreeMap<EventId, CalendarEvent> = self
            .store
            .series(&master_id)
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        match self.mirror.list().await {
            Ok(records) => {
                for record in records.into_iter().filter(|e| e.recurring_event_id() == Some(master_id.as_str())) {
                    instances.entry(record.id.clone()).or_insert(record);
                }
            }
            Err(e) => warn!("Mirror listing failed, planning from cache only: {}", e),
        }

        SeriesContext {
            master: master.filter(CalendarEvent::is_master),
            instances: instances.into_values().collect(),
            native_instance_delete,
        }
    }

    /// Run planned operations in order, stopping at the first failure.
    /// A mirror upsert right after a provider update stores what the provider committed.
    async fn execute(&self, mut ops: Vec<PlannedOp>, range: DateRange) -> SyncResult<()> {
        for done in 0..ops.len() {
            let err = match self.apply(&ops[done]).await {
                Ok(Some(committed)) => {
                    if let Some(PlannedOp::MirrorUpsert { event }) = ops.get_mut(done + 1) {
                        if event.id == committed.id {
                            *event = committed;
                        }
                    }
                    continue;
                }
                Ok(None) => continue,
                Err(err) => err,
            };
            if done == 0 {
                return Err(err);
            }

            error!("Delete stopped after {} of {} steps: {}", done, ops.len(), err);
            let pending = ops.split_off(done);
            self.force_refresh(range).await;
            return Err(ConsistencyError::PartialDeleteFailure {
                completed: ops,
                pending,
                reason: err.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Apply one step, returning the event the provider committed for updates
    async fn apply(&self, op: &PlannedOp) -> SyncResult<Option<CalendarEvent>> {
        match op {
            PlannedOp::ProviderDelete { id, scope } => {
                self.provider.delete_event(id, *scope).await?;
                self.store.remove_local(id);
                if *scope == DeleteScope::All {
                    self.forget_series(id);
                }
            }
            PlannedOp::ProviderUpdate { event } => {
                let committed = self.provider.update_event(event).await?;
                self.store.write_local(committed.clone());
                return Ok(Some(committed));
            }
            PlannedOp::MirrorUpsert { event } => self.mirror.upsert(event).await?,
            PlannedOp::MirrorRemove { id } => match self.mirror.remove(id).await {
                Ok(()) | Err(MirrorError::NotFound(_)) => {
                    self.store.remove_local(id);
                }
                Err(e) => return Err(e.into()),
            },
            PlannedOp::MirrorRemoveByMaster { master_id } => {
                self.mirror.remove_by_master(master_id).await?;
                self.forget_series(master_id);
            }
        }
        Ok(None)
    }

    fn forget_series(&self, master_id: &str) {
        for event in self.store.series(master_id) {
            self.store.remove_local(&event.id);
        }
    }

    /// Re-read the part of `range` inside the sync window, logging failures
    async fn force_refresh(&self, range: DateRange) {
        let Some(range) = range.intersection(&self.window.current()) else {
            return;
        };
        info!("Forcing refresh of {}", range);
        if let Err(e) = refresh_range(&*self.provider, &self.store, range).await {
            warn!("Forced refresh of {} failed: {}", range, e);
        }
    }
}
