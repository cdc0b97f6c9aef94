//! Shared setup for the engine, deletion and polling tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration as StdDuration;

use calsync::components::memory::{InMemoryMirror, InMemoryProvider, MockBehaviour};
use calsync::models::{CalendarEvent, DateRange, Draft, EventDetails};
use calsync::utils::recurrence::RecurrenceRule;
use calsync::utils::time::SyncWindow;
use calsync::{AttendeeHistory, ReconciliationEngine};
use chrono::{DateTime, Duration, DurationRound, Utc};
use futures::StreamExt;
use parking_lot::Mutex;

pub struct Harness {
    pub provider: Arc<InMemoryProvider>,
    pub mirror: Arc<InMemoryMirror>,
    pub history: Arc<AttendeeHistory>,
    pub engine: ReconciliationEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_provider(InMemoryProvider::new())
    }

    pub fn with_provider(provider: InMemoryProvider) -> Self {
        let provider = Arc::new(provider);
        let mirror = Arc::new(InMemoryMirror::new());
        let history = Arc::new(AttendeeHistory::in_memory());
        let engine = ReconciliationEngine::new(
            provider.clone(),
            mirror.clone(),
            SyncWindow::default(),
            Some(Arc::clone(&history)),
        );
        Self { provider, mirror, history, engine }
    }

    pub fn provider_behaviour(&self) -> Arc<Mutex<MockBehaviour>> {
        self.provider.behaviour()
    }

    pub fn mirror_behaviour(&self) -> Arc<Mutex<MockBehaviour>> {
        self.mirror.behaviour()
    }

    pub fn window(&self) -> DateRange {
        self.engine.window().current()
    }

    /// Cached events in the sync window, in listing order
    pub async fn cached(&self) -> Vec<CalendarEvent> {
        self.engine.events(self.window()).collect().await
    }

    pub async fn create_single(&self, title: &str, day: i64) -> CalendarEvent {
        self.engine
            .create(&Draft::new(details(title, day)))
            .await
            .expect("create single event")
    }

    /// A daily series of `count` occurrences starting on day `first_day`
    pub async fn create_daily(&self, title: &str, first_day: i64, count: u32) -> CalendarEvent {
        let draft = Draft::recurring(details(title, first_day), RecurrenceRule::daily().with_count(count));
        self.engine.create(&draft).await.expect("create series")
    }
}

/// 09:00 UTC, `n` days from today
pub fn day(n: i64) -> DateTime<Utc> {
    let today = Utc::now()
        .duration_trunc(Duration::days(1))
        .expect("truncate to day");
    today + Duration::days(n) + Duration::hours(9)
}

pub fn details(title: &str, day_offset: i64) -> EventDetails {
    let start = day(day_offset);
    EventDetails::new(title, start, start + Duration::hours(1))
}

/// Poll `check` until it holds, failing the test after a second
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
