mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use calsync::components::calendar_sync::PollOutcome;
use calsync::models::{CalendarEvent, DeleteScope, EventDetails};
use calsync::traits::ProviderClient;
use calsync::{Error, PollingScheduler, ProviderError};
use chrono::Duration;
use common::{day, Harness};
use tokio::sync::mpsc;

fn scheduler(h: &Harness, every: StdDuration) -> Arc<PollingScheduler> {
    Arc::new(PollingScheduler::new(&h.engine, every))
}

#[tokio::test]
async fn poll_picks_up_events_created_elsewhere() {
    let h = Harness::new();
    let poller = scheduler(&h, StdDuration::from_secs(30));
    h.provider.insert_external(CalendarEvent {
        id: "external".into(),
        details: EventDetails::new("Booked by a colleague", day(2), day(2) + Duration::hours(1)),
        recurrence: None,
        meeting_link: None,
    });

    let outcome = poller.poll_once().await.unwrap();

    let PollOutcome::Refreshed(stats) = outcome else {
        panic!("poll was skipped");
    };
    assert_eq!(stats.upserted, 1);
    assert!(h.engine.get("external").is_some());
}

#[tokio::test]
async fn poll_drops_events_deleted_elsewhere() {
    let h = Harness::new();
    let poller = scheduler(&h, StdDuration::from_secs(30));
    let event = h.create_single("Retro", 3).await;

    h.provider.delete_event(&event.id, DeleteScope::Single).await.unwrap();
    poller.poll_once().await.unwrap();

    assert!(h.engine.get(&event.id).is_none());
}

#[tokio::test]
async fn stale_poll_does_not_overwrite_a_newer_write() {
    let h = Harness::new();
    let poller = scheduler(&h, StdDuration::from_secs(30));
    let mut event = h.create_single("Draft title", 2).await;

    let gate = h.provider.hold_next_listing();
    let poll = tokio::spawn({
        let poller = Arc::clone(&poller);
        async move { poller.poll_once().await }
    });
    gate.wait_started().await;

    event.details.title = "Final title".into();
    h.engine.update(&event).await.unwrap();
    gate.release();

    let outcome = poll.await.unwrap().unwrap();
    let PollOutcome::Refreshed(stats) = outcome else {
        panic!("poll was skipped");
    };
    assert_eq!(stats.rejected, 1);
    assert_eq!(h.engine.get(&event.id).unwrap().title(), "Final title");
}

#[tokio::test]
async fn poll_is_skipped_while_a_write_is_in_flight() {
    let h = Harness::new();
    let poller = scheduler(&h, StdDuration::from_secs(30));

    let guard = h.engine.writes().begin("busy", h.window()).await;
    assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::Skipped);

    drop(guard);
    assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::Refreshed(_)));
}

#[tokio::test]
async fn start_and_stop_guard_against_misuse() {
    let h = Harness::new();
    let poller = scheduler(&h, StdDuration::from_secs(30));

    assert!(matches!(poller.stop().await, Err(Error::SchedulerNotRunning)));
    poller.start(|_| {}).unwrap();
    assert!(poller.is_running());
    assert!(matches!(poller.start(|_| {}), Err(Error::SchedulerAlreadyRunning)));

    poller.stop().await.unwrap();
    assert!(!poller.is_running());
    poller.start(|_| {}).unwrap();
    poller.stop().await.unwrap();
}

#[tokio::test]
async fn poll_errors_reach_the_callback_without_stopping_the_loop() {
    let h = Harness::new();
    {
        let behaviour = h.provider_behaviour();
        let mut behaviour = behaviour.lock();
        behaviour.list_behaviour = (0, 1);
        behaviour.provider_error = Some(ProviderError::AuthExpired("signed out".into()));
    }
    h.provider.insert_external(CalendarEvent {
        id: "later".into(),
        details: EventDetails::new("Shows up on retry", day(1), day(1) + Duration::hours(1)),
        recurrence: None,
        meeting_link: None,
    });
    let poller = scheduler(&h, StdDuration::from_millis(20));

    let (tx, mut rx) = mpsc::unbounded_channel();
    poller
        .start(move |err: &ProviderError| {
            let _ = tx.send(err.clone());
        })
        .unwrap();

    let err = tokio::time::timeout(StdDuration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, ProviderError::AuthExpired(_)));

    common::eventually(|| h.engine.get("later").is_some()).await;
    assert!(poller.is_running());
    poller.stop().await.unwrap();
}
