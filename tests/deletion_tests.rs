mod common;

use calsync::components::memory::{instance_id, InMemoryProvider};
use calsync::models::{DateRange, DeleteScope, Draft, EventDetails};
use calsync::traits::ProviderClient;
use calsync::utils::recurrence::RecurrenceRule;
use calsync::{ConsistencyError, Error, PlannedOp, ProviderError};
use chrono::{Duration, TimeZone, Utc};
use common::{day, Harness};
use futures::{StreamExt, TryStreamExt};

#[tokio::test]
async fn single_delete_removes_one_occurrence_of_an_old_series() {
    let h = Harness::new();
    let first = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let details = EventDetails::new("Standup", first, first + Duration::hours(1));
    let master = h
        .engine
        .create(&Draft::recurring(details, RecurrenceRule::daily()))
        .await
        .unwrap();

    let third = instance_id(&master.id, first + Duration::days(2));
    h.engine.delete(&third, DeleteScope::Single).await.unwrap();

    let range = DateRange::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 0).unwrap(),
    );
    h.engine.refresh(range).await.unwrap();
    let days: Vec<_> = h
        .engine
        .events(range)
        .map(|e| e.start().format("%d").to_string())
        .collect()
        .await;
    assert_eq!(days, vec!["01", "02", "04", "05"]);
}

#[tokio::test]
async fn single_delete_of_a_plain_event() {
    let h = Harness::new();
    let event = h.create_single("Dentist", 2).await;

    h.engine.delete(&event.id, DeleteScope::Single).await.unwrap();

    assert!(h.engine.get(&event.id).is_none());
    assert!(h.mirror.get(&event.id).is_none());
    assert!(h.provider.is_empty());
}

#[tokio::test]
async fn future_delete_truncates_the_series() {
    let h = Harness::new();
    let master = h.create_daily("Standup", 1, 5).await;

    let cut = instance_id(&master.id, day(3));
    h.engine.delete(&cut, DeleteScope::Future).await.unwrap();

    let remaining: Vec<_> = h.cached().await.iter().map(|e| e.start()).collect();
    assert_eq!(remaining, vec![day(1), day(2)]);

    let listed: Vec<_> = h.provider.list_events(h.window()).try_collect().await.unwrap();
    assert_eq!(listed.len(), 2);
    let upstream = h.provider.get_event(&master.id).await.unwrap();
    assert!(upstream.recurrence_rule().and_then(|r| r.until).is_some_and(|until| until < day(3)));
    assert_eq!(h.mirror.get(&master.id), Some(upstream));
}

#[tokio::test]
async fn future_delete_from_the_first_occurrence_deletes_everything() {
    let h = Harness::new();
    let master = h.create_daily("Standup", 1, 5).await;

    h.engine
        .delete(&instance_id(&master.id, day(1)), DeleteScope::Future)
        .await
        .unwrap();

    assert!(h.provider.is_empty());
    assert!(h.cached().await.is_empty());
    assert!(h.engine.get(&master.id).is_none());
    assert!(h.mirror.ids().is_empty());
}

#[tokio::test]
async fn all_delete_from_an_occurrence_removes_the_series() {
    let h = Harness::new();
    let master = h.create_daily("Standup", 1, 5).await;
    let keep = h.create_single("Lunch", 2).await;

    h.engine
        .delete(&instance_id(&master.id, day(4)), DeleteScope::All)
        .await
        .unwrap();

    let cached: Vec<_> = h.cached().await.into_iter().map(|e| e.id).collect();
    assert_eq!(cached, vec![keep.id.clone()]);
    assert_eq!(h.mirror.ids(), vec![keep.id]);
    assert!(matches!(h.provider.get_event(&master.id).await, Err(ProviderError::NotFound(_))));

    let listed: Vec<_> = h.provider.list_events(h.window()).try_collect().await.unwrap();
    assert!(listed.iter().all(|e| e.recurring_event_id() != Some(master.id.as_str())));
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn future_delete_drops_edited_later_occurrences() {
    let h = Harness::new();
    let master = h.create_daily("Standup", 1, 5).await;
    let mut fourth = h.provider.get_event(&instance_id(&master.id, day(4))).await.unwrap();
    fourth.details.title = "Edited".into();
    h.engine.update(&fourth).await.unwrap();

    h.engine
        .delete(&instance_id(&master.id, day(3)), DeleteScope::Future)
        .await
        .unwrap();

    let listed: Vec<_> = h.provider.list_events(h.window()).try_collect().await.unwrap();
    assert!(listed.iter().all(|e| e.start() < day(3) && e.title() == "Standup"));
    assert!(matches!(h.provider.get_event(&fourth.id).await, Err(ProviderError::NotFound(_))));

    h.engine.refresh(h.window()).await.unwrap();
    let cached = h.cached().await;
    assert_eq!(cached.iter().map(|e| e.start()).collect::<Vec<_>>(), vec![day(1), day(2)]);
    assert!(h.mirror.get(&fourth.id).is_none());
}

#[tokio::test]
async fn excluding_an_edited_occurrence_removes_the_edit() {
    let h = Harness::with_provider(InMemoryProvider::new().without_instance_delete());
    let master = h.create_daily("Standup", 1, 3).await;
    let mut second = h.provider.get_event(&instance_id(&master.id, day(2))).await.unwrap();
    second.details.title = "Edited".into();
    h.engine.update(&second).await.unwrap();

    h.engine.delete(&second.id, DeleteScope::Single).await.unwrap();

    let listed: Vec<_> = h.provider.list_events(h.window()).try_collect().await.unwrap();
    let starts: Vec<_> = listed.iter().map(|e| e.start()).collect();
    assert_eq!(starts, vec![day(1), day(3)]);
    assert!(listed.iter().all(|e| e.title() == "Standup"));
    assert!(matches!(h.provider.get_event(&second.id).await, Err(ProviderError::NotFound(_))));
}

#[tokio::test]
async fn truncation_mirrors_what_the_provider_committed() {
    let h = Harness::new();
    let master = h.create_daily("Standup", 1, 5).await;
    // Someone added a conference to the series; the local copy has not seen it yet
    let mut upstream = h.provider.get_event(&master.id).await.unwrap();
    upstream.meeting_link = Some("https://meet.example.com/added-elsewhere".into());
    h.provider.insert_external(upstream);

    h.engine
        .delete(&instance_id(&master.id, day(3)), DeleteScope::Future)
        .await
        .unwrap();

    let committed = h.provider.get_event(&master.id).await.unwrap();
    assert_eq!(committed.meeting_link.as_deref(), Some("https://meet.example.com/added-elsewhere"));
    assert_eq!(h.mirror.get(&master.id), Some(committed.clone()));
    assert_eq!(h.engine.get(&master.id), Some(committed));
}

#[tokio::test]
async fn single_delete_on_the_master_drops_its_first_occurrence() {
    let h = Harness::new();
    let master = h.create_daily("Standup", 1, 3).await;

    h.engine.delete(&master.id, DeleteScope::Single).await.unwrap();

    let remaining: Vec<_> = h.cached().await.iter().map(|e| e.start()).collect();
    assert_eq!(remaining, vec![day(2), day(3)]);
    let upstream = h.provider.get_event(&master.id).await.unwrap();
    assert!(upstream.recurrence_rule().unwrap().exdates.contains(&day(1)));
}

#[tokio::test]
async fn single_delete_without_native_support_excludes_the_date() {
    let h = Harness::with_provider(InMemoryProvider::new().without_instance_delete());
    let master = h.create_daily("Standup", 1, 3).await;
    let second = instance_id(&master.id, day(2));

    h.engine.delete(&second, DeleteScope::Single).await.unwrap();

    assert!(h.engine.get(&second).is_none());
    let listed: Vec<_> = h.provider.list_events(h.window()).try_collect().await.unwrap();
    assert_eq!(listed.iter().map(|e| e.start()).collect::<Vec<_>>(), vec![day(1), day(3)]);
    let mirrored = h.mirror.get(&master.id).unwrap();
    assert!(mirrored.recurrence_rule().unwrap().exdates.contains(&day(2)));
}

#[tokio::test]
async fn failure_after_the_provider_step_reports_partial_progress() {
    let h = Harness::new();
    let master = h.create_daily("Standup", 1, 3).await;
    h.mirror_behaviour().lock().remove_by_master_behaviour = (0, 1);

    let result = h.engine.delete(&master.id, DeleteScope::All).await;

    let (completed, pending) = match result {
        Err(Error::Consistency(ConsistencyError::PartialDeleteFailure { completed, pending, .. })) => {
            (completed, pending)
        }
        other => panic!("expected a partial failure, got {:?}", other),
    };
    assert_eq!(
        completed,
        vec![PlannedOp::ProviderDelete { id: master.id.clone(), scope: DeleteScope::All }]
    );
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0], PlannedOp::MirrorRemoveByMaster { master_id: master.id.clone() });
    assert!(h.provider.is_empty());
    assert!(h.cached().await.is_empty());
}

#[tokio::test]
async fn failing_first_step_returns_the_provider_error() {
    let h = Harness::new();
    let event = h.create_single("Dentist", 2).await;
    {
        let behaviour = h.provider_behaviour();
        let mut behaviour = behaviour.lock();
        behaviour.delete_behaviour = (0, 1);
        behaviour.provider_error = Some(ProviderError::AuthExpired("token revoked".into()));
    }

    let result = h.engine.delete(&event.id, DeleteScope::Single).await;

    assert!(matches!(result, Err(Error::Provider(ProviderError::AuthExpired(_)))));
    assert_eq!(h.engine.get(&event.id), Some(event.clone()));
    assert!(h.mirror.get(&event.id).is_some());
}

#[tokio::test]
async fn deleting_an_unknown_event_is_not_found() {
    let h = Harness::new();

    let result = h.engine.delete("missing", DeleteScope::Single).await;

    assert!(matches!(result, Err(Error::Provider(ProviderError::NotFound(_)))));
}
