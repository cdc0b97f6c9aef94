//! Turns a delete request on a possibly recurring event into ordered store operations.
//!
//! Planning is pure: it only looks at the target, the requested scope and
//! what is known about the series. Provider operations always come before
//! mirror operations so that a failure never leaves a mirror record missing
//! for an event the provider still has.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::error::{validation_error, SyncResult};
use crate::models::{CalendarEvent, DeleteScope, EventId, Recurrence};

#[derive(Debug, Clone, PartialEq)]
pub enum PlannedOp {
    ProviderDelete { id: EventId, scope: DeleteScope },
    ProviderUpdate { event: CalendarEvent },
    MirrorUpsert { event: CalendarEvent },
    MirrorRemove { id: EventId },
    MirrorRemoveByMaster { master_id: EventId },
}

impl PlannedOp {
    pub fn is_provider_op(&self) -> bool {
        matches!(self, PlannedOp::ProviderDelete { .. } | PlannedOp::ProviderUpdate { .. })
    }
}

/// What is known about the series a delete target belongs to
#[derive(Debug, Clone, Default)]
pub struct SeriesContext {
    /// The master of the target's series (the target itself for masters)
    pub master: Option<CalendarEvent>,
    /// Known occurrences of the series, from the cache and the mirror
    pub instances: Vec<CalendarEvent>,
    /// Whether the provider can delete a single occurrence by id
    pub native_instance_delete: bool,
}

/// Plan the operations deleting `target` with `scope`
pub fn plan(target: &CalendarEvent, scope: DeleteScope, ctx: &SeriesContext) -> SyncResult<Vec<PlannedOp>> {
    match (&target.recurrence, scope) {
        (None, _) => Ok(delete_single_event(&target.id)),
        (Some(Recurrence::Instance { .. }), DeleteScope::Single) => plan_instance_single(target, ctx),
        (Some(Recurrence::Instance { original_start, .. }), DeleteScope::Future) => {
            plan_future(series_master(target, ctx)?, *original_start, ctx)
        }
        (Some(Recurrence::Master(_)), DeleteScope::Single) => plan_master_single(target, ctx),
        // Cutting a series before its first occurrence deletes all of it
        (Some(Recurrence::Master(_)), DeleteScope::Future) | (_, DeleteScope::All) => {
            let master_id = target.recurring_event_id().unwrap_or(&target.id);
            Ok(delete_series(master_id))
        }
    }
}

fn delete_single_event(id: &str) -> Vec<PlannedOp> {
    vec![
        PlannedOp::ProviderDelete { id: id.to_string(), scope: DeleteScope::Single },
        PlannedOp::MirrorRemove { id: id.to_string() },
    ]
}

fn delete_series(master_id: &str) -> Vec<PlannedOp> {
    vec![
        PlannedOp::ProviderDelete { id: master_id.to_string(), scope: DeleteScope::All },
        PlannedOp::MirrorRemoveByMaster { master_id: master_id.to_string() },
        PlannedOp::MirrorRemove { id: master_id.to_string() },
    ]
}

fn series_master<'a>(target: &CalendarEvent, ctx: &'a SeriesContext) -> SyncResult<&'a CalendarEvent> {
    let master_id = target.recurring_event_id().unwrap_or(&target.id);
    ctx.master
        .as_ref()
        .filter(|m| m.id == master_id && m.is_master())
        .ok_or_else(|| validation_error(&format!("series master {} is unknown", master_id)))
}

fn with_rule(master: &CalendarEvent, rule: crate::utils::recurrence::RecurrenceRule) -> CalendarEvent {
    let mut updated = master.clone();
    updated.recurrence = Some(Recurrence::Master(rule));
    updated
}

/// Update the master with one occurrence excluded, then drop its mirror record
fn exclude_occurrence(
    master: &CalendarEvent,
    occurrence: DateTime<Utc>,
    occurrence_ids: Vec<EventId>,
) -> SyncResult<Vec<PlannedOp>> {
    let rule = master
        .recurrence_rule()
        .ok_or_else(|| validation_error(&format!("event {} is not a series master", master.id)))?;
    let updated = with_rule(master, rule.excluding(occurrence));

    let mut ops = vec![
        PlannedOp::ProviderUpdate { event: updated.clone() },
        PlannedOp::MirrorUpsert { event: updated },
    ];
    ops.extend(occurrence_ids.into_iter().map(|id| PlannedOp::MirrorRemove { id }));
    Ok(ops)
}

fn plan_instance_single(target: &CalendarEvent, ctx: &SeriesContext) -> SyncResult<Vec<PlannedOp>> {
    if ctx.native_instance_delete {
        return Ok(delete_single_event(&target.id));
    }
    let master = series_master(target, ctx)?;
    exclude_occurrence(master, target.original_start(), vec![target.id.clone()])
}

fn plan_master_single(master: &CalendarEvent, ctx: &SeriesContext) -> SyncResult<Vec<PlannedOp>> {
    let Some(rule) = master.recurrence_rule() else {
        return Ok(delete_single_event(&master.id));
    };
    let Some(first) = rule.first_occurrence(master.start()) else {
        return Ok(delete_series(&master.id));
    };
    if rule.excluding(first).first_occurrence(master.start()).is_none() {
        // Nothing would be left of the series
        return Ok(delete_series(&master.id));
    }

    let ids = ctx
        .instances
        .iter()
        .filter(|e| e.recurring_event_id() == Some(master.id.as_str()) && e.original_start() == first)
        .map(|e| e.id.clone())
        .collect();
    exclude_occurrence(master, first, ids)
}

fn plan_future(
    master: &CalendarEvent,
    cut: DateTime<Utc>,
    ctx: &SeriesContext,
) -> SyncResult<Vec<PlannedOp>> {
    let rule = master
        .recurrence_rule()
        .ok_or_else(|| validation_error(&format!("event {} is not a series master", master.id)))?;
    match rule.first_occurrence(master.start()) {
        Some(first) if first < cut => {}
        _ => return Ok(delete_series(&master.id)),
    }

    let truncated = with_rule(master, rule.truncated_before(cut));
    let mut ops = vec![
        PlannedOp::ProviderUpdate { event: truncated.clone() },
        PlannedOp::MirrorUpsert { event: truncated },
    ];

    // Ties go to the deleted side: an occurrence starting exactly at the cut is removed
    let doomed: BTreeSet<&str> = ctx
        .instances
        .iter()
        .filter(|e| e.recurring_event_id() == Some(master.id.as_str()) && e.original_start() >= cut)
        .map(|e| e.id.as_str())
        .collect();
    ops.extend(doomed.into_iter().map(|id| PlannedOp::MirrorRemove { id: id.to_string() }));
    Ok(ops)
}
