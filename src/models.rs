//! Calendar event types shared by the provider, mirror and cache layers

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{validation_error, SyncResult};
use crate::utils::recurrence::RecurrenceRule;

/// Provider-assigned event identifier
pub type EventId = String;

/// A half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Everything from `start` onwards
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self { start, end: DateTime::<Utc>::MAX_UTC }
    }

    /// Whether an interval `[start, end)` overlaps this range.
    /// Zero-length intervals overlap when their start lies inside the range.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        if start == end {
            return self.contains(start);
        }
        start < self.end && end > self.start
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    pub fn intersects(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersection(&self, other: &DateRange) -> Option<DateRange> {
        self.intersects(other)
            .then(|| DateRange::new(self.start.max(other.start), self.end.min(other.end)))
    }

    /// Smallest range covering both
    pub fn union(&self, other: &DateRange) -> DateRange {
        DateRange::new(self.start.min(other.start), self.end.max(other.end))
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// How much of a series a delete affects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteScope {
    /// One occurrence
    Single,
    /// This occurrence and every later one
    Future,
    /// The entire series
    All,
}

impl fmt::Display for DeleteScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteScope::Single => write!(f, "single"),
            DeleteScope::Future => write!(f, "future"),
            DeleteScope::All => write!(f, "all"),
        }
    }
}

/// Where an event sits in a recurring series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    /// The event carrying the series rule
    Master(RecurrenceRule),
    /// One occurrence of the series owned by `master_id`
    Instance {
        master_id: EventId,
        original_start: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderOverride {
    pub method: String,
    pub minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminders {
    pub use_default: bool,
    pub overrides: Vec<ReminderOverride>,
}

impl Default for Reminders {
    fn default() -> Self {
        Self { use_default: true, overrides: Vec::new() }
    }
}

impl Reminders {
    pub fn custom(overrides: Vec<ReminderOverride>) -> Self {
        Self { use_default: false, overrides }
    }
}

/// The user-editable part of an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetails {
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: BTreeSet<String>,
    pub reminders: Reminders,
}

impl EventDetails {
    pub fn new(title: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            description: None,
            location: None,
            start,
            end,
            attendees: BTreeSet::new(),
            reminders: Reminders::default(),
        }
    }

    /// Add an attendee address, normalised so that the set stays duplicate-free
    pub fn add_attendee(&mut self, email: &str) {
        let email = email.trim().to_lowercase();
        if !email.is_empty() {
            self.attendees.insert(email);
        }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.end < self.start {
            return Err(validation_error(&format!(
                "event '{}' ends before it starts",
                self.title
            )));
        }
        if self.reminders.use_default && !self.reminders.overrides.is_empty() {
            return Err(validation_error(
                "reminder overrides require use_default to be false",
            ));
        }
        if let Some(bad) = self.attendees.iter().find(|a| !a.contains('@')) {
            return Err(validation_error(&format!("invalid attendee address '{}'", bad)));
        }
        Ok(())
    }
}

/// An event that has not been committed to the provider yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub details: EventDetails,
    pub recurrence_rule: Option<RecurrenceRule>,
}

impl Draft {
    pub fn new(details: EventDetails) -> Self {
        Self { details, recurrence_rule: None }
    }

    pub fn recurring(details: EventDetails, rule: RecurrenceRule) -> Self {
        Self { details, recurrence_rule: Some(rule) }
    }

    pub fn validate(&self) -> SyncResult<()> {
        self.details.validate()
    }

    /// Time range a commit of this draft can touch
    pub fn affected_range(&self) -> DateRange {
        match self.recurrence_rule {
            Some(_) => DateRange::starting_at(self.details.start),
            None => DateRange::new(self.details.start, self.details.end.max(self.details.start + Duration::seconds(1))),
        }
    }
}

/// An event committed to the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: EventId,
    #[serde(flatten)]
    pub details: EventDetails,
    pub recurrence: Option<Recurrence>,
    /// Assigned by the provider only
    pub meeting_link: Option<String>,
}

impl CalendarEvent {
    pub fn start(&self) -> DateTime<Utc> {
        self.details.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.details.end
    }

    pub fn title(&self) -> &str {
        &self.details.title
    }

    pub fn recurrence_rule(&self) -> Option<&RecurrenceRule> {
        match &self.recurrence {
            Some(Recurrence::Master(rule)) => Some(rule),
            _ => None,
        }
    }

    pub fn recurring_event_id(&self) -> Option<&str> {
        match &self.recurrence {
            Some(Recurrence::Instance { master_id, .. }) => Some(master_id),
            _ => None,
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self.recurrence, Some(Recurrence::Master(_)))
    }

    /// Writes to events sharing a series key are serialized
    pub fn series_key(&self) -> &str {
        self.recurring_event_id().unwrap_or(&self.id)
    }

    pub fn overlaps(&self, range: &DateRange) -> bool {
        range.overlaps(self.start(), self.end())
    }

    /// Time range a write to this event can touch
    pub fn affected_range(&self) -> DateRange {
        match &self.recurrence {
            Some(_) => DateRange::starting_at(self.start().min(self.original_start())),
            None => DateRange::new(self.start(), self.end().max(self.start() + Duration::seconds(1))),
        }
    }

    /// Start of the occurrence this event was generated from
    pub fn original_start(&self) -> DateTime<Utc> {
        match &self.recurrence {
            Some(Recurrence::Instance { original_start, .. }) => *original_start,
            _ => self.start(),
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        self.details.validate()
    }
}
