//! Google Calendar v3 wire types and their mapping to [`CalendarEvent`]

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::models::{
    CalendarEvent, Draft, EventDetails, Recurrence, ReminderOverride, Reminders,
};
use crate::utils::recurrence::RecurrenceRule;
use crate::utils::time::{format_date_time, parse_date, parse_date_time};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<EventDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<EventDateTime>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<GoogleAttendee>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recurrence: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurring_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_start_time: Option<EventDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reminders: Option<GoogleReminders>,
    #[serde(skip_serializing)]
    pub hangout_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conference_data: Option<ConferenceData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDateTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl EventDateTime {
    fn utc(value: &chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            date_time: Some(format_date_time(value)),
            date: None,
            time_zone: Some("UTC".to_string()),
        }
    }

    fn to_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        match (&self.date_time, &self.date) {
            (Some(date_time), _) => parse_date_time(date_time),
            (None, Some(date)) => parse_date(date),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleAttendee {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleReminders {
    pub use_default: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<GoogleReminderOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleReminderOverride {
    pub method: String,
    pub minutes: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConferenceData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_request: Option<CreateConferenceRequest>,
    #[serde(default, skip_serializing)]
    pub entry_points: Vec<EntryPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConferenceRequest {
    pub request_id: String,
    pub conference_solution_key: ConferenceSolutionKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConferenceSolutionKey {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPoint {
    pub entry_point_type: String,
    pub uri: String,
}

/// One page of `events.list`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEventsPage {
    #[serde(default)]
    pub items: Vec<GoogleEvent>,
    pub next_page_token: Option<String>,
}

/// Error envelope returned by Google APIs
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleErrorBody {
    pub error: GoogleErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<GoogleErrorReason>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleErrorReason {
    #[serde(default)]
    pub reason: String,
}

/// Response of the People API `otherContacts:search`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OtherContactsResponse {
    #[serde(default)]
    pub results: Vec<PersonResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersonResult {
    pub person: Person,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(default)]
    pub email_addresses: Vec<EmailAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailAddress {
    pub value: String,
}

impl GoogleEvent {
    fn with_details(details: &EventDetails) -> Self {
        let reminders = GoogleReminders {
            use_default: details.reminders.use_default,
            overrides: details
                .reminders
                .overrides
                .iter()
                .map(|r| GoogleReminderOverride { method: r.method.clone(), minutes: r.minutes })
                .collect(),
        };

        // Ask for a Meet link whenever someone is invited
        let conference_data = (!details.attendees.is_empty()).then(|| ConferenceData {
            create_request: Some(CreateConferenceRequest {
                request_id: Uuid::new_v4().to_string(),
                conference_solution_key: ConferenceSolutionKey { kind: "hangoutsMeet".to_string() },
            }),
            entry_points: Vec::new(),
        });

        Self {
            summary: Some(details.title.clone()),
            description: details.description.clone(),
            location: details.location.clone(),
            start: Some(EventDateTime::utc(&details.start)),
            end: Some(EventDateTime::utc(&details.end)),
            attendees: details
                .attendees
                .iter()
                .map(|email| GoogleAttendee { email: email.clone() })
                .collect(),
            reminders: Some(reminders),
            conference_data,
            ..Default::default()
        }
    }

    /// Request body for `events.insert`
    pub fn from_draft(draft: &Draft) -> Self {
        let mut event = Self::with_details(&draft.details);
        if let Some(rule) = &draft.recurrence_rule {
            event.recurrence = rule.to_lines();
        }
        event
    }

    /// Request body for `events.update`
    pub fn from_event(committed: &CalendarEvent) -> Self {
        let mut event = Self::with_details(&committed.details);
        event.id = Some(committed.id.clone());
        match &committed.recurrence {
            Some(Recurrence::Master(rule)) => event.recurrence = rule.to_lines(),
            Some(Recurrence::Instance { master_id, original_start }) => {
                event.recurring_event_id = Some(master_id.clone());
                event.original_start_time = Some(EventDateTime::utc(original_start));
            }
            None => {}
        }
        // An existing link means the conference already exists
        if committed.meeting_link.is_some() {
            event.conference_data = None;
        }
        event
    }

    fn meeting_link(&self) -> Option<String> {
        self.hangout_link.clone().or_else(|| {
            self.conference_data
                .as_ref()?
                .entry_points
                .iter()
                .find(|entry| entry.entry_point_type == "video")
                .map(|entry| entry.uri.clone())
        })
    }
}

impl TryFrom<GoogleEvent> for CalendarEvent {
    type Error = ProviderError;

    fn try_from(event: GoogleEvent) -> Result<Self, Self::Error> {
        let meeting_link = event.meeting_link();
        let id = event
            .id
            .ok_or_else(|| ProviderError::Unknown("event without id in provider response".into()))?;

        let start = event
            .start
            .as_ref()
            .and_then(EventDateTime::to_utc)
            .ok_or_else(|| ProviderError::Unknown(format!("event {} has no usable start", id)))?;
        let end = event.end.as_ref().and_then(EventDateTime::to_utc).unwrap_or(start);

        let recurrence = if !event.recurrence.is_empty() {
            let rule = RecurrenceRule::from_lines(&event.recurrence).map_err(|e| {
                ProviderError::Unknown(format!("event {} has an unsupported recurrence: {}", id, e))
            })?;
            Some(Recurrence::Master(rule))
        } else if let Some(master_id) = event.recurring_event_id {
            let original_start = event
                .original_start_time
                .as_ref()
                .and_then(EventDateTime::to_utc)
                .unwrap_or(start);
            Some(Recurrence::Instance { master_id, original_start })
        } else {
            None
        };

        let reminders = match event.reminders {
            Some(reminders) if !reminders.use_default => Reminders::custom(
                reminders
                    .overrides
                    .into_iter()
                    .map(|r| ReminderOverride { method: r.method, minutes: r.minutes })
                    .collect(),
            ),
            _ => Reminders::default(),
        };

        let mut details = EventDetails::new(event.summary.unwrap_or_default(), start, end);
        details.description = event.description;
        details.location = event.location;
        details.reminders = reminders;
        for attendee in &event.attendees {
            if attendee.email.trim().is_empty() {
                warn!(event_id = %id, "dropping attendee with empty email");
                continue;
            }
            details.add_attendee(&attendee.email);
        }

        Ok(CalendarEvent { id, details, recurrence, meeting_link })
    }
}
