//! Minimal recurrence rules.
//!
//! `FREQ` (daily, weekly, monthly, yearly), `INTERVAL`, `COUNT`, `UNTIL` and
//! `EXDATE` are modelled, which is what deletion scopes rewrite. Any other
//! rule part (`BYDAY`, `WKST`, ...) and any other line (`RDATE`, ...) is kept
//! verbatim and written back unchanged. Expansion ignores those parts, so it
//! is only exact for rules built from the modelled subset.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::DateRange;

/// Upper bound on generated candidates, so an unbounded rule cannot spin forever
const MAX_EXPANSION_STEPS: usize = 10_000;

const RRULE_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const FLOATING_DATE_FORMAT: &str = "%Y%m%dT%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    #[error("Unsupported recurrence line: {0}")]
    UnsupportedLine(String),
    #[error("Invalid recurrence value '{value}' for {field}")]
    InvalidValue { field: &'static str, value: String },
    #[error("Recurrence has no RRULE line")]
    MissingRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Daily => write!(f, "DAILY"),
            Frequency::Weekly => write!(f, "WEEKLY"),
            Frequency::Monthly => write!(f, "MONTHLY"),
            Frequency::Yearly => write!(f, "YEARLY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: u32,
    pub count: Option<u32>,
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exdates: BTreeSet<DateTime<Utc>>,
    /// RRULE parts that are not modelled, e.g. `BYDAY=MO,WE`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_parts: Vec<String>,
    /// Recurrence lines other than RRULE and EXDATE, e.g. `RDATE:...`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_lines: Vec<String>,
}

impl RecurrenceRule {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            interval: 1,
            count: None,
            until: None,
            exdates: BTreeSet::new(),
            extra_parts: Vec::new(),
            extra_lines: Vec::new(),
        }
    }

    pub fn daily() -> Self {
        Self::new(Frequency::Daily)
    }

    pub fn weekly() -> Self {
        Self::new(Frequency::Weekly)
    }

    pub fn monthly() -> Self {
        Self::new(Frequency::Monthly)
    }

    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = interval.max(1);
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self.until = None;
        self
    }

    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self.count = None;
        self
    }

    /// Same rule with the occurrence starting at `at` removed
    pub fn excluding(&self, at: DateTime<Utc>) -> Self {
        let mut rule = self.clone();
        rule.exdates.insert(at);
        rule
    }

    /// Same rule, ending immediately before the occurrence starting at `at`
    pub fn truncated_before(&self, at: DateTime<Utc>) -> Self {
        let mut rule = self.clone();
        let until = at - Duration::seconds(1);
        rule.until = Some(match rule.until {
            Some(existing) if existing < until => existing,
            _ => until,
        });
        rule.count = None;
        rule.exdates.retain(|d| *d < at);
        rule
    }

    /// Whether an occurrence starting at `at` is generated by this rule
    pub fn has_occurrence(&self, dtstart: DateTime<Utc>, at: DateTime<Utc>) -> bool {
        if at < dtstart {
            return false;
        }
        let instant = DateRange::new(at, at + Duration::seconds(1));
        self.occurrences(dtstart, Duration::zero(), &instant).contains(&at)
    }

    /// Occurrence starts whose `[start, start + duration)` overlaps `range`
    pub fn occurrences(
        &self,
        dtstart: DateTime<Utc>,
        duration: Duration,
        range: &DateRange,
    ) -> Vec<DateTime<Utc>> {
        let mut found = Vec::new();
        for candidate in self.generated(dtstart) {
            if candidate >= range.end {
                break;
            }
            if self.exdates.contains(&candidate) {
                continue;
            }
            if range.overlaps(candidate, candidate + duration) {
                found.push(candidate);
            }
        }
        found
    }

    /// First occurrence at or after `dtstart`, exdates skipped
    pub fn first_occurrence(&self, dtstart: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.generated(dtstart)
            .find(|candidate| !self.exdates.contains(candidate))
    }

    /// Every start the rule generates, exdates included, bounded by COUNT and UNTIL
    fn generated(&self, dtstart: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let count = self.count.map_or(usize::MAX, |c| c as usize);
        (0..MAX_EXPANSION_STEPS)
            .map_while(move |step| self.nth_candidate(dtstart, step as u32))
            .flatten()
            .take(count)
            .take_while(move |candidate| self.until.map_or(true, |until| *candidate <= until))
    }

    /// `Some(None)` marks a period without an occurrence, e.g. February for a rule on the 30th
    fn nth_candidate(&self, dtstart: DateTime<Utc>, n: u32) -> Option<Option<DateTime<Utc>>> {
        let steps = n.checked_mul(self.interval.max(1))?;
        match self.frequency {
            Frequency::Daily => dtstart.checked_add_signed(Duration::days(steps as i64)).map(Some),
            Frequency::Weekly => dtstart.checked_add_signed(Duration::weeks(steps as i64)).map(Some),
            Frequency::Monthly => months_later(dtstart, steps),
            Frequency::Yearly => months_later(dtstart, steps.checked_mul(12)?),
        }
    }

    /// Provider representation: one `RRULE:` line, `EXDATE:` lines, then lines kept verbatim
    pub fn to_lines(&self) -> Vec<String> {
        let mut rule = format!("RRULE:FREQ={}", self.frequency);
        if self.interval > 1 {
            rule.push_str(&format!(";INTERVAL={}", self.interval));
        }
        if let Some(count) = self.count {
            rule.push_str(&format!(";COUNT={}", count));
        }
        if let Some(until) = self.until {
            rule.push_str(&format!(";UNTIL={}", until.format(RRULE_DATE_FORMAT)));
        }
        for part in &self.extra_parts {
            rule.push(';');
            rule.push_str(part);
        }

        let mut lines = vec![rule];
        lines.extend(
            self.exdates
                .iter()
                .map(|d| format!("EXDATE:{}", d.format(RRULE_DATE_FORMAT))),
        );
        lines.extend(self.extra_lines.iter().cloned());
        lines
    }

    pub fn from_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, RecurrenceError> {
        let mut rule: Option<RecurrenceRule> = None;
        let mut exdates = BTreeSet::new();
        let mut extra_lines = Vec::new();

        for line in lines {
            let line = line.as_ref().trim();
            let (head, value) = line
                .split_once(':')
                .ok_or_else(|| RecurrenceError::UnsupportedLine(line.to_string()))?;
            let mut params = head.split(';');
            let name = params.next().unwrap_or(head);
            match name {
                "RRULE" => rule = Some(value.parse()?),
                "EXDATE" => {
                    let tzid = params.find_map(|p| p.strip_prefix("TZID="));
                    for date in value.split(',') {
                        exdates.insert(parse_exdate(date, tzid)?);
                    }
                }
                _ => extra_lines.push(line.to_string()),
            }
        }

        let mut rule = rule.ok_or(RecurrenceError::MissingRule)?;
        rule.exdates.extend(exdates);
        rule.extra_lines = extra_lines;
        Ok(rule)
    }
}

impl FromStr for RecurrenceRule {
    type Err = RecurrenceError;

    /// Parses the value of an `RRULE` line (without the `RRULE:` prefix)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut frequency = None;
        let mut rule = RecurrenceRule::daily();

        for part in s.trim().trim_start_matches("RRULE:").split(';').filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| RecurrenceError::UnsupportedLine(part.to_string()))?;
            match key {
                "FREQ" => {
                    frequency = Some(match value {
                        "DAILY" => Frequency::Daily,
                        "WEEKLY" => Frequency::Weekly,
                        "MONTHLY" => Frequency::Monthly,
                        "YEARLY" => Frequency::Yearly,
                        _ => {
                            return Err(RecurrenceError::InvalidValue {
                                field: "FREQ",
                                value: value.to_string(),
                            })
                        }
                    })
                }
                "INTERVAL" => {
                    rule.interval = value.parse().map_err(|_| RecurrenceError::InvalidValue {
                        field: "INTERVAL",
                        value: value.to_string(),
                    })?
                }
                "COUNT" => {
                    rule.count = Some(value.parse().map_err(|_| RecurrenceError::InvalidValue {
                        field: "COUNT",
                        value: value.to_string(),
                    })?)
                }
                "UNTIL" => rule.until = Some(parse_rrule_date("UNTIL", value)?),
                _ => rule.extra_parts.push(part.to_string()),
            }
        }

        rule.frequency = frequency.ok_or_else(|| RecurrenceError::InvalidValue {
            field: "FREQ",
            value: String::new(),
        })?;
        rule.interval = rule.interval.max(1);
        Ok(rule)
    }
}

fn months_later(dtstart: DateTime<Utc>, months: u32) -> Option<Option<DateTime<Utc>>> {
    let candidate = dtstart.checked_add_months(Months::new(months))?;
    // chrono clamps to the end of shorter months; such dates are not occurrences
    Some((candidate.day() == dtstart.day()).then_some(candidate))
}

/// UTC (`...Z`), floating (read as UTC) or date-only values
fn parse_rrule_date(field: &'static str, value: &str) -> Result<DateTime<Utc>, RecurrenceError> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, RRULE_DATE_FORMAT)
        .ok()
        .or_else(|| parse_local(value))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| RecurrenceError::InvalidValue { field, value: value.to_string() })
}

fn parse_local(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, FLOATING_DATE_FORMAT)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y%m%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// An EXDATE value, local to `tzid` when the line carries one
fn parse_exdate(value: &str, tzid: Option<&str>) -> Result<DateTime<Utc>, RecurrenceError> {
    let value = value.trim();
    let Some(tzid) = tzid else {
        return parse_rrule_date("EXDATE", value);
    };
    let invalid = || RecurrenceError::InvalidValue {
        field: "EXDATE",
        value: format!("TZID={}:{}", tzid, value),
    };

    let tz: Tz = tzid.parse().map_err(|_| invalid())?;
    let local = parse_local(value).ok_or_else(invalid)?;
    tz.from_local_datetime(&local)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jan(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn daily_expansion_respects_exdates_and_range() {
        let rule = RecurrenceRule::daily().excluding(jan(3, 9));
        let range = DateRange::new(jan(1, 0), jan(6, 0));
        let starts = rule.occurrences(jan(1, 9), Duration::hours(1), &range);
        assert_eq!(starts, vec![jan(1, 9), jan(2, 9), jan(4, 9), jan(5, 9)]);
    }

    #[test]
    fn count_limits_generated_occurrences_including_excluded_ones() {
        let rule = RecurrenceRule::daily().with_count(3).excluding(jan(2, 9));
        let starts = rule.occurrences(jan(1, 9), Duration::hours(1), &DateRange::starting_at(jan(1, 0)));
        assert_eq!(starts, vec![jan(1, 9), jan(3, 9)]);
    }

    #[test]
    fn truncation_ends_before_the_given_occurrence() {
        let rule = RecurrenceRule::daily().truncated_before(jan(4, 9));
        let starts = rule.occurrences(jan(1, 9), Duration::hours(1), &DateRange::starting_at(jan(1, 0)));
        assert_eq!(starts, vec![jan(1, 9), jan(2, 9), jan(3, 9)]);
        assert!(!rule.has_occurrence(jan(1, 9), jan(4, 9)));
    }

    #[test]
    fn lines_round_trip_through_the_provider_format() {
        let rule = RecurrenceRule::weekly().with_interval(2).with_until(jan(31, 0)).excluding(jan(15, 9));
        let lines = rule.to_lines();
        assert_eq!(lines[0], "RRULE:FREQ=WEEKLY;INTERVAL=2;UNTIL=20240131T000000Z");
        assert_eq!(lines[1], "EXDATE:20240115T090000Z");
        assert_eq!(RecurrenceRule::from_lines(&lines).unwrap(), rule);
    }

    #[test]
    fn parameterised_exdate_lines_are_accepted() {
        let lines = ["RRULE:FREQ=DAILY;COUNT=5", "EXDATE;VALUE=DATE-TIME:20240102T090000Z"];
        let rule = RecurrenceRule::from_lines(&lines).unwrap();
        assert_eq!(rule.count, Some(5));
        assert!(rule.exdates.contains(&jan(2, 9)));
    }

    #[test]
    fn invalid_frequency_and_missing_rule_are_rejected() {
        assert!("FREQ=FORTNIGHTLY".parse::<RecurrenceRule>().is_err());
        assert!(RecurrenceRule::from_lines(&["EXDATE:20240102T090000Z"]).is_err());
    }

    #[test]
    fn unmodelled_parts_and_lines_are_written_back() {
        let lines = [
            "RRULE:FREQ=WEEKLY;WKST=MO;BYDAY=MO,WE;COUNT=6",
            "EXDATE:20240103T090000Z",
            "RDATE:20240120T090000Z",
        ];
        let rule = RecurrenceRule::from_lines(&lines).unwrap();
        assert_eq!(rule.extra_parts, vec!["WKST=MO".to_string(), "BYDAY=MO,WE".to_string()]);

        let truncated = rule.truncated_before(jan(10, 9)).to_lines();
        assert_eq!(truncated[0], "RRULE:FREQ=WEEKLY;UNTIL=20240110T085959Z;WKST=MO;BYDAY=MO,WE");
        assert_eq!(truncated[1], "EXDATE:20240103T090000Z");
        assert_eq!(truncated[2], "RDATE:20240120T090000Z");
    }

    #[test]
    fn exdates_with_a_time_zone_are_converted_to_utc() {
        let lines = [
            "RRULE:FREQ=DAILY",
            "EXDATE;TZID=Europe/Helsinki:20240102T110000,20240103T110000",
        ];
        let rule = RecurrenceRule::from_lines(&lines).unwrap();
        assert!(rule.exdates.contains(&jan(2, 9)));
        assert!(rule.exdates.contains(&jan(3, 9)));
        assert!(!rule.has_occurrence(jan(1, 9), jan(2, 9)));

        let unknown = ["RRULE:FREQ=DAILY", "EXDATE;TZID=Nowhere/Special:20240102T110000"];
        assert!(RecurrenceRule::from_lines(&unknown).is_err());
    }

    #[test]
    fn floating_and_date_only_values_are_read_as_utc() {
        let rule: RecurrenceRule = "FREQ=DAILY;UNTIL=20240105".parse().unwrap();
        assert_eq!(rule.until, Some(jan(5, 0)));
        let rule = RecurrenceRule::from_lines(&["RRULE:FREQ=DAILY", "EXDATE:20240102T090000"]).unwrap();
        assert!(rule.exdates.contains(&jan(2, 9)));
    }

    #[test]
    fn monthly_rule_skips_months_without_the_start_day() {
        let start = jan(31, 9);
        let rule = RecurrenceRule::monthly().with_count(3);
        let starts = rule.occurrences(start, Duration::hours(1), &DateRange::starting_at(jan(1, 0)));
        let expected: Vec<_> = [(1, 31), (3, 31), (5, 31)]
            .into_iter()
            .map(|(m, d)| Utc.with_ymd_and_hms(2024, m, d, 9, 0, 0).unwrap())
            .collect();
        assert_eq!(starts, expected);
        assert!(!rule.has_occurrence(start, Utc.with_ymd_and_hms(2024, 2, 29, 9, 0, 0).unwrap()));
    }

    #[test]
    fn yearly_rule_on_leap_day_only_lands_on_leap_years() {
        let start = Utc.with_ymd_and_hms(2024, 2, 29, 9, 0, 0).unwrap();
        let rule: RecurrenceRule = "FREQ=YEARLY;COUNT=2".parse().unwrap();
        assert_eq!(rule.first_occurrence(start), Some(start));
        let later = Utc.with_ymd_and_hms(2028, 2, 29, 9, 0, 0).unwrap();
        assert!(rule.has_occurrence(start, later));
        assert!(!rule.has_occurrence(start, Utc.with_ymd_and_hms(2025, 2, 28, 9, 0, 0).unwrap()));
    }
}
