use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::models::DateRange;

/// Parse an RFC 3339 timestamp as sent by the provider
pub fn parse_date_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse an all-day `YYYY-MM-DD` date as midnight UTC
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Format a timestamp the way the provider expects it in query strings and bodies
pub fn format_date_time(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// The moving window the scheduler keeps fresh
pub fn sync_window(now: DateTime<Utc>, days_back: u32, days_ahead: u32) -> DateRange {
    DateRange::new(
        now - Duration::days(days_back as i64),
        now + Duration::days(days_ahead as i64),
    )
}

/// Size of the sync window around "now"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub days_back: u32,
    pub days_ahead: u32,
}

impl Default for SyncWindow {
    fn default() -> Self {
        Self { days_back: 7, days_ahead: 60 }
    }
}

impl SyncWindow {
    pub fn at(&self, now: DateTime<Utc>) -> DateRange {
        sync_window(now, self.days_back, self.days_ahead)
    }

    pub fn current(&self) -> DateRange {
        self.at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_offsets_into_utc() {
        let parsed = parse_date_time("2024-01-03T11:00:00+02:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 3, 9, 0, 0).unwrap());
    }

    #[test]
    fn all_day_dates_start_at_midnight() {
        let parsed = parse_date("2024-01-03").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());
        assert!(parse_date("03.01.2024").is_none());
    }

    #[test]
    fn window_spans_both_directions() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let window = SyncWindow { days_back: 2, days_ahead: 5 }.at(now);
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 1, 8, 12, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap());
    }

    #[test]
    fn formats_with_zulu_suffix() {
        let value = Utc.with_ymd_and_hms(2024, 1, 3, 9, 0, 0).unwrap();
        assert_eq!(format_date_time(&value), "2024-01-03T09:00:00Z");
    }
}
