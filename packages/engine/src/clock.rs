//! UTC normalization of heterogeneous datetime strings, ISO serialization, and
//! interval arithmetic. No other module does its own datetime parsing — this is
//! the single place heterogeneous formats are tamed.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Serialize a UTC instant the way the rest of the system expects to read it
/// back: `2030-01-01T00:00:00+00:00`, never the `Z` shorthand.
///
/// `ParseIsoToUtc(ToIso(dt))` must be the identity for every UTC `dt` produced
/// by this module — see the round-trip test below.
pub fn to_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

/// Accepts ISO-8601 with trailing `Z`, an explicit offset, or a naive string
/// (assumed UTC). Fails with `InvalidTimestamp` if no parser rule matches.
pub fn parse_iso_to_utc(s: &str) -> Result<DateTime<Utc>, ClockError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ClockError::InvalidTimestamp(s.to_string()));
    }

    let normalized = match s.strip_suffix('Z') {
        Some(rest) => format!("{rest}+00:00"),
        None => s.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Ok(dt.with_timezone(&Utc));
    }

    // No offset at all: fromisoformat-style heuristic, assume UTC.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(ClockError::InvalidTimestamp(s.to_string()))
}

/// Parses either `YYYY-MM-DD` (as midnight UTC) or a full ISO datetime.
fn parse_flexible(s: &str) -> Result<DateTime<Utc>, ClockError> {
    if let Ok(date) = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always a valid time");
        return Ok(Utc.from_utc_datetime(&midnight));
    }
    parse_iso_to_utc(s)
}

/// Accepts either `YYYY-MM-DD` (interpreted as midnight UTC) or an ISO
/// datetime; returns a canonical UTC ISO string.
pub fn normalize_due(s: &str) -> Result<String, ClockError> {
    parse_flexible(s).map(to_iso)
}

/// Offsets an ISO-or-date string by `minutes`, returning a UTC ISO string.
/// `None` input yields `None` output.
pub fn add_duration(s: Option<&str>, minutes: i64) -> Result<Option<String>, ClockError> {
    match s {
        None => Ok(None),
        Some(s) => {
            let dt = parse_flexible(s)?;
            Ok(Some(to_iso(dt + Duration::minutes(minutes))))
        }
    }
}

/// The next occurrence of `hour:minute` in `tz`, relative to `now` — today if
/// `now` is still before that time, tomorrow otherwise. Returned in UTC.
///
/// This is the step-4-and-earlier rescheduling rule (spec.md §4.1
/// `BumpStepAndReschedule`): it always lands on the next 10:40 slot and never
/// reasons about the original deadline.
pub fn next_local_time_today_or_tomorrow(
    tz: Tz,
    hour: u32,
    minute: u32,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let now_local = now.with_timezone(&tz);
    let today = now_local.date_naive();
    let today_slot = tz
        .from_local_datetime(
            &today
                .and_hms_opt(hour, minute, 0)
                .expect("hour/minute are caller-supplied constants"),
        )
        .single()
        .unwrap_or_else(|| now_local);

    let next_local = if now_local < today_slot {
        today_slot
    } else {
        today_slot + Duration::days(1)
    };

    next_local.with_timezone(&Utc)
}

/// Resolve a configured IANA zone name, falling back to UTC if it cannot be
/// resolved (spec.md §4.1: "If the configured zone cannot be resolved, fall
/// back to UTC").
pub fn resolve_zone(name: &str) -> Tz {
    name.parse().unwrap_or(chrono_tz::UTC)
}

/// Informational comparison used when a task's `due` changes remotely after
/// admission (grounded on `original_source/app/utils.py::parse_and_compare_due`).
/// Does not affect scheduling — spec.md's invariants never require reacting to
/// a changed `due` post-admission.
pub fn due_changed(new_due: Option<&str>, due: Option<&str>) -> bool {
    let (Some(new_due), Some(due)) = (new_due, due) else {
        return false;
    };
    match (parse_iso_to_utc(new_due), parse_iso_to_utc(due)) {
        (Ok(a), Ok(b)) => a != b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_trailing_zulu() {
        let dt = parse_iso_to_utc("2030-01-01T10:00:00Z").unwrap();
        assert_eq!(dt.to_string(), "2030-01-01 10:00:00 UTC");
    }

    #[test]
    fn parse_accepts_explicit_offset() {
        let dt = parse_iso_to_utc("2030-01-01T13:00:00+03:00").unwrap();
        assert_eq!(dt.to_string(), "2030-01-01 10:00:00 UTC");
    }

    #[test]
    fn parse_assumes_utc_for_naive_strings() {
        let dt = parse_iso_to_utc("2030-01-01T10:00:00").unwrap();
        assert_eq!(dt.to_string(), "2030-01-01 10:00:00 UTC");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_iso_to_utc("not-a-date").is_err());
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(parse_iso_to_utc("").is_err());
    }

    #[test]
    fn round_trip_is_identity() {
        let original = "2030-01-01T10:00:00.500000+00:00";
        let dt = parse_iso_to_utc(original).unwrap();
        let again = parse_iso_to_utc(&to_iso(dt)).unwrap();
        assert_eq!(dt, again);
        assert_eq!(to_iso(dt), to_iso(again));
    }

    #[test]
    fn normalize_date_only_equals_normalize_midnight_iso() {
        let from_date = normalize_due("2030-06-15").unwrap();
        let from_iso = normalize_due("2030-06-15T00:00:00+00:00").unwrap();
        assert_eq!(from_date, from_iso);
    }

    #[test]
    fn add_duration_none_input_yields_none_output() {
        assert_eq!(add_duration(None, 30).unwrap(), None);
    }

    #[test]
    fn add_duration_offsets_forward() {
        let out = add_duration(Some("2030-01-01T10:00:00+00:00"), 90)
            .unwrap()
            .unwrap();
        assert_eq!(out, "2030-01-01T11:30:00.000000+00:00");
    }

    #[test]
    fn next_slot_is_today_when_before_cutoff() {
        let now = parse_iso_to_utc("2030-01-01T05:00:00+00:00").unwrap();
        let next = next_local_time_today_or_tomorrow(chrono_tz::UTC, 10, 40, now);
        assert_eq!(to_iso(next), "2030-01-01T10:40:00.000000+00:00");
    }

    #[test]
    fn next_slot_rolls_to_tomorrow_when_past_cutoff() {
        let now = parse_iso_to_utc("2030-01-01T11:00:00+00:00").unwrap();
        let next = next_local_time_today_or_tomorrow(chrono_tz::UTC, 10, 40, now);
        assert_eq!(to_iso(next), "2030-01-02T10:40:00.000000+00:00");
    }

    #[test]
    fn unresolvable_zone_falls_back_to_utc() {
        assert_eq!(resolve_zone("Not/A_Zone"), chrono_tz::UTC);
    }

    #[test]
    fn resolves_known_zone() {
        assert_eq!(resolve_zone("Europe/Moscow"), chrono_tz::Europe::Moscow);
    }
}
