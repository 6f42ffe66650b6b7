//! Civil (wall-clock) time in a named zone, projected to UTC instants.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Largest DST gap, in minutes, stepped across when a wall-clock time does not exist.
const MAX_GAP_MINUTES: i64 = 180;
const GAP_STEP_MINUTES: i64 = 15;

/// UTC instant of `date` at `time` on the wall clock of `tz`.
///
/// Ambiguous times (fall back) resolve to the earlier instant. Times inside a
/// spring-forward gap resolve to the first valid wall-clock time after it.
pub fn civil_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let target = NaiveDateTime::new(date, time);
    let mut probe = target;
    while (probe - target).num_minutes() <= MAX_GAP_MINUTES {
        match tz.from_local_datetime(&probe) {
            LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => probe += Duration::minutes(GAP_STEP_MINUTES),
        }
    }
    // No zone has a gap this wide; treat the wall time as UTC.
    Utc.from_utc_datetime(&target)
}

/// Civil midnight at the start of `date`.
pub fn civil_midnight(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    civil_instant(tz, date, NaiveTime::MIN)
}

/// `[start of date, start of next date)` on the civil calendar.
pub fn civil_day(tz: Tz, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = civil_midnight(tz, date);
    let end = civil_midnight(tz, date.succ_opt().unwrap_or(date));
    (start, end)
}

/// Move an instant by whole civil days, keeping its wall-clock time.
///
/// Across a DST change this is 23 or 25 hours of elapsed time, not 24.
pub fn add_civil_days(tz: Tz, at: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    let local = at.with_timezone(&tz).naive_local();
    let Some(date) = local.date().checked_add_signed(Duration::days(days)) else {
        return at;
    };
    civil_instant(tz, date, local.time())
}

/// Civil date of an instant in `tz`.
pub fn civil_date(tz: Tz, at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}

/// Parse `YYYY-MM-DD`, or the date prefix of an ISO datetime.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let prefix = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

/// Parse an RFC 3339 instant. Naive `YYYY-MM-DDTHH:MM:SS` is read as UTC.
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
