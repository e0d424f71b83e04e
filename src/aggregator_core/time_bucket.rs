//! Time bucketing and localization
//!
//! Measurements are stored as hour-floored UTC instants. The read path
//! converts them to the system's civil timezone and truncates to the requested
//! frequency on the local wall clock.
//!
//! DST: during a fall-back transition two different instants render to the same
//! local hour (`2023-11-05 01` happens twice in `America/New_York`). Grouping
//! compares `wall_clock_key` strings, never the aware datetimes, so both land in
//! one bucket.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Aggregation granularity for the read path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    /// Collapse the whole range into a single bucket
    Instant,
    Hour,
    Day,
    Month,
    Year,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Instant => "t",
            Frequency::Hour => "h",
            Frequency::Day => "d",
            Frequency::Month => "m",
            Frequency::Year => "y",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "t" => Some(Frequency::Instant),
            "h" => Some(Frequency::Hour),
            "d" => Some(Frequency::Day),
            "m" => Some(Frequency::Month),
            "y" => Some(Frequency::Year),
            _ => None,
        }
    }
}

/// Floor a UTC instant to the start of its hour
pub fn truncate_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Convert a UTC instant to the system's civil time
pub fn to_local_time(utc: DateTime<Utc>, tz: Tz) -> DateTime<Tz> {
    tz.from_utc_datetime(&utc.naive_utc())
}

/// Resolve a local wall-clock time in `tz`
///
/// Ambiguous times (fall-back) resolve to the earliest instant. A time in a
/// spring-forward gap moves forward to the first valid wall-clock time, which
/// stays on the same calendar date.
fn resolve_local(tz: Tz, naive: NaiveDateTime, reference: &DateTime<Tz>) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => (1..=8)
            .find_map(|step| tz.from_local_datetime(&(naive + Duration::minutes(15 * step))).earliest())
            .unwrap_or(*reference),
    }
}

/// Truncate a local time to the start of its bucket
///
/// Only calendar fields at or above the frequency are reset:
/// - `Hour` / `Instant`: unchanged (stored values are already hour-floored)
/// - `Day`: hour = 0
/// - `Month`: hour = 0, day = 1
/// - `Year`: hour = 0, day = 1, month = 1
pub fn floor_to_frequency(local: DateTime<Tz>, freq: Frequency) -> DateTime<Tz> {
    let naive = local.naive_local();
    let floored = match freq {
        Frequency::Instant | Frequency::Hour => return local,
        Frequency::Day => naive.with_hour(0),
        Frequency::Month => naive.with_hour(0).and_then(|n| n.with_day(1)),
        Frequency::Year => naive
            .with_hour(0)
            .and_then(|n| n.with_day(1))
            .and_then(|n| n.with_month(1)),
    };

    match floored {
        Some(naive) => resolve_local(local.timezone(), naive, &local),
        None => local,
    }
}

/// Timezone-naive rendering of the local wall-clock hour, used as the group key
pub fn wall_clock_key(local: &DateTime<Tz>) -> String {
    local.format("%Y-%m-%d %H").to_string()
}

fn parse_local_hour(s: &str, tz: Tz) -> Option<LocalResult<DateTime<Tz>>> {
    if s.len() != 10 || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(&format!("{}0000", s), "%Y%m%d%H%M%S").ok()?;
    Some(tz.from_local_datetime(&naive))
}

/// Interpret a `YYYYMMDDHH` string as local time in `tz` and convert to UTC
///
/// Returns None for malformed input or a wall-clock hour skipped by DST.
/// A repeated fall-back hour resolves to its first occurrence.
pub fn local_hour_to_utc(s: &str, tz: Tz) -> Option<DateTime<Utc>> {
    parse_local_hour(s, tz)?.earliest().map(|t| t.with_timezone(&Utc))
}

/// Like `local_hour_to_utc`, but a repeated fall-back hour resolves to its
/// second occurrence so an inclusive range end covers both
pub fn local_hour_end_to_utc(s: &str, tz: Tz) -> Option<DateTime<Utc>> {
    parse_local_hour(s, tz)?.latest().map(|t| t.with_timezone(&Utc))
}
