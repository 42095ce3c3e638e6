//! Calendar-day boundaries in an explicit timezone.
//!
//! A day runs from local `00:00:00.000` to local `23:59:59.999`, i.e. one
//! millisecond before the next local midnight. Computing the end from the next
//! midnight keeps 23- and 25-hour DST days correct.

use chrono::{DateTime, Days, LocalResult, NaiveDate, TimeZone};
use chrono_tz::Tz;

use crate::model::Ms;

/// Inclusive bounds of one calendar day, in unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayBounds {
    pub start: Ms,
    /// Inclusive: `next_midnight - 1`.
    pub end: Ms,
}

impl DayBounds {
    /// Bounds of the local day containing `instant`.
    pub fn containing(instant: Ms, tz: Tz) -> Option<Self> {
        let local = DateTime::from_timestamp_millis(instant)?.with_timezone(&tz);
        Self::of_date(local.date_naive(), tz)
    }

    /// Bounds of a local calendar date.
    pub fn of_date(date: NaiveDate, tz: Tz) -> Option<Self> {
        let start = local_midnight(date, tz)?;
        let next = local_midnight(date.checked_add_days(Days::new(1))?, tz)?;
        Some(Self {
            start,
            end: next - 1,
        })
    }
}

/// First instant of `date` in `tz`. Midnight can be ambiguous (take the
/// earlier) or skipped by a DST jump (take the first valid instant after it).
fn local_midnight(date: NaiveDate, tz: Tz) -> Option<Ms> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    match tz.from_local_datetime(&midnight) {
        LocalResult::Single(dt) => Some(dt.timestamp_millis()),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.timestamp_millis()),
        LocalResult::None => {
            // Gaps are at most a few hours; step forward minute by minute.
            (1..=24 * 60).find_map(|minutes| {
                let candidate = midnight + chrono::Duration::minutes(minutes);
                tz.from_local_datetime(&candidate)
                    .earliest()
                    .map(|dt| dt.timestamp_millis())
            })
        }
    }
}

/// Parse an IANA timezone name such as `Europe/Berlin`.
pub fn parse_timezone(name: &str) -> Result<Tz, String> {
    name.parse::<Tz>()
        .map_err(|e| format!("unknown timezone {name:?}: {e}"))
}
