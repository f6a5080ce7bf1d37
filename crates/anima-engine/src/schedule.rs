//! Wake-tick computation.
//!
//! Pure functions deciding when a project should next move out of
//! `sleeping`. Interval schedules measure from the *completion* of the last
//! check so a slow check cannot cause runaway ticking. Fixed-times schedules
//! re-derive the day's remaining ticks on every call, which also keeps them
//! correct across daylight-saving transitions.

use chrono::{DateTime, Duration, TimeZone, Utc};

use anima_types::{parse_hhmm, WakeSchedule};

/// When the next scheduled tick is due, or `None` for manual projects.
pub fn next_wake(
    schedule: &WakeSchedule,
    now: DateTime<Utc>,
    last_check_completed: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match schedule {
        WakeSchedule::Interval { interval_minutes } => {
            let base = last_check_completed.unwrap_or(now);
            Some(base + Duration::minutes(i64::from(*interval_minutes)))
        }
        WakeSchedule::Times { times } => next_time_of_day(times, now),
        WakeSchedule::Manual => None,
    }
}

/// The earliest upcoming occurrence among "HH:MM" entries, today or
/// tomorrow. Invalid entries are skipped (config validation reports them).
fn next_time_of_day(times: &[String], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut best: Option<DateTime<Utc>> = None;

    for entry in times {
        let Ok((hour, minute)) = parse_hhmm(entry) else {
            continue;
        };
        let today = now
            .date_naive()
            .and_hms_opt(u32::from(hour), u32::from(minute), 0)?;
        let mut candidate = Utc.from_utc_datetime(&today);
        if candidate <= now {
            let tomorrow = now
                .date_naive()
                .succ_opt()?
                .and_hms_opt(u32::from(hour), u32::from(minute), 0)?;
            candidate = Utc.from_utc_datetime(&tomorrow);
        }
        best = Some(match best {
            Some(current) if current <= candidate => current,
            _ => candidate,
        });
    }

    best
}
