/// Window alignment for aggregation timeframes
///
/// Intraday windows are aligned on the reference timezone's wall clock
/// (hours at :00, 4-hour windows at 0/4/8/12/16/20). 4-hour and day windows
/// run between local wall-clock boundaries, so across a DST change they are
/// an hour shorter or longer.
use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{PipelineError, Result};
use crate::types::Timeframe;

/// Start of the window containing `timestamp`
pub fn window_start(timeframe: Timeframe, timestamp: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    let local = timestamp.with_timezone(tz);

    let minutes_into = match timeframe {
        Timeframe::FiveMinute => (local.minute() % 5) as i64,
        Timeframe::OneHour => local.minute() as i64,
        Timeframe::FourHour | Timeframe::OneDay => {
            return local_to_utc(tz, local_boundary(timeframe, local.naive_local()));
        }
    };

    timestamp
        - Duration::minutes(minutes_into)
        - Duration::seconds(local.second() as i64)
        - Duration::nanoseconds(local.nanosecond() as i64)
}

/// Exclusive end of the window starting at `start`
pub fn window_end(timeframe: Timeframe, start: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    match timeframe {
        Timeframe::FourHour | Timeframe::OneDay => {
            let boundary = local_boundary(timeframe, start.with_timezone(tz).naive_local());
            let next = match timeframe {
                Timeframe::FourHour => boundary + Duration::hours(4),
                _ => boundary + Duration::days(1),
            };
            local_to_utc(tz, next)
        }
        other => start + Duration::minutes(other.duration_minutes()),
    }
}

/// Wall-clock boundary at or before `local` for 4h and 1d windows
fn local_boundary(timeframe: Timeframe, local: NaiveDateTime) -> NaiveDateTime {
    let hour = match timeframe {
        Timeframe::FourHour => local.hour() - local.hour() % 4,
        _ => 0,
    };
    local
        .date()
        .and_hms_opt(hour, 0, 0)
        .unwrap_or_else(|| local.date().and_time(NaiveTime::MIN))
}

/// The `count` most recently closed windows before `now`, oldest first
pub fn last_closed_windows(
    timeframe: Timeframe,
    now: DateTime<Utc>,
    tz: &Tz,
    count: usize,
) -> Vec<DateTime<Utc>> {
    let mut windows = Vec::with_capacity(count);
    let mut cursor = window_start(timeframe, now, tz);

    for _ in 0..count {
        cursor = window_start(timeframe, cursor - Duration::seconds(1), tz);
        windows.push(cursor);
    }

    windows.reverse();
    windows
}

/// Every window start intersecting `[start, end)`, oldest first
pub fn windows_between(
    timeframe: Timeframe,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tz: &Tz,
) -> Vec<DateTime<Utc>> {
    let mut windows = Vec::new();
    let mut cursor = window_start(timeframe, start, tz);

    while cursor < end {
        windows.push(cursor);
        cursor = window_end(timeframe, cursor, tz);
    }

    windows
}

/// Parse a fetch period such as "5d", "12h", "30m" or "2w"
pub fn parse_period(period: &str) -> Result<Duration> {
    let period = period.trim();
    let split = period
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| PipelineError::Config(format!("Period missing unit: {}", period)))?;
    let (amount, unit) = period.split_at(split);

    let amount: i64 = amount
        .parse()
        .map_err(|_| PipelineError::Config(format!("Invalid period amount: {}", period)))?;
    if amount <= 0 {
        return Err(PipelineError::Config(format!("Period must be positive: {}", period)));
    }

    match unit {
        "m" | "min" => Ok(Duration::minutes(amount)),
        "h" => Ok(Duration::hours(amount)),
        "d" => Ok(Duration::days(amount)),
        "w" | "wk" => Ok(Duration::weeks(amount)),
        _ => Err(PipelineError::Config(format!("Unknown period unit: {}", period))),
    }
}

fn local_to_utc(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        // Inside a DST gap: the window starts when local time resumes
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}
