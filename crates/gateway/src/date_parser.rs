#![forbid(unsafe_code)]

//! Relative date ranges (`last 6 hours`, `this quarter`, `from 2024-01-01 to yesterday`)
//! resolved against the current time in a query timezone.

use crate::ApiError;
use chrono::{Datelike, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;

/// Local timestamp with millisecond precision and no offset.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeUnit {
    /// Accepts singular and plural names.
    pub fn parse(raw: &str) -> Option<Self> {
        let unit = raw.strip_suffix('s').unwrap_or(raw);
        Some(match unit {
            "second" => Self::Second,
            "minute" => Self::Minute,
            "hour" => Self::Hour,
            "day" => Self::Day,
            "week" => Self::Week,
            "month" => Self::Month,
            "quarter" => Self::Quarter,
            "year" => Self::Year,
            _ => return None,
        })
    }

    /// Exact singular name, as used for query granularities.
    pub fn from_granularity(raw: &str) -> Option<Self> {
        Self::parse(raw).filter(|unit| unit.as_str() == raw)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Year => "year",
        }
    }

    /// Weeks start on Monday.
    fn start_of(self, at: NaiveDateTime) -> Option<NaiveDateTime> {
        let date = at.date();
        let midnight = |date: NaiveDate| date.and_time(NaiveTime::MIN);
        match self {
            Self::Second => at.with_nanosecond(0),
            Self::Minute => at.with_nanosecond(0)?.with_second(0),
            Self::Hour => at.with_nanosecond(0)?.with_second(0)?.with_minute(0),
            Self::Day => Some(midnight(date)),
            Self::Week => {
                let back = i64::from(date.weekday().num_days_from_monday());
                date.checked_sub_signed(TimeDelta::days(back)).map(midnight)
            }
            Self::Month => date.with_day(1).map(midnight),
            Self::Quarter => {
                let first_month = (date.month0() / 3) * 3 + 1;
                NaiveDate::from_ymd_opt(date.year(), first_month, 1).map(midnight)
            }
            Self::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).map(midnight),
        }
    }

    fn end_of(self, at: NaiveDateTime) -> Option<NaiveDateTime> {
        let next = self.shift(self.start_of(at)?, 1)?;
        next.checked_sub_signed(TimeDelta::milliseconds(1))
    }

    fn shift(self, at: NaiveDateTime, amount: i64) -> Option<NaiveDateTime> {
        let fixed = |delta: fn(i64) -> Option<TimeDelta>| at.checked_add_signed(delta(amount)?);
        let months = |per_unit: i64| {
            let total = u32::try_from(amount.checked_mul(per_unit)?.unsigned_abs()).ok()?;
            if amount >= 0 {
                at.checked_add_months(Months::new(total))
            } else {
                at.checked_sub_months(Months::new(total))
            }
        };
        match self {
            Self::Second => fixed(TimeDelta::try_seconds),
            Self::Minute => fixed(TimeDelta::try_minutes),
            Self::Hour => fixed(TimeDelta::try_hours),
            Self::Day => fixed(TimeDelta::try_days),
            Self::Week => fixed(TimeDelta::try_weeks),
            Self::Month => months(1),
            Self::Quarter => months(3),
            Self::Year => months(12),
        }
    }
}

pub fn parse_timezone(timezone: &str) -> Result<Tz, ApiError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| ApiError::user(format!("Unknown timezone: '{timezone}'")))
}

pub fn format_date_time(at: NaiveDateTime) -> String {
    at.format(DATE_TIME_FORMAT).to_string()
}

/// Resolves `input` to an inclusive `[start, end]` pair of local timestamps in `timezone`.
pub fn parse_date_range(input: &str, timezone: &str) -> Result<[String; 2], ApiError> {
    let tz = parse_timezone(timezone)?;
    let now = Utc::now().with_timezone(&tz).naive_local();
    let (start, end) = parse_date_range_at(input, now)?;
    Ok([format_date_time(start), format_date_time(end)])
}

pub fn parse_date_range_at(
    input: &str,
    now: NaiveDateTime,
) -> Result<(NaiveDateTime, NaiveDateTime), ApiError> {
    let lowered = input.trim().to_lowercase();
    let unparsable = || ApiError::user(format!("Can't parse date: '{input}'"));
    let tokens = lowered.split_whitespace().collect::<Vec<_>>();

    let range = match tokens.as_slice() {
        ["this", unit] => TimeUnit::parse(unit).and_then(|unit| unit_range(unit, now)),
        ["last", unit] => TimeUnit::parse(unit).and_then(|unit| {
            let previous = unit.shift(now, -1)?;
            unit_range(unit, previous)
        }),
        ["last", count, unit] => match (count.parse::<u32>(), TimeUnit::parse(unit)) {
            (Ok(count), Some(unit)) if count > 0 => {
                let start = unit
                    .shift(now, -i64::from(count))
                    .and_then(|at| unit.start_of(at));
                let end = unit.shift(now, -1).and_then(|at| unit.end_of(at));
                start.zip(end)
            }
            _ => None,
        },
        ["from", ..] => lowered
            .strip_prefix("from ")
            .and_then(|rest| rest.split_once(" to "))
            .and_then(|(from, to)| {
                let (start, _) = parse_point(from.trim(), now)?;
                let (_, end) = parse_point(to.trim(), now)?;
                Some((start, end))
            }),
        _ => parse_point(&lowered, now),
    };

    match range {
        Some((start, end)) if start <= end => Ok((start, end)),
        _ => Err(unparsable()),
    }
}

fn unit_range(unit: TimeUnit, at: NaiveDateTime) -> Option<(NaiveDateTime, NaiveDateTime)> {
    unit.start_of(at).zip(unit.end_of(at))
}

/// A single date expression and the span it covers: a whole day for dates, an instant otherwise.
fn parse_point(text: &str, now: NaiveDateTime) -> Option<(NaiveDateTime, NaiveDateTime)> {
    match text {
        "now" => return Some((now, now)),
        "today" => return unit_range(TimeUnit::Day, now),
        "yesterday" => return unit_range(TimeUnit::Day, TimeUnit::Day.shift(now, -1)?),
        "tomorrow" => return unit_range(TimeUnit::Day, TimeUnit::Day.shift(now, 1)?),
        _ => {}
    }

    if let [count, unit, "ago"] = text.split_whitespace().collect::<Vec<_>>().as_slice() {
        let count = count.parse::<i64>().ok()?;
        let at = TimeUnit::parse(unit)?.shift(now, -count)?;
        return Some((at, at));
    }

    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return unit_range(TimeUnit::Day, date.and_time(NaiveTime::MIN));
    }
    let upper = text.to_uppercase();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&upper, format).ok())
        .map(|at| (at, at))
}
