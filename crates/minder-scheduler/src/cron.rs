//! Minimal 5-field cron expression evaluation, minute resolution.
//!
//! Deliberately linear-scan based: personal-reminder schedules never need
//! sub-minute precision or multi-year lookahead.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

/// Scan bound for next-occurrence searches.
const ONE_YEAR_MINUTES: i64 = 366 * 24 * 60;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("cron expression must have 5 fields")]
    FieldCount,
    #[error("minute: {0}")]
    Minute(FieldError),
    #[error("hour: {0}")]
    Hour(FieldError),
    #[error("day-of-month: {0}")]
    DayOfMonth(FieldError),
    #[error("month: {0}")]
    Month(FieldError),
    #[error("day-of-week: {0}")]
    DayOfWeek(FieldError),
    #[error("no matching cron time found within 1 year")]
    NoMatch,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("invalid step value {0:?}")]
    InvalidStep(String),
    #[error("invalid range {0:?}")]
    InvalidRange(String),
    #[error("range out of bounds {0:?}")]
    RangeOutOfBounds(String),
    #[error("invalid value {0:?}")]
    InvalidValue(String),
    #[error("value out of bounds {0:?}")]
    ValueOutOfBounds(String),
    #[error("no values selected")]
    NoValuesSelected,
}

/// A parsed cron expression: per-field "which values are allowed" masks.
///
/// Day-of-month and day-of-week are a pure conjunction here. Standard cron
/// treats them as OR when both are restricted; this matcher keeps AND so
/// that existing schedules using both fields keep their observed behavior.
pub struct CronMatcher {
    minute: [bool; 60],
    hour: [bool; 24],
    dom: [bool; 32],
    month: [bool; 13],
    dow: [bool; 7],
}

impl CronMatcher {
    /// Parse a 5-field expression (minute, hour, day-of-month, month,
    /// day-of-week). `7` in the day-of-week field is accepted as Sunday.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount);
        }
        let mut m = CronMatcher {
            minute: [false; 60],
            hour: [false; 24],
            dom: [false; 32],
            month: [false; 13],
            dow: [false; 7],
        };
        parse_field(parts[0], 0, 59, &mut m.minute).map_err(CronError::Minute)?;
        parse_field(parts[1], 0, 23, &mut m.hour).map_err(CronError::Hour)?;
        parse_field(parts[2], 1, 31, &mut m.dom).map_err(CronError::DayOfMonth)?;
        parse_field(parts[3], 1, 12, &mut m.month).map_err(CronError::Month)?;
        if let Err(err) = parse_field(parts[4], 0, 6, &mut m.dow) {
            // Retry with 7 substituted for Sunday; keep the original error
            // if the substituted field is still invalid.
            if parts[4].contains('7') {
                let fixed = parts[4].replace('7', "0");
                parse_field(&fixed, 0, 6, &mut m.dow).map_err(|_| CronError::DayOfWeek(err))?;
            } else {
                return Err(CronError::DayOfWeek(err));
            }
        }
        Ok(m)
    }

    /// True iff every calendar field of `t` is allowed by its mask.
    pub fn matches<T: Datelike + Timelike>(&self, t: &T) -> bool {
        let allowed = |mask: &[bool], idx: usize| mask.get(idx).copied().unwrap_or(false);
        allowed(&self.minute, t.minute() as usize)
            && allowed(&self.hour, t.hour() as usize)
            && allowed(&self.dom, t.day() as usize)
            && allowed(&self.month, t.month() as usize)
            && allowed(&self.dow, t.weekday().num_days_from_sunday() as usize)
    }
}

/// Earliest instant strictly after `from` matching `expr`, evaluated
/// minute-by-minute in `tz` and returned in UTC. Fails if no minute within
/// a year matches (e.g. an empty dom/month intersection like Feb 30).
pub fn next_cron(expr: &str, from: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>, CronError> {
    let matcher = CronMatcher::parse(expr)?;
    let mut candidate = truncate_to_minute(from.with_timezone(&tz) + Duration::minutes(1));
    for _ in 0..ONE_YEAR_MINUTES {
        if matcher.matches(&candidate) {
            return Ok(candidate.with_timezone(&Utc));
        }
        candidate = candidate + Duration::minutes(1);
    }
    Err(CronError::NoMatch)
}

fn truncate_to_minute(t: DateTime<Tz>) -> DateTime<Tz> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn parse_field(raw: &str, min: usize, max: usize, out: &mut [bool]) -> Result<(), FieldError> {
    for slot in out.iter_mut() {
        *slot = false;
    }
    if raw.trim() == "*" {
        for slot in out.iter_mut().take(max + 1).skip(min) {
            *slot = true;
        }
        return Ok(());
    }

    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some(step_raw) = part.strip_prefix("*/") {
            let step: usize = step_raw
                .parse()
                .map_err(|_| FieldError::InvalidStep(part.to_string()))?;
            if step == 0 {
                return Err(FieldError::InvalidStep(part.to_string()));
            }
            let mut i = min;
            while i <= max {
                out[i] = true;
                i += step;
            }
            continue;
        }
        if part.contains('-') {
            let Some((start_raw, end_raw)) = part.split_once('-') else {
                return Err(FieldError::InvalidRange(part.to_string()));
            };
            let start: usize = start_raw
                .parse()
                .map_err(|_| FieldError::InvalidRange(part.to_string()))?;
            let end: usize = end_raw
                .parse()
                .map_err(|_| FieldError::InvalidRange(part.to_string()))?;
            if start < min || end > max || start > end {
                return Err(FieldError::RangeOutOfBounds(part.to_string()));
            }
            for slot in out.iter_mut().take(end + 1).skip(start) {
                *slot = true;
            }
            continue;
        }
        let v: usize = part
            .parse()
            .map_err(|_| FieldError::InvalidValue(part.to_string()))?;
        if v < min || v > max {
            return Err(FieldError::ValueOutOfBounds(part.to_string()));
        }
        out[v] = true;
    }

    if !out[min..=max].iter().any(|&b| b) {
        return Err(FieldError::NoValuesSelected);
    }
    Ok(())
}
