//! Lightweight cron expression evaluator.
//! Supports: "MIN HOUR DOM MON DOW" (5-field) and "SEC MIN HOUR DOM MON DOW" (6-field)
//! Fields: *, ?, N, a-b, a-b/N, */N, comma lists, JAN-DEC and SUN-SAT names
//! Example: "0 8 * * *" = every day at 8:00
//!
//! Pure functions only, evaluated in UTC. No cron crate dependency.

use cadence_core::error::{CadenceError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

/// Upper bound on how far ahead a fire time is searched for.
const SEARCH_YEARS: i32 = 5;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq)]
pub struct CronSchedule {
    seconds: Vec<u32>,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
    has_seconds: bool,
}

impl CronSchedule {
    /// Parse a 5- or 6-field expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        let (sec_spec, rest) = match parts.len() {
            5 => ("0", &parts[..]),
            6 => (parts[0], &parts[1..]),
            n => {
                return Err(CadenceError::Cron(format!(
                    "'{expression}' has {n} fields (need 5: MIN HOUR DOM MON DOW, or 6 with leading SEC)"
                )));
            }
        };

        let field = |spec: &str, min: u32, max: u32, names: &[&str], label: &str| {
            parse_field(spec, min, max, names).ok_or_else(|| {
                CadenceError::Cron(format!("invalid {label} field '{spec}' in '{expression}'"))
            })
        };

        let mut days_of_week = field(rest[4], 0, 7, &DAY_NAMES, "day-of-week")?;
        // 7 is an alias for Sunday.
        if days_of_week.contains(&7) {
            days_of_week.retain(|d| *d != 7);
            if !days_of_week.contains(&0) {
                days_of_week.insert(0, 0);
            }
        }

        Ok(Self {
            seconds: field(sec_spec, 0, 59, &[], "second")?,
            minutes: field(rest[0], 0, 59, &[], "minute")?,
            hours: field(rest[1], 0, 23, &[], "hour")?,
            days_of_month: field(rest[2], 1, 31, &[], "day-of-month")?,
            months: field(rest[3], 1, 12, &MONTH_NAMES, "month")?,
            days_of_week,
            dom_restricted: !is_wildcard(rest[2]),
            dow_restricted: !is_wildcard(rest[4]),
            has_seconds: parts.len() == 6,
        })
    }

    pub fn has_seconds(&self) -> bool {
        self.has_seconds
    }

    /// The first fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_nanosecond(0)? + Duration::seconds(1);
        let limit_year = after.year() + SEARCH_YEARS;

        while t.year() <= limit_year {
            if !self.months.contains(&t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_day(t)? + Duration::days(1);
                continue;
            }
            if !self.hours.contains(&t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&t.minute()) {
                t = t.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(&t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    /// Up to `count` upcoming fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        while times.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    times.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        times
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(&t.day());
        let dow = self
            .days_of_week
            .contains(&t.weekday().num_days_from_sunday());
        // Standard cron: when both day fields are restricted, either may match.
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

/// Parse `expression` and compute up to `count` fire times after `after`.
pub fn next_fire_times(
    expression: &str,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    Ok(CronSchedule::parse(expression)?.upcoming(after, count))
}

/// Recurring templates accept 5-field expressions only.
pub fn validate_schedule(expression: &str) -> Result<CronSchedule> {
    let schedule = CronSchedule::parse(expression)?;
    if schedule.has_seconds() {
        return Err(CadenceError::Cron(format!(
            "'{expression}': recurring events use 5-field expressions"
        )));
    }
    Ok(schedule)
}

fn is_wildcard(spec: &str) -> bool {
    spec == "*" || spec == "?"
}

fn start_of_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    t.with_hour(0)?.with_minute(0)?.with_second(0)
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

/// Parse a cron field into a sorted list of matching values.
fn parse_field(field: &str, min: u32, max: u32, names: &[&str]) -> Option<Vec<u32>> {
    let mut values = Vec::new();
    for part in field.split(',') {
        values.extend(parse_part(part.trim(), min, max, names)?);
    }
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    values.dedup();
    Some(values)
}

fn parse_part(part: &str, min: u32, max: u32, names: &[&str]) -> Option<Vec<u32>> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let n: u32 = step.parse().ok()?;
            if n == 0 {
                return None;
            }
            (range, n)
        }
        None => (part, 1),
    };

    let (lo, hi) = if is_wildcard(range) {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        (parse_value(a, min, names)?, parse_value(b, min, names)?)
    } else {
        let v = parse_value(range, min, names)?;
        // "N/step" means from N to the end of the range.
        if step > 1 { (v, max) } else { (v, v) }
    };

    if lo < min || hi > max || lo > hi {
        return None;
    }
    Some((lo..=hi).step_by(step as usize).collect())
}

fn parse_value(s: &str, min: u32, names: &[&str]) -> Option<u32> {
    if let Ok(n) = s.parse() {
        return Some(n);
    }
    let upper = s.to_ascii_uppercase();
    names
        .iter()
        .position(|name| *name == upper)
        .map(|i| i as u32 + min)
}
