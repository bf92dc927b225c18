//! Strict 5-field cron expressions and schedule time zones.
//!
//! Accepted grammar per field: `*`, a number, a range `a-b`, a list of
//! numbers or ranges `a,b-c`, or a step `*/n`. Fields are expanded to
//! explicit value sets and handed to the `cron` crate (which wants a seconds
//! field and its own day-of-week numbering) for next-fire computation.
//! Day-of-month and day-of-week restrictions must both match.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Local, Utc};
use cron::Schedule as CronSchedule;

use super::ScheduleError;

struct Field {
    name: &'static str,
    min: u32,
    max: u32,
}

const FIELDS: [Field; 5] = [
    Field { name: "minute", min: 0, max: 59 },
    Field { name: "hour", min: 0, max: 23 },
    Field { name: "day-of-month", min: 1, max: 31 },
    Field { name: "month", min: 1, max: 12 },
    Field { name: "day-of-week", min: 0, max: 7 },
];

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A validated 5-field cron expression.
#[derive(Clone)]
pub struct CronExpr {
    source: String,
    schedule: CronSchedule,
}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpr").field(&self.source).finish()
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };

        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != FIELDS.len() {
            return Err(invalid(format!(
                "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                parts.len()
            )));
        }

        let mut rendered = Vec::with_capacity(FIELDS.len() + 1);
        rendered.push("0".to_string());
        for (i, (part, field)) in parts.iter().zip(FIELDS.iter()).enumerate() {
            let values = expand_field(part, field).map_err(invalid)?;
            let text = if *part == "*" {
                "*".to_string()
            } else if i == 4 {
                render_days(&values)
            } else {
                join(values.iter())
            };
            rendered.push(text);
        }

        let schedule = CronSchedule::from_str(&rendered.join(" "))
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            source: parts.join(" "),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First firing instant strictly after `after`, evaluated in `tz`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: ScheduleTz) -> Option<DateTime<Utc>> {
        match tz {
            ScheduleTz::Utc => self.schedule.after(&after).next(),
            ScheduleTz::Local => self
                .schedule
                .after(&after.with_timezone(&Local))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            ScheduleTz::Fixed(offset) => self
                .schedule
                .after(&after.with_timezone(&offset))
                .next()
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    /// Firing instants in `(from, until]`.
    pub fn fires_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        tz: ScheduleTz,
    ) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        let mut cursor = from;
        while let Some(next) = self.next_after(cursor, tz) {
            if next > until {
                break;
            }
            out.push(next);
            cursor = next;
        }
        out
    }
}

impl FromStr for CronExpr {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn expand_field(text: &str, field: &Field) -> Result<BTreeSet<u32>, String> {
    let out_of_range = |v: u32| {
        format!(
            "{} value {v} outside {}-{}",
            field.name, field.min, field.max
        )
    };
    let number = |s: &str| -> Result<u32, String> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("{} field: '{s}' is not a number", field.name));
        }
        let v: u32 = s
            .parse()
            .map_err(|_| format!("{} field: '{s}' is not a number", field.name))?;
        if v < field.min || v > field.max {
            return Err(out_of_range(v));
        }
        Ok(v)
    };

    if text == "*" {
        return Ok((field.min..=field.max).collect());
    }

    if let Some(step) = text.strip_prefix("*/") {
        if step.is_empty() || !step.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("{} field: bad step '{text}'", field.name));
        }
        let n: u32 = step
            .parse()
            .map_err(|_| format!("{} field: bad step '{text}'", field.name))?;
        if n == 0 || n > field.max - field.min + 1 {
            return Err(format!("{} field: step {n} out of range", field.name));
        }
        return Ok((field.min..=field.max).step_by(n as usize).collect());
    }

    let mut values = BTreeSet::new();
    for item in text.split(',') {
        match item.split_once('-') {
            Some((a, b)) => {
                let (lo, hi) = (number(a)?, number(b)?);
                if lo > hi {
                    return Err(format!("{} field: range {lo}-{hi} is reversed", field.name));
                }
                values.extend(lo..=hi);
            }
            None => {
                values.insert(number(item)?);
            }
        }
    }
    Ok(values)
}

fn render_days(values: &BTreeSet<u32>) -> String {
    let days: BTreeSet<u32> = values.iter().map(|d| d % 7).collect();
    if days.len() == 7 {
        return "*".to_string();
    }
    days.iter()
        .map(|d| DAY_NAMES[*d as usize])
        .collect::<Vec<_>>()
        .join(",")
}

fn join<'a>(values: impl Iterator<Item = &'a u32>) -> String {
    values.map(u32::to_string).collect::<Vec<_>>().join(",")
}

/// Time zone a schedule's fields are evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleTz {
    Utc,
    Local,
    Fixed(FixedOffset),
}

impl ScheduleTz {
    /// `"local"`, `"utc"`, or a fixed offset such as `"+08:00"` / `"-0530"`.
    pub fn parse(text: &str) -> Result<Self, ScheduleError> {
        let invalid = || ScheduleError::InvalidTimezone(text.to_string());
        let t = text.trim();
        match t.to_ascii_lowercase().as_str() {
            "" | "local" => return Ok(Self::Local),
            "utc" | "z" => return Ok(Self::Utc),
            _ => {}
        }

        let (sign, rest) = match t.as_bytes()[0] {
            b'+' => (1, &t[1..]),
            b'-' => (-1, &t[1..]),
            _ => return Err(invalid()),
        };
        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
        let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
        if hours > 14 || minutes > 59 {
            return Err(invalid());
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(Self::Fixed)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for ScheduleTz {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleTz::Utc => write!(f, "utc"),
            ScheduleTz::Local => write!(f, "local"),
            ScheduleTz::Fixed(offset) => write!(f, "{offset}"),
        }
    }
}
