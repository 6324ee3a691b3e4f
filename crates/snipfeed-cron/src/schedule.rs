//! Five-field cron expressions: validation and next-fire computation.
//!
//! Fields are `minute hour day-of-month month day-of-week`, evaluated in UTC.
//! Each field is expanded to an explicit value set before it is handed to the
//! `cron` crate, so the crate never sees syntax it interprets differently
//! (day-of-week numbering, point steps, names).
//!
//! Day-of-month and day-of-week follow classic cron rules: when both are
//! restricted and neither starts with `*`, a day matches if *either* matches.
//! Otherwise both must match, so `*/2` in either field still narrows days.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Longest possible length of each month (February in a leap year).
const MONTH_LENGTHS: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Names accepted in place of numbers; index 0 maps to `name_base`.
    names: &'static [&'static str],
    name_base: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    name_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    name_base: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    name_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    name_base: 1,
};
// 7 is accepted as an alias for Sunday.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: DAY_NAMES,
    name_base: 0,
};

const FIELDS: [&FieldSpec; 5] = [&MINUTE, &HOUR, &DAY_OF_MONTH, &MONTH, &DAY_OF_WEEK];

/// One expanded field. `None` means the field was a bare `*`.
type FieldValues = Option<BTreeSet<u32>>;

/// Check a cron expression, returning every problem found.
pub fn validate(expr: &str) -> Result<(), Vec<String>> {
    parse_fields(expr).map(|_| ())
}

/// A validated cron expression able to compute upcoming fire times.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    /// One schedule, or two when day-of-month and day-of-week are both
    /// restricted (the next fire time is the earlier of the two).
    schedules: Vec<Schedule>,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, Vec<String>> {
        let fields = parse_fields(expr)?;
        let [minute, hour, dom, month, dow] = fields;
        let starred: Vec<bool> = expr
            .split_whitespace()
            .map(|field| field.starts_with('*'))
            .collect();
        let either_day_starred = starred[2] || starred[4];

        let dow = dow.map(|days| days.into_iter().map(|d| d % 7).collect::<BTreeSet<_>>());
        let any: FieldValues = None;
        let variants: Vec<(&FieldValues, &FieldValues)> = match (&dom, &dow) {
            (Some(_), Some(_)) if !either_day_starred => vec![(&dom, &any), (&any, &dow)],
            _ => vec![(&dom, &dow)],
        };

        let mut schedules = Vec::with_capacity(variants.len());
        for (dom, dow) in variants {
            // The cron crate numbers weekdays 1-7 starting on Sunday.
            let dow = dow
                .as_ref()
                .map(|days| days.iter().map(|d| d + 1).collect::<BTreeSet<_>>());
            let six_field = format!(
                "0 {} {} {} {} {}",
                render(&minute),
                render(&hour),
                render(dom),
                render(&month),
                render(&dow),
            );
            let schedule = Schedule::from_str(&six_field)
                .map_err(|e| vec![format!("unsupported expression: {e}")])?;
            schedules.push(schedule);
        }

        let parsed = Self {
            expression: normalize(expr),
            schedules,
        };
        if parsed.next_after(&Utc::now()).is_none() {
            return Err(vec!["expression has no upcoming fire time".to_string()]);
        }
        Ok(parsed)
    }

    /// Schedule from a raw six-field (seconds-first) `cron` crate expression.
    #[cfg(test)]
    pub(crate) fn with_seconds(expr: &str) -> Self {
        Self {
            expression: expr.to_string(),
            schedules: vec![Schedule::from_str(expr).unwrap()],
        }
    }

    /// The expression with whitespace normalized.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|s| s.after(after).next())
            .min()
    }

    /// First fire time strictly after now.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.next_after(&Utc::now())
    }
}

/// Next fire time for `expr` after `after`, or `None` if it does not parse.
pub fn next_run_after(expr: &str, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    CronSchedule::parse(expr).ok()?.next_after(after)
}

/// Short human description of common expression shapes.
pub fn describe(expr: &str) -> String {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    let step = |field: &str| field.strip_prefix("*/").and_then(|n| n.parse::<u32>().ok());
    match parts.as_slice() {
        ["*", "*", "*", "*", "*"] => "every minute".to_string(),
        [m, "*", "*", "*", "*"] if step(m).is_some() => {
            format!("every {} minutes", step(m).unwrap_or_default())
        }
        ["0", "*", "*", "*", "*"] => "hourly".to_string(),
        ["0", h, "*", "*", "*"] if step(h).is_some() => {
            format!("every {} hours", step(h).unwrap_or_default())
        }
        [m, h, "*", "*", "*"] => match (m.parse::<u32>(), h.parse::<u32>()) {
            (Ok(m), Ok(h)) => format!("daily at {h:02}:{m:02} UTC"),
            _ => format!("cron '{}'", normalize(expr)),
        },
        _ => format!("cron '{}'", normalize(expr)),
    }
}

fn normalize(expr: &str) -> String {
    expr.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn render(values: &FieldValues) -> String {
    match values {
        None => "*".to_string(),
        Some(set) => set
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(","),
    }
}

fn parse_fields(expr: &str) -> Result<[FieldValues; 5], Vec<String>> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.is_empty() {
        return Err(vec!["expression is empty".to_string()]);
    }
    if parts.len() != 5 {
        return Err(vec![format!(
            "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
            parts.len()
        )]);
    }

    let mut reasons = Vec::new();
    let mut fields: [FieldValues; 5] = Default::default();
    for (i, (field, text)) in FIELDS.iter().zip(&parts).enumerate() {
        match parse_field(field, text) {
            Ok(values) => fields[i] = values,
            Err(mut errs) => reasons.append(&mut errs),
        }
    }

    if reasons.is_empty() {
        check_reachable_days(&fields, &mut reasons);
    }

    if reasons.is_empty() {
        Ok(fields)
    } else {
        Err(reasons)
    }
}

/// With an unrestricted weekday, the chosen days of month must exist in at
/// least one chosen month (e.g. `0 0 31 2 *` never fires).
fn check_reachable_days(fields: &[FieldValues; 5], reasons: &mut Vec<String>) {
    let (Some(days), None) = (&fields[2], &fields[4]) else {
        return;
    };
    let Some(&first_day) = days.iter().next() else {
        return;
    };
    let reachable = match &fields[3] {
        None => true,
        Some(months) => months
            .iter()
            .any(|m| MONTH_LENGTHS[(*m - 1) as usize] >= first_day),
    };
    if !reachable {
        reasons.push("day-of-month never occurs in the selected months".to_string());
    }
}

fn parse_field(field: &FieldSpec, text: &str) -> Result<FieldValues, Vec<String>> {
    if text == "*" {
        return Ok(None);
    }

    let mut reasons = Vec::new();
    let mut values = BTreeSet::new();
    for part in text.split(',') {
        match parse_part(field, part) {
            Ok(mut expanded) => values.append(&mut expanded),
            Err(reason) => reasons.push(format!("{}: {reason}", field.name)),
        }
    }

    if reasons.is_empty() {
        Ok(Some(values))
    } else {
        Err(reasons)
    }
}

fn parse_part(field: &FieldSpec, part: &str) -> Result<BTreeSet<u32>, String> {
    if part.is_empty() {
        return Err("empty list element".to_string());
    }

    let (base, step) = match part.split_once('/') {
        Some((base, step_text)) => {
            let step: u32 = step_text
                .parse()
                .map_err(|_| format!("step '{step_text}' is not a number"))?;
            if step == 0 {
                return Err("step must be at least 1".to_string());
            }
            if step > field.max {
                return Err(format!("step {step} exceeds {}", field.max));
            }
            (base, Some(step))
        }
        None => (part, None),
    };

    let (start, end) = if base == "*" {
        (field.min, field.max)
    } else if let Some((lo, hi)) = base.split_once('-') {
        let lo = parse_value(field, lo)?;
        let hi = parse_value(field, hi)?;
        if lo > hi {
            return Err(format!("range {lo}-{hi} is reversed"));
        }
        (lo, hi)
    } else {
        let value = parse_value(field, base)?;
        // `a/n` runs from `a` to the end of the field.
        if step.is_some() {
            (value, field.max)
        } else {
            (value, value)
        }
    };

    let step = step.unwrap_or(1);
    Ok((start..=end).step_by(step as usize).collect())
}

fn parse_value(field: &FieldSpec, text: &str) -> Result<u32, String> {
    if let Ok(n) = text.parse::<u32>() {
        if n < field.min || n > field.max {
            return Err(format!(
                "value {n} out of range {}-{}",
                field.min, field.max
            ));
        }
        return Ok(n);
    }
    let upper = text.to_ascii_uppercase();
    field.names
        .iter()
        .position(|name| *name == upper)
        .map(|i| i as u32 + field.name_base)
        .ok_or_else(|| format!("'{text}' is not a valid value"))
}
