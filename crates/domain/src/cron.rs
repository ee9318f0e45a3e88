//! 5-field cron evaluator (min hour dom month dow), UTC.
//!
//! Schedule triggers are stored and compared as UTC instants, so the
//! evaluator works directly on naive UTC time.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use crate::error::{Error, Result};

/// Parse a cron field and check if a value matches.
fn field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    // Handle */N (every N)
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    // Handle comma-separated values
    for part in field.split(',') {
        // Handle range N-M
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

fn field_is_well_formed(field: &str) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        return step.parse::<u32>().is_ok_and(|n| n > 0);
    }
    field.split(',').all(|part| match part.split_once('-') {
        Some((start, end)) => start.parse::<u32>().is_ok() && end.parse::<u32>().is_ok(),
        None => part.parse::<u32>().is_ok(),
    })
}

/// Reject expressions the evaluator cannot fire on.
pub fn validate(cron: &str) -> Result<()> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::Validation(format!(
            "cron expression must have 5 fields, got {}: {cron:?}",
            fields.len()
        )));
    }
    if !fields.iter().all(|f| field_is_well_formed(f)) {
        return Err(Error::Validation(format!("malformed cron field in {cron:?}")));
    }
    Ok(())
}

/// Check if a UTC instant matches a 5-field cron expression.
pub fn matches(cron: &str, at: &DateTime<Utc>) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    field_matches(fields[0], at.minute())
        && field_matches(fields[1], at.hour())
        && field_matches(fields[2], at.day())
        && field_matches(fields[3], at.month())
        && field_matches(fields[4], at.weekday().num_days_from_sunday())
}

/// Next occurrence strictly after `after`, searched minute-by-minute and
/// bounded at one year.
pub fn next_occurrence(cron: &str, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    // Advance to the next whole minute.
    let step_secs = 60 - i64::from(after.second());
    let mut candidate = (*after + Duration::seconds(step_secs))
        .with_second(0)
        .unwrap_or(*after)
        .with_nanosecond(0)
        .unwrap_or(*after);

    let max_checks = 366 * 24 * 60; // one year of minutes
    for _ in 0..max_checks {
        if matches(cron, &candidate) {
            return Some(candidate);
        }
        candidate += Duration::minutes(1);
    }
    None
}
