//! Calendar-date normalization for natural keys.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::models::SqlValue;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Normalize a stored date to `YYYY-MM-DD`.
///
/// Accepts epoch seconds (up to 10 digits) and epoch milliseconds (13 digits)
/// as integers or numeric strings, RFC 3339 timestamps, and `YYYY-MM-DD`
/// prefixed date-time text. Returns `None` for anything else.
pub fn normalize_date(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Integer(number) => from_epoch(*number),
        SqlValue::Real(number) if number.fract() == 0.0 => {
            #[allow(clippy::cast_possible_truncation)]
            let whole = *number as i64;
            from_epoch(whole)
        }
        SqlValue::Text(text) => normalize_date_text(text),
        _ => None,
    }
}

pub fn normalize_date_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
        return trimmed.parse::<i64>().ok().and_then(from_epoch);
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(format_date(date));
    }
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(format_date(timestamp.date_naive()));
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|datetime| format_date(datetime.date()))
}

fn from_epoch(number: i64) -> Option<String> {
    let digits = number.unsigned_abs().checked_ilog10().map_or(1, |log| log + 1);
    let timestamp = match digits {
        0..=10 => DateTime::from_timestamp(number, 0),
        13 => DateTime::from_timestamp_millis(number),
        _ => None,
    }?;
    Some(format_date(timestamp.date_naive()))
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
