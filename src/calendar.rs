//! Conversions between calendar dates and decimal years.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

const SECS_PER_DAY: f64 = 86_400.0;

fn days_in_year(year: i32) -> f64 {
    if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
        366.0
    } else {
        365.0
    }
}

/// Decimal year of a date and time, accounting for leap years.
pub fn decimal_year(datetime: NaiveDateTime) -> f64 {
    let year = datetime.year();
    let day = datetime.ordinal0() as f64
        + datetime.time().num_seconds_from_midnight() as f64 / SECS_PER_DAY;
    year as f64 + day / days_in_year(year)
}

/// Parse `text` with a chrono format, either as a date and time or as a date.
pub fn parse_date(text: &str, format: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    NaiveDateTime::parse_from_str(text, format).ok().or_else(|| {
        NaiveDate::parse_from_str(text, format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
    })
}

/// Calendar year and month (1-12) containing a decimal year.
pub fn month_of(time: f64) -> Option<(i32, u32)> {
    if !time.is_finite() {
        return None;
    }
    let year = time.floor();
    let n_days = days_in_year(year as i32);
    // Nearest second, so day boundaries are exact.
    let secs = ((time - year) * n_days * SECS_PER_DAY).round();
    let day0 = ((secs / SECS_PER_DAY).floor() as u32).min(n_days as u32 - 1);
    let date = NaiveDate::from_yo_opt(year as i32, day0 + 1)?;
    Some((date.year(), date.month()))
}

/// Decimal year of the midpoint of a calendar month.
pub fn month_midpoint(year: i32, month: u32) -> Option<f64> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let n_days = (next - first).num_days() as f64;
    Some(year as f64 + (first.ordinal0() as f64 + n_days / 2.0) / days_in_year(year))
}
