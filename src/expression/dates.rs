//! Date math for the transformer.
//!
//! `calc_date_range` is the single source of truth for intelligent
//! dates: a pure function of (offset, unit, today). The conversion
//! helpers handle end-of-day coercion, and `parse_human_date` accepts
//! the common human date spellings used in field texts.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::GrammarError;

/// prior|last|previous → −1, current|this → 0, next → +1.
fn parse_offset(offset: &str) -> Result<i32, GrammarError> {
    match offset.to_lowercase().as_str() {
        "prior" | "last" | "previous" => Ok(-1),
        "current" | "this" => Ok(0),
        "next" => Ok(1),
        other => Err(GrammarError::message(format!(
            "'{other}' is not a valid intelligent date offset"
        ))),
    }
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid calendar date")
}

/// A date shifted by whole months, day clamped to the target month.
fn shift_months(today: NaiveDate, months: i32) -> (i32, u32) {
    let total = today.year() * 12 + today.month0() as i32 + months;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;
    (year, month)
}

/// Compute the [start, end] date pair for an intelligent date
/// expression like `IS prior year` evaluated on `today`.
pub fn calc_date_range(
    offset: &str,
    unit: &str,
    today: NaiveDate,
) -> Result<(NaiveDate, NaiveDate), GrammarError> {
    let o = parse_offset(offset)?;
    match unit.to_lowercase().as_str() {
        "year" => {
            let year = today.year() + o;
            Ok((ymd(year, 1, 1), ymd(year, 12, 31)))
        }
        "ytd" => {
            let year = today.year() + o;
            let day = today.day().min(days_in_month(year, today.month()));
            Ok((ymd(year, 1, 1), ymd(year, today.month(), day)))
        }
        "qtr" => {
            let quarter0 = today.month0() / 3;
            let total = today.year() * 4 + quarter0 as i32 + o;
            let year = total.div_euclid(4);
            let quarter0 = total.rem_euclid(4) as u32;
            let start_month = quarter0 * 3 + 1;
            let end_month = start_month + 2;
            Ok((
                ymd(year, start_month, 1),
                ymd(year, end_month, days_in_month(year, end_month)),
            ))
        }
        "month" => {
            let (year, month) = shift_months(today, o);
            Ok((ymd(year, month, 1), ymd(year, month, days_in_month(year, month))))
        }
        "mtd" => {
            let (year, month) = shift_months(today, o);
            let day = today.day().min(days_in_month(year, month));
            Ok((ymd(year, month, 1), ymd(year, month, day)))
        }
        "day" => {
            let day = today + Duration::days(o as i64);
            Ok((day, day))
        }
        other => Err(GrammarError::message(format!(
            "'{other}' is not a valid intelligent date unit"
        ))),
    }
}

/// The first moment of a date's day.
pub fn convert_to_start_datetime(d: NaiveDate) -> NaiveDateTime {
    d.and_hms_opt(0, 0, 0).expect("midnight exists")
}

/// The last representable moment of a date's day.
pub fn convert_to_end_datetime(d: NaiveDate) -> NaiveDateTime {
    d.and_time(NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).expect("valid time"))
}

/// End-of-day coercion for BETWEEN upper bounds: a datetime at the
/// first moment of its day becomes the last moment of that day;
/// anything else passes through.
pub fn convert_to_eod_datetime(dt: NaiveDateTime) -> NaiveDateTime {
    if dt.time() == NaiveTime::from_hms_opt(0, 0, 0).expect("midnight exists") {
        convert_to_end_datetime(dt.date())
    } else {
        dt
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y%m%d",
    "%m/%d/%Y",
    "%b %d %Y",
    "%b %d, %Y",
    "%B %d %Y",
    "%B %d, %Y",
    "%d %b %Y",
    "%d %B %Y",
];

/// Parse a human date string into a datetime. Date-only spellings
/// resolve to midnight. Returns `None` when nothing matches.
pub fn parse_human_date(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            return Some(convert_to_start_datetime(d));
        }
    }
    None
}
