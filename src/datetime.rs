//! DMTF datetime and interval text
//!
//! Datetimes are `yyyymmddHHMMSS.mmmmmmsUUU`: local time, microseconds, then
//! the UTC offset in minutes with its sign. Any field may be `*` filled,
//! meaning "unspecified", and takes its minimum value. Intervals are
//! `ddddddddHHMMSS.mmmmmm:000`.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{Error, Result};

const DMTF_LENGTH: usize = 25;
const MAX_OFFSET_MINUTES: i32 = 999;
const MAX_INTERVAL_DAYS: i64 = 99_999_999;

/// Start of the file-time epoch; servers report it for "never"
pub const UNSET_DATETIME: &str = "16010101000000.000000+000";

fn invalid(text: &str, expected: &str) -> Error {
    Error::invalid_value("dmtf", text, expected)
}

/// Parse one fixed-width numeric field, `*`-filled meaning `default`
fn field(text: &str, start: usize, len: usize, default: u32) -> Result<u32> {
    let raw = text
        .get(start..start + len)
        .ok_or_else(|| invalid(text, "a 25 character DMTF value"))?;
    if raw.bytes().all(|b| b == b'*') {
        return Ok(default);
    }
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(text, "digits or '*' in every field"));
    }
    raw.parse::<u32>()
        .map_err(|_| invalid(text, "digits or '*' in every field"))
}

/// Parse a DMTF datetime. A `***` offset is read as UTC.
pub fn to_datetime(dmtf: &str) -> Result<DateTime<FixedOffset>> {
    if dmtf.len() != DMTF_LENGTH || !dmtf.is_ascii() {
        return Err(invalid(dmtf, "a 25 character DMTF datetime"));
    }

    let year = field(dmtf, 0, 4, 1)?;
    let month = field(dmtf, 4, 2, 1)?;
    let day = field(dmtf, 6, 2, 1)?;
    let hour = field(dmtf, 8, 2, 0)?;
    let minute = field(dmtf, 10, 2, 0)?;
    let second = field(dmtf, 12, 2, 0)?;
    let micros = field(dmtf, 15, 6, 0)?;

    let offset_minutes = if &dmtf[22..25] == "***" {
        0
    } else {
        let magnitude = field(dmtf, 22, 3, 0)? as i32;
        match &dmtf[21..22] {
            "+" => magnitude,
            "-" => -magnitude,
            _ => return Err(invalid(dmtf, "'+' or '-' before the UTC offset")),
        }
    };

    let naive = NaiveDate::from_ymd_opt(year as i32, month, day)
        .and_then(|date| date.and_hms_micro_opt(hour, minute, second, micros))
        .ok_or_else(|| invalid(dmtf, "a valid calendar date and time"))?;
    let offset = FixedOffset::east_opt(offset_minutes * 60)
        .ok_or_else(|| invalid(dmtf, "a UTC offset within a day"))?;

    offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| invalid(dmtf, "an unambiguous local time"))
}

/// Format a datetime. Offsets wider than 999 minutes are written as UTC.
pub fn to_dmtf_datetime<Tz: TimeZone>(value: &DateTime<Tz>) -> String {
    let fixed = value.fixed_offset();
    let offset_minutes = fixed.offset().local_minus_utc() / 60;

    let (local, offset_minutes) = if offset_minutes.abs() > MAX_OFFSET_MINUTES {
        (value.with_timezone(&Utc).fixed_offset(), 0)
    } else {
        (fixed, offset_minutes)
    };

    let sign = if offset_minutes < 0 { '-' } else { '+' };
    format!(
        "{}.{:06}{}{:03}",
        local.format("%Y%m%d%H%M%S"),
        local.nanosecond() % 1_000_000_000 / 1000,
        sign,
        offset_minutes.abs()
    )
}

/// True for the "never happened" sentinel or any year-1601 value
pub fn is_unset(dmtf: &str) -> bool {
    dmtf.starts_with("1601")
}

/// Parse a DMTF interval
pub fn to_duration(interval: &str) -> Result<Duration> {
    if interval.len() != DMTF_LENGTH || !interval.is_ascii() {
        return Err(invalid(interval, "a 25 character DMTF interval"));
    }
    if &interval[21..25] != ":000" || &interval[14..15] != "." {
        return Err(invalid(interval, "an interval ending in ':000'"));
    }

    let days = field(interval, 0, 8, 0)? as i64;
    let hours = field(interval, 8, 2, 0)? as i64;
    let minutes = field(interval, 10, 2, 0)? as i64;
    let seconds = field(interval, 12, 2, 0)? as i64;
    let micros = field(interval, 15, 6, 0)? as i64;

    Ok(Duration::days(days)
        + Duration::hours(hours)
        + Duration::minutes(minutes)
        + Duration::seconds(seconds)
        + Duration::microseconds(micros))
}

/// Format a non-negative duration as a DMTF interval
pub fn to_dmtf_interval(value: Duration) -> Result<String> {
    if value < Duration::zero() || value.num_days() > MAX_INTERVAL_DAYS {
        return Err(Error::invalid_value(
            "interval",
            value,
            "between zero and 99999999 days",
        ));
    }

    let days = value.num_days();
    let rest = value - Duration::days(days);
    let hours = rest.num_hours();
    let rest = rest - Duration::hours(hours);
    let minutes = rest.num_minutes();
    let rest = rest - Duration::minutes(minutes);
    let seconds = rest.num_seconds();
    let rest = rest - Duration::seconds(seconds);
    let micros = rest.num_microseconds().unwrap_or(0);

    Ok(format!(
        "{:08}{:02}{:02}{:02}.{:06}:000",
        days, hours, minutes, seconds, micros
    ))
}
