use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::error::{Error, Result};

pub fn yyyymmdd(date: &NaiveDate) -> String {
    format!("{:04}{:02}{:02}", date.year(), date.month(), date.day())
}

/// Parse a cycle (model initialisation) time.
///
/// Accepted forms:
/// - `"YYYYMMDDHH"` or `"YYYYMMDD"`
/// - `"YYYY-MM-DD"`, `"YYYY-MM-DD HH:MM"`, `"YYYY-MM-DD HH:MM:SS"`
/// - `"YYYY-MM-DDTHHZ"` (e.g. `2024-01-01T00Z`) and full RFC 3339
pub fn parse_cycle(s: &str) -> Result<DateTime<Utc>> {
    let t = s.trim();

    if t.len() == 10 || t.len() == 8 {
        if t.bytes().all(|b| b.is_ascii_digit()) {
            let hour: u32 = if t.len() == 10 {
                t[8..10].parse().map_err(|_| bad_cycle(t))?
            } else {
                0
            };
            return ymd_h(&t[0..8], hour).ok_or_else(|| bad_cycle(t));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt.with_timezone(&Utc));
    }

    // 2024-01-01T00Z / 2024-01-01T06z
    if let Some(stripped) = t.strip_suffix('Z').or_else(|| t.strip_suffix('z')) {
        if let Some((date, hour)) = stripped.split_once('T') {
            let parsed = (NaiveDate::parse_from_str(date, "%Y-%m-%d"), hour.parse::<u32>());
            if let (Ok(d), Ok(h)) = parsed {
                return d
                    .and_hms_opt(h, 0, 0)
                    .map(|n| Utc.from_utc_datetime(&n))
                    .ok_or_else(|| bad_cycle(t));
            }
        }
    }

    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(n) = NaiveDateTime::parse_from_str(t, fmt) {
            return Ok(Utc.from_utc_datetime(&n));
        }
    }

    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        if let Some(n) = d.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&n));
        }
    }

    Err(bad_cycle(t))
}

fn bad_cycle(s: &str) -> Error {
    Error::InvalidRequest(format!("unsupported cycle time format: {s}"))
}

fn ymd_h(date_yyyymmdd: &str, hour: u32) -> Option<DateTime<Utc>> {
    let year: i32 = date_yyyymmdd.get(0..4)?.parse().ok()?;
    let month: u32 = date_yyyymmdd.get(4..6)?.parse().ok()?;
    let day: u32 = date_yyyymmdd.get(6..8)?.parse().ok()?;
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).single()
}

/// Round `dt` down to the most recent cycle of a model issued every
/// `interval_hours` hours (starting at 00z).
pub fn floor_to_cycle(dt: DateTime<Utc>, interval_hours: u32) -> DateTime<Utc> {
    let interval = interval_hours.clamp(1, 24);
    let hour = (dt.hour() / interval) * interval;
    Utc.with_ymd_and_hms(dt.year(), dt.month(), dt.day(), hour, 0, 0)
        .single()
        .unwrap_or(dt)
}

/// Candidate cycles from the latest possible one backwards, newest first,
/// stopping once `lookback` has been covered.
pub fn cycle_candidates(
    now: DateTime<Utc>,
    interval_hours: u32,
    lookback: Duration,
) -> Vec<DateTime<Utc>> {
    let step = Duration::hours(i64::from(interval_hours.clamp(1, 24)));
    let stop = now - lookback;

    let mut out = Vec::new();
    let mut candidate = floor_to_cycle(now, interval_hours);
    while candidate > stop {
        out.push(candidate);
        candidate -= step;
    }
    out
}

/// Parse the wgrib2 reference time column, e.g. `d=2021010100` or
/// `d=202101010030`.
pub fn parse_reference_time(field: &str) -> Option<DateTime<Utc>> {
    let digits = field.trim().strip_prefix("d=")?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match digits.len() {
        10 => ymd_h(&digits[0..8], digits[8..10].parse().ok()?),
        12 => {
            let base = ymd_h(&digits[0..8], digits[8..10].parse().ok()?)?;
            let minute: i64 = digits[10..12].parse().ok()?;
            Some(base + Duration::minutes(minute))
        }
        _ => None,
    }
}

/// Lead encoded in a wgrib2 forecast column.
///
/// `anl` -> 0, `6 hour fcst` -> 6h, `0-6 hour acc fcst` -> 6h (end of the
/// window), `15 min fcst` -> 15min. Anything else is `None`.
pub fn parse_forecast_lead(field: &str) -> Option<Duration> {
    let f = field.trim();
    if f == "anl" || f.starts_with("anl ") {
        return Some(Duration::zero());
    }

    let mut words = f.split_whitespace();
    let amount = words.next()?;
    let unit = words.next()?;

    let value: i64 = match amount.split_once('-') {
        Some((_, end)) => end.parse().ok()?,
        None => amount.parse().ok()?,
    };

    match unit {
        "hour" | "hours" => Some(Duration::hours(value)),
        "min" | "mins" => Some(Duration::minutes(value)),
        "day" | "days" => Some(Duration::days(value)),
        _ => None,
    }
}

/// ecCodes `.index` lines carry `date` as `YYYYMMDD` and `time` as `HHMM`.
pub fn parse_eccodes_date_time(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let time: u32 = time.trim().parse().ok()?;
    let base = ymd_h(date.trim(), time / 100)?;
    Some(base + Duration::minutes(i64::from(time % 100)))
}
