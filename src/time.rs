use crate::errof;
use crate::errors::Result;
use crate::types::Time;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Earliest and latest representable timestamps; a fresh file's range is
/// (DAWN, DUSK) until real data narrows it.
pub const DAWN: Time = i64::MIN;
pub const DUSK: Time = i64::MAX;

pub const NS_PER_SEC: i64 = 1_000_000_000;

/// Parse a `time` literal: `'2018-01-31T12:00:00'` (optionally with
/// fractional seconds) or a bare integer (nanoseconds since epoch).
pub fn from_time_literal(s: &str) -> Result<Time> {
    if let Ok(n) = s.parse::<i64>() {
        return Ok(n);
    }
    let dt = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|e| errof!(Invalid, "time", "bad time literal '{s}': {e}"))?;
    timestamp_ns(dt.and_utc())
}

/// Parse a `date` literal: `'2018-01-31'` or a bare integer.
pub fn from_date_literal(s: &str) -> Result<Time> {
    if let Ok(n) = s.parse::<i64>() {
        return Ok(n);
    }
    let d = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| errof!(Invalid, "time", "bad date literal '{s}': {e}"))?;
    let dt = d
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| errof!(Invalid, "time", "bad date literal '{s}'"))?;
    timestamp_ns(dt.and_utc())
}

fn timestamp_ns(dt: DateTime<Utc>) -> Result<Time> {
    dt.timestamp_nanos_opt()
        .ok_or_else(|| errof!(TooBig, "time", "timestamp out of range"))
}

#[must_use]
pub fn to_datetime(t: Time) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literals() {
        let t = from_time_literal("1970-01-01T00:00:01").unwrap();
        assert_eq!(t, NS_PER_SEC);
        let d = from_date_literal("1970-01-02").unwrap();
        assert_eq!(d, 86_400 * NS_PER_SEC);
        assert_eq!(from_time_literal("12345").unwrap(), 12345);
    }

    #[test]
    fn rejects_garbage() {
        assert!(from_time_literal("yesterday").is_err());
    }
}
