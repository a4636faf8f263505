//! UTC timestamp parsing and formatting.
//!
//! All timestamps cross the engine boundary as UTC. Columns are
//! `timestamp without time zone`, so the canonical string form carries no
//! zone designator and is always interpreted as UTC.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::{TemporalError, TemporalResult};

/// Canonical output format: `YYYY-MM-DD HH:MM:SS.uuuuuu`.
const OUTPUT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Seconds-precision input format; fractional digits are handled apart.
const INPUT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The open end of every current version: `9999-12-31 00:00:00`.
pub fn end_of_time() -> NaiveDateTime {
    NaiveDateTime::new(
        NaiveDate::from_ymd_opt(9999, 12, 31).unwrap(),
        chrono::NaiveTime::MIN,
    )
}

/// The canonical origin: midnight of year zero. A history row whose
/// `valid_from` touches this instant has no predecessor.
pub fn beginning_of_time() -> NaiveDateTime {
    NaiveDateTime::new(
        NaiveDate::from_ymd_opt(0, 1, 1).unwrap(),
        chrono::NaiveTime::MIN,
    )
}

/// Parse `YYYY-MM-DD HH:MM:SS[.ffffff]` as a UTC instant.
///
/// The fractional part is truncated to microsecond precision. Any other
/// shape fails with [`TemporalError::MalformedTimestamp`].
pub fn parse_utc(input: &str) -> TemporalResult<DateTime<Utc>> {
    let (seconds, fraction) = match input.split_once('.') {
        Some((s, f)) => (s, Some(f)),
        None => (input, None),
    };

    let base = NaiveDateTime::parse_from_str(seconds, INPUT_FORMAT)
        .map_err(|_| TemporalError::malformed_timestamp(input))?;

    let micros = match fraction {
        None => 0i64,
        Some(f) if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) => {
            return Err(TemporalError::malformed_timestamp(input));
        }
        Some(f) => {
            // Truncate to six digits, right-padding shorter fractions.
            let digits: String = f.chars().take(6).collect();
            let padded = format!("{digits:0<6}");
            padded
                .parse::<i64>()
                .map_err(|_| TemporalError::malformed_timestamp(input))?
        }
    };

    Ok(Utc.from_utc_datetime(&(base + Duration::microseconds(micros))))
}

/// Format a UTC instant as `YYYY-MM-DD HH:MM:SS.uuuuuu`, zero-padding
/// microseconds to six digits.
pub fn format_utc(instant: DateTime<Utc>) -> String {
    instant.format(OUTPUT_FORMAT).to_string()
}

/// Format a zone-less instant, which the engine stores as UTC.
pub fn format_naive(instant: NaiveDateTime) -> String {
    instant.format(OUTPUT_FORMAT).to_string()
}

/// Reattach the UTC zone to a stored `timestamp without time zone` value.
pub fn as_utc(instant: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&instant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_form() {
        let t = parse_utc("2024-03-01 12:30:45.000123").unwrap();
        assert_eq!(t.timestamp_subsec_micros(), 123);
        assert_eq!(format_utc(t), "2024-03-01 12:30:45.000123");
    }

    #[test]
    fn parses_without_fraction() {
        let t = parse_utc("2024-03-01 12:30:45").unwrap();
        assert_eq!(format_utc(t), "2024-03-01 12:30:45.000000");
    }

    #[test]
    fn truncates_excess_fraction_digits() {
        let t = parse_utc("2024-03-01 12:30:45.1234567890").unwrap();
        assert_eq!(t.timestamp_subsec_micros(), 123_456);
    }

    #[test]
    fn pads_short_fractions() {
        let t = parse_utc("2024-03-01 12:30:45.5").unwrap();
        assert_eq!(t.timestamp_subsec_micros(), 500_000);
    }

    #[test]
    fn round_trips_canonical_strings() {
        for s in [
            "2024-01-31 00:00:00.000000",
            "1999-12-31 23:59:59.999999",
            "2024-02-29 06:07:08.090100",
        ] {
            assert_eq!(format_utc(parse_utc(s).unwrap()), s);
        }
    }

    #[test]
    fn rejects_malformed_input() {
        for s in [
            "not-a-date",
            "2024-03-01",
            "2024-03-01T12:30:45",
            "2024-03-01 12:30:45.",
            "2024-03-01 12:30:45.12x",
            "2024-13-01 12:30:45",
        ] {
            assert!(
                matches!(parse_utc(s), Err(TemporalError::MalformedTimestamp(_))),
                "expected MalformedTimestamp for {s:?}"
            );
        }
    }

    #[test]
    fn boundary_constants_order() {
        assert!(beginning_of_time() < end_of_time());
        assert_eq!(format_naive(end_of_time()), "9999-12-31 00:00:00.000000");
    }
}
