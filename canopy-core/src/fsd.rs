//! Flexible Specification of Duration.
//!
//! Human-friendly time intervals: a decimal number with an optional unit
//! suffix (`ms`, `s`, `m`, `h`, `d`). A bare number means seconds.

use std::time::Duration;

use crate::error::{Error, Result};

/// Parse an FSD string into a duration.
///
/// # Examples
///
/// ```
/// use canopy_core::fsd;
/// use std::time::Duration;
///
/// assert_eq!(fsd::parse("5s").unwrap(), Duration::from_secs(5));
/// assert_eq!(fsd::parse("2m").unwrap(), Duration::from_secs(120));
/// assert_eq!(fsd::parse("250ms").unwrap(), Duration::from_millis(250));
/// assert_eq!(fsd::parse("1.5h").unwrap(), Duration::from_secs(5400));
/// ```
pub fn parse(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::invalid("empty duration"));
    }
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| Error::invalid(format!("malformed duration {s:?}")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::invalid(format!("duration out of range {s:?}")));
    }
    let scale = match unit {
        "" | "s" => 1.0,
        "ms" => 1e-3,
        "m" => 60.0,
        "h" => 3600.0,
        "d" => 86400.0,
        other => return Err(Error::invalid(format!("unknown duration unit {other:?}"))),
    };
    let secs = value * scale;
    if !secs.is_finite() {
        return Err(Error::invalid(format!("duration out of range {s:?}")));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Format a duration in the shortest sensible unit, e.g. `"250ms"`, `"5s"`,
/// `"2m"`, `"1.5h"`.
#[must_use]
pub fn format(d: Duration) -> String {
    let secs = d.as_secs_f64();
    let (value, unit) = if secs < 1.0 {
        (secs * 1e3, "ms")
    } else if secs < 60.0 {
        (secs, "s")
    } else if secs < 3600.0 {
        (secs / 60.0, "m")
    } else if secs < 86400.0 {
        (secs / 3600.0, "h")
    } else {
        (secs / 86400.0, "d")
    };
    if (value - value.round()).abs() < 1e-9 {
        format!("{}{unit}", value.round() as u64)
    } else {
        format!("{value:.3}{unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(parse("0").unwrap(), Duration::ZERO);
        assert_eq!(parse("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse("0.5s").unwrap(), Duration::from_millis(500));
        assert_eq!(parse(" 5s ").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "s", "5x", "-1s", "1.2.3s", "5 s", "inf", "nan"] {
            assert!(parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn formats_round_values() {
        assert_eq!(format(Duration::from_millis(250)), "250ms");
        assert_eq!(format(Duration::from_secs(5)), "5s");
        assert_eq!(format(Duration::from_secs(120)), "2m");
        assert_eq!(format(Duration::from_secs(5400)), "1.500h");
        assert_eq!(format(Duration::from_secs(86400)), "1d");
    }

    #[test]
    fn format_parse_round_trip() {
        for d in [
            Duration::from_millis(1),
            Duration::from_secs(1),
            Duration::from_secs(90),
            Duration::from_secs(7200),
        ] {
            let parsed = parse(&format(d)).unwrap();
            let diff = parsed.as_secs_f64() - d.as_secs_f64();
            assert!(diff.abs() < 1e-3, "{d:?} -> {} -> {parsed:?}", format(d));
        }
    }
}
