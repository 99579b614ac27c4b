//! Duration strings for config fields.
//!
//! Accepts the Go `time.ParseDuration` grammar (`300ms`, `1.5h`, `2h45m`,
//! units `ns us µs ms s m h`) extended with `<int>d` for days. The empty
//! string and `"0"` both parse to a zero duration.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DurationError {
    #[error("invalid duration {0:?}")]
    Invalid(String),
    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { input: String, unit: String },
    #[error("negative durations are not allowed: {0:?}")]
    Negative(String),
}

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

fn unit_nanos(unit: &str) -> Option<f64> {
    match unit {
        "ns" => Some(1.0),
        "us" | "\u{b5}s" | "\u{3bc}s" => Some(1_000.0),
        "ms" => Some(1_000_000.0),
        "s" => Some(NANOS_PER_SEC),
        "m" => Some(60.0 * NANOS_PER_SEC),
        "h" => Some(3600.0 * NANOS_PER_SEC),
        "d" => Some(86400.0 * NANOS_PER_SEC),
        _ => None,
    }
}

/// Parse a duration string. `""` and `"0"` yield `Duration::ZERO`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    if s.is_empty() || s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.starts_with('-') {
        return Err(DurationError::Negative(input.to_string()));
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s.is_empty() {
        return Err(DurationError::Invalid(input.to_string()));
    }

    let mut total_nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        // Leading number, optionally with a fraction.
        let num_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(DurationError::Invalid(input.to_string()));
        }
        let (num_str, tail) = rest.split_at(num_len);
        let value: f64 = num_str
            .parse()
            .map_err(|_| DurationError::Invalid(input.to_string()))?;

        // Unit runs until the next digit.
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        if unit_len == 0 {
            return Err(DurationError::Invalid(input.to_string()));
        }
        let (unit, next) = tail.split_at(unit_len);
        let scale = unit_nanos(unit).ok_or_else(|| DurationError::UnknownUnit {
            input: input.to_string(),
            unit: unit.to_string(),
        })?;
        if unit == "d" && num_str.contains('.') {
            // Day counts are whole numbers.
            return Err(DurationError::Invalid(input.to_string()));
        }
        total_nanos += value * scale;
        rest = next;
    }

    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Serde adapter for optional duration-string fields. A missing field,
/// the empty string, and `"0"` all deserialize to `None`.
pub fn de_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => {
            let parsed = parse_duration(&s).map_err(serde::de::Error::custom)?;
            Ok(if parsed.is_zero() { None } else { Some(parsed) })
        }
    }
}

/// Render a duration in the largest exact canonical unit
/// (`<n>d`, `<n>h`, `<n>m`, `<n>s`, `<n>ms`), falling back to
/// fractional seconds. Used for logs and error messages.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0".to_string();
    }
    let nanos = d.as_nanos();
    if d.subsec_nanos() == 0 {
        let secs = d.as_secs();
        if secs % 86400 == 0 {
            return format!("{}d", secs / 86400);
        }
        if secs % 3600 == 0 {
            return format!("{}h", secs / 3600);
        }
        if secs % 60 == 0 {
            return format!("{}m", secs / 60);
        }
        return format!("{}s", secs);
    }
    if nanos % 1_000_000 == 0 {
        return format!("{}ms", nanos / 1_000_000);
    }
    format!("{}s", d.as_secs_f64())
}
