//! Parsing helpers for the quantity and timestamp strings that show up on a sandbox spec:
//! CPU ("500m", "2"), memory ("512Mi", "1g"), and RFC3339-nano timestamps.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

/// Parse a CPU quantity into nano-CPUs (`"500m"` -> 500_000_000, `"2"` -> 2_000_000_000).
///
/// A bare integer or decimal is interpreted as whole cores. A trailing `m` means
/// milli-cores. Anything else is rejected rather than silently truncated, since CPU
/// requests gate resource limits applied to a running container.
pub fn parse_cpu(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(milli) = raw.strip_suffix('m') {
        let milli: f64 = milli.parse().ok()?;
        return Some((milli * 1_000_000.0).round() as i64);
    }
    let cores: f64 = raw.parse().ok()?;
    Some((cores * 1_000_000_000.0).round() as i64)
}

static MEMORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([0-9]+(?:\.[0-9]+)?)\s*([a-z]*)$").expect("static regex is valid")
});

/// Parse a memory quantity into bytes, recognizing decimal (`k/m/g/t/b`) and binary
/// (`Ki/Mi/Gi/Ti`) suffixes. An unrecognized unit logs a warning and returns `None` —
/// the caller leaves the value unset rather than applying a zero limit.
pub fn parse_memory(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let caps = MEMORY_RE.captures(raw)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str()).unwrap_or("").to_ascii_lowercase();

    let multiplier: f64 = match unit.as_str() {
        "" | "b" => 1.0,
        "k" => 1_000.0,
        "m" => 1_000_000.0,
        "g" => 1_000_000_000.0,
        "t" => 1_000_000_000_000.0,
        "ki" => 1024.0,
        "mi" => 1024.0 * 1024.0,
        "gi" => 1024.0 * 1024.0 * 1024.0,
        "ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => {
            tracing::warn!(unit = other, raw, "unrecognized memory unit, ignoring value");
            return None;
        }
    };

    Some((value * multiplier).round() as i64)
}

/// Parse an RFC3339 timestamp with up to nanosecond precision, truncated to microseconds.
///
/// The zero-value timestamp `0001-01-01T00:00:00Z` and the empty string both map to "now",
/// matching callers that use a zero timestamp as a not-yet-set sentinel.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "0001-01-01T00:00:00Z" {
        return truncate_to_micros(Utc::now());
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => truncate_to_micros(dt.with_timezone(&Utc)),
        Err(err) => {
            tracing::warn!(raw, error = %err, "failed to parse timestamp, using now");
            truncate_to_micros(Utc::now())
        }
    }
}

fn truncate_to_micros(dt: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = dt.timestamp_subsec_nanos();
    let micros = (nanos / 1_000) * 1_000;
    dt.with_nanosecond(micros).unwrap_or(dt)
}

use chrono::Timelike;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_milli_cpu() {
        assert_eq!(parse_cpu("500m"), Some(500_000_000));
    }

    #[test]
    fn parses_whole_cpu() {
        assert_eq!(parse_cpu("2"), Some(2_000_000_000));
    }

    #[test]
    fn parses_decimal_memory_mebibytes() {
        assert_eq!(parse_memory("512Mi"), Some(536_870_912));
    }

    #[test]
    fn parses_decimal_gigabyte() {
        assert_eq!(parse_memory("1g"), Some(1_000_000_000));
    }

    #[test]
    fn unknown_memory_unit_is_unset() {
        assert_eq!(parse_memory("512Xi"), None);
    }

    #[test]
    fn empty_timestamp_maps_to_now() {
        let before = Utc::now();
        let parsed = parse_timestamp("");
        let after = Utc::now();
        assert!(parsed >= before - chrono::Duration::seconds(1));
        assert!(parsed <= after + chrono::Duration::seconds(1));
    }

    #[test]
    fn zero_value_timestamp_maps_to_now() {
        let before = Utc::now();
        let parsed = parse_timestamp("0001-01-01T00:00:00Z");
        assert!(parsed >= before - chrono::Duration::seconds(1));
    }

    #[test]
    fn truncates_nanos_to_micros() {
        let parsed = parse_timestamp("2024-01-01T00:00:00.123456789Z");
        assert_eq!(parsed.timestamp_subsec_nanos(), 123_456_000);
    }
}
