//! Duration helpers for the `HH:mm:ss` and ISO-8601 (`PT1H30M`) notations.
//!
//! Polling intervals travel to devices as `HH:mm:ss`; maintenance window
//! durations are accepted in either notation.

use std::time::Duration;

use thiserror::Error;

/// Error returned when a duration string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid duration '{input}': {reason}")]
pub struct DurationError {
    pub input: String,
    pub reason: &'static str,
}

impl DurationError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// Parse `HH:mm:ss` into a [`Duration`].
///
/// Hours may exceed 23; minutes and seconds must be below 60.
pub fn parse_hms(input: &str) -> Result<Duration, DurationError> {
    let parts: Vec<&str> = input.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(DurationError::new(input, "expected HH:mm:ss"));
    }

    let mut fields = [0u64; 3];
    for (slot, part) in fields.iter_mut().zip(&parts) {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DurationError::new(input, "non-numeric field"));
        }
        *slot = part
            .parse()
            .map_err(|_| DurationError::new(input, "field out of range"))?;
    }

    let [hours, minutes, seconds] = fields;
    if minutes >= 60 || seconds >= 60 {
        return Err(DurationError::new(input, "minutes and seconds must be below 60"));
    }
    Ok(Duration::from_secs(hours * 3600 + minutes * 60 + seconds))
}

/// Format a [`Duration`] as `HH:mm:ss`, dropping sub-second precision.
pub fn format_hms(duration: Duration) -> String {
    let total = duration.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Parse an ISO-8601 time-based duration such as `PT2H`, `PT1H30M`,
/// `PT90S` or `P1DT2H`.
///
/// Year and month designators are rejected because their length is not
/// fixed.
pub fn parse_iso8601(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    let rest = s
        .strip_prefix('P')
        .or_else(|| s.strip_prefix('p'))
        .ok_or_else(|| DurationError::new(input, "missing 'P' designator"))?;
    if rest.is_empty() {
        return Err(DurationError::new(input, "empty duration"));
    }

    let mut secs = 0u64;
    let mut in_time = false;
    let mut number = String::new();
    let mut saw_component = false;

    for c in rest.chars() {
        match c.to_ascii_uppercase() {
            'T' => {
                if in_time || !number.is_empty() {
                    return Err(DurationError::new(input, "misplaced 'T'"));
                }
                in_time = true;
            }
            d if d.is_ascii_digit() => number.push(d),
            unit => {
                let value: u64 = number
                    .parse()
                    .map_err(|_| DurationError::new(input, "missing number"))?;
                number.clear();
                let factor = match (in_time, unit) {
                    (false, 'W') => 7 * 86_400,
                    (false, 'D') => 86_400,
                    (true, 'H') => 3600,
                    (true, 'M') => 60,
                    (true, 'S') => 1,
                    _ => return Err(DurationError::new(input, "unsupported designator")),
                };
                secs = value
                    .checked_mul(factor)
                    .and_then(|v| secs.checked_add(v))
                    .ok_or_else(|| DurationError::new(input, "overflow"))?;
                saw_component = true;
            }
        }
    }

    if !number.is_empty() || !saw_component {
        return Err(DurationError::new(input, "dangling number"));
    }
    Ok(Duration::from_secs(secs))
}

/// Parse either notation, trying `HH:mm:ss` first.
pub fn parse_flexible(input: &str) -> Result<Duration, DurationError> {
    if input.contains(':') {
        parse_hms(input)
    } else {
        parse_iso8601(input)
    }
}

/// serde adapter storing a [`Duration`] as `HH:mm:ss`.
pub mod hms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_hms(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_hms(&raw).map_err(serde::de::Error::custom)
    }
}
