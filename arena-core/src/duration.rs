//! Sync interval parsing.
//!
//! Intervals use the `humantime` grammar (`30s`, `5m`, `1h30m`, `2 days`).
//! A bare number without a unit is rejected, as is a zero total.

use std::time::Duration;

use crate::error::ConfigError;

/// Parse an interval string such as `1h30m`.
pub fn parse_interval(value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidInterval {
        value: value.to_string(),
        reason,
    };

    let input = value.trim();
    if input.is_empty() {
        return Err(invalid("empty interval".to_string()));
    }
    let interval = humantime::parse_duration(input).map_err(|e| invalid(e.to_string()))?;
    if interval.is_zero() {
        return Err(invalid("interval must be greater than zero".to_string()));
    }
    Ok(interval)
}
