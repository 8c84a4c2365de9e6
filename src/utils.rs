use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Duration;

/// Milliseconds since the Unix epoch according to the local wall clock.
///
/// A clock set before 1970 reads as 0 rather than failing; freshness checks
/// built on top of this treat that as an extremely stale clock.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Fractional seconds since the Unix epoch, for comparing against
/// `iterateUntilTs` bounds.
pub fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Parses a duration string in the format "30s", "10m", "5h", "3d".
///
/// Supported units:
/// - `s` for seconds
/// - `m` for minutes
/// - `h` for hours
/// - `d` for days
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    let Some(unit_char) = s.chars().last() else {
        return Err("Duration string cannot be empty".to_string());
    };
    let value_str = &s[..s.len() - unit_char.len_utf8()];

    let value: u64 = value_str
        .parse()
        .map_err(|_| format!("Invalid numeric value in duration: '{}'", value_str))?;

    let multiplier = match unit_char {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        _ => {
            return Err(format!(
                "Unknown duration unit: '{}'. Use 's', 'm', 'h', or 'd'.",
                unit_char
            ))
        }
    };

    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("Duration '{}' is too large", s))
}
