//! Duration strings as used in rollout and analysis specs ("30s", "5m", "1h", "250ms").

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,

    #[error("invalid duration {0:?}: expected <number><ms|s|m|h>")]
    Invalid(String),
}

/// Parse a duration string.
///
/// Accepts an integer followed by `ms`, `s`, `m` or `h`. A bare integer is
/// read as seconds. Compound values such as `1m30s` are also accepted.
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(DurationError::Invalid(s.to_string()));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| DurationError::Invalid(s.to_string()))?;
        rest = &rest[digits..];

        let invalid = || DurationError::Invalid(s.to_string());
        let (unit, tail) = if let Some(tail) = rest.strip_prefix("ms") {
            (Duration::from_millis(value), tail)
        } else if let Some(tail) = rest.strip_prefix('s') {
            (Duration::from_secs(value), tail)
        } else if let Some(tail) = rest.strip_prefix('m') {
            (Duration::from_secs(value.checked_mul(60).ok_or_else(invalid)?), tail)
        } else if let Some(tail) = rest.strip_prefix('h') {
            (Duration::from_secs(value.checked_mul(3600).ok_or_else(invalid)?), tail)
        } else {
            return Err(invalid());
        };
        total = total.checked_add(unit).ok_or_else(invalid)?;
        rest = tail;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_units() {
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    }

    #[test]
    fn bare_number_is_seconds() {
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
    }

    #[test]
    fn parses_compound() {
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("1h1m1s"), Ok(Duration::from_secs(3661)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_duration(""), Err(DurationError::Empty));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("s10").is_err());
    }

    #[test]
    fn overflow_is_an_error() {
        assert!(matches!(
            parse_duration("18446744073709551615s1s"),
            Err(DurationError::Invalid(_))
        ));
        assert!(matches!(
            parse_duration("999999999999999999h"),
            Err(DurationError::Invalid(_))
        ));
        assert!(parse_duration("99999999999999999999").is_err());
    }
}
