//! Helpers for reading typed settings from environment variables.

use std::fmt::Display;
use std::str::FromStr;

/// An environment variable was set to something unparsable.
#[derive(Debug, thiserror::Error)]
#[error("{key} has invalid value {value:?}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Read `key`, returning `default` when unset or blank.
pub fn env_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    parse_or(key, std::env::var(key).ok(), default)
}

/// Read `key` as a non-empty string.
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an optional raw value, falling back to `default`.
pub fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError {
            key,
            value: value.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_and_blank_use_default() {
        assert_eq!(parse_or("PORT", None, 8000u16).unwrap(), 8000);
        assert_eq!(parse_or("PORT", Some("  ".into()), 8000u16).unwrap(), 8000);
    }

    #[test]
    fn value_is_parsed() {
        assert_eq!(parse_or("PORT", Some(" 9001 ".into()), 8000u16).unwrap(), 9001);
    }

    #[test]
    fn bad_value_names_the_key() {
        let err = parse_or("PORT", Some("eighty".into()), 8000u16).unwrap_err();
        assert_eq!(err.key, "PORT");
        assert!(err.to_string().starts_with("PORT has invalid value \"eighty\""));
    }
}
