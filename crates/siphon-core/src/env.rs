//! Environment variable helpers for `Config::from_env` implementations.

use std::str::FromStr;

use crate::error::{Error, Result};

/// Read `key`, falling back to `default` when unset or blank.
pub fn string_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

/// Read `key` if it is set and non-blank.
pub fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a required variable.
pub fn required(key: &str) -> Result<String> {
    optional(key).ok_or_else(|| Error::Config(format!("{} environment variable is required", key)))
}

/// Parse `key` as `T`, falling back to `default` when unset or blank.
pub fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("{}={:?} is invalid: {}", key, raw, e))),
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn list(key: &str) -> Vec<String> {
    optional(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that manipulate env vars.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn with_var<F: FnOnce()>(key: &str, value: Option<&str>, f: F) {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var(key).ok();
        // SAFETY: Serialized by mutex; only test code touches these vars.
        unsafe {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
        f();
        unsafe {
            match saved {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
    }

    #[test]
    fn test_parse_or_default_when_unset() {
        with_var("SIPHON_TEST_NUM", None, || {
            assert_eq!(parse_or("SIPHON_TEST_NUM", 7u32).unwrap(), 7);
        });
    }

    #[test]
    fn test_parse_or_reads_value() {
        with_var("SIPHON_TEST_NUM", Some(" 42 "), || {
            assert_eq!(parse_or("SIPHON_TEST_NUM", 7u32).unwrap(), 42);
        });
    }

    #[test]
    fn test_parse_or_rejects_garbage() {
        with_var("SIPHON_TEST_NUM", Some("many"), || {
            let err = parse_or("SIPHON_TEST_NUM", 7u32).unwrap_err();
            assert!(err.to_string().contains("SIPHON_TEST_NUM"));
        });
    }

    #[test]
    fn test_required_and_blank() {
        with_var("SIPHON_TEST_REQ", Some("   "), || {
            assert!(required("SIPHON_TEST_REQ").is_err());
            assert_eq!(string_or("SIPHON_TEST_REQ", "fallback"), "fallback");
        });
    }

    #[test]
    fn test_list_splits_and_trims() {
        with_var("SIPHON_TEST_LIST", Some("a, b,,c "), || {
            assert_eq!(list("SIPHON_TEST_LIST"), vec!["a", "b", "c"]);
        });
    }
}
