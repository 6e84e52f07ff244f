//! Environment variable helpers
//!
//! Every runtime knob can be overridden with a `PIO_*` variable. These
//! helpers parse a variable into the target type and fall back to the
//! compiled default when it is unset or malformed.
//!
//! ```ignore
//! use piorun_core::env::{env_get, env_get_bool, env_get_millis};
//!
//! let workers: usize = env_get("PIO_NUM_WORKERS", 4);
//! let hooked = env_get_bool("PIO_HOOK_BY_DEFAULT", true);
//! let tick = env_get_millis("PIO_POLL_TIMEOUT_MS", 1);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if it is set and well formed.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Read a boolean switch.
///
/// `1/true/yes/on` and `0/false/no/off` are recognised (case-insensitive).
/// Anything else, including an unset variable, yields `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Read a millisecond count as a `Duration`.
#[inline]
pub fn env_get_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_falls_back_to_default() {
        let val: usize = env_get("__PIO_TEST_UNSET_7781__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__PIO_TEST_UNSET_7781__", true));
        assert_eq!(env_get_opt::<u64>("__PIO_TEST_UNSET_7781__"), None);
        assert_eq!(
            env_get_millis("__PIO_TEST_UNSET_7781__", 7),
            Duration::from_millis(7)
        );
    }

    #[test]
    fn parses_set_values() {
        std::env::set_var("__PIO_TEST_NUM__", " 123 ");
        let val: usize = env_get("__PIO_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__PIO_TEST_NUM__");
    }

    #[test]
    fn malformed_value_uses_default() {
        std::env::set_var("__PIO_TEST_BAD__", "twelve");
        let val: u32 = env_get("__PIO_TEST_BAD__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__PIO_TEST_BAD__");
    }

    #[test]
    fn bool_spellings() {
        let key = "__PIO_TEST_BOOL__";
        for on in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var(key, on);
            assert!(env_get_bool(key, false), "{on} should be true");
        }
        for off in ["0", "false", "No", "off"] {
            std::env::set_var(key, off);
            assert!(!env_get_bool(key, true), "{off} should be false");
        }
        std::env::set_var(key, "maybe");
        assert!(env_get_bool(key, true));
        assert!(!env_get_bool(key, false));
        std::env::remove_var(key);
    }
}
