//! Environment variable helpers used by the config layers.
//!
//! ```ignore
//! use netmux_core::env::{env_get, env_get_bool};
//!
//! let workers: usize = env_get("NMX_WORKERS", 4);
//! let verbose = env_get_bool("NMX_VERBOSE", false);
//! ```
//!
//! Unset or unparsable values fall back to the supplied default.

use std::str::FromStr;

/// Read `key` and parse it as `T`, or return `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Read `key` as a boolean.
///
/// "1", "true", "yes" and "on" (any case) are true; any other value is
/// false. Unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` if `key` is set and parses, else `None`.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}
