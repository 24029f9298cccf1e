//! Environment variable helpers
//!
//! Typed getters with defaults, used by the log setup and the demos.

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Boolean getter: "1", "true", "yes", "on" (case-insensitive) are true
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Optional getter: `Some(T)` only when set and parseable
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Is the variable set at all?
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_on_unset() {
        let v: usize = env_get("__VD_TEST_UNSET__", 42);
        assert_eq!(v, 42);
        assert!(!env_is_set("__VD_TEST_UNSET__"));
    }

    #[test]
    fn test_bool_variants() {
        std::env::set_var("__VD_TEST_BOOL__", "yes");
        assert!(env_get_bool("__VD_TEST_BOOL__", false));
        std::env::set_var("__VD_TEST_BOOL__", "0");
        assert!(!env_get_bool("__VD_TEST_BOOL__", true));
        std::env::remove_var("__VD_TEST_BOOL__");
    }

    #[test]
    fn test_opt() {
        std::env::set_var("__VD_TEST_NUM__", "17");
        assert_eq!(env_get_opt::<u32>("__VD_TEST_NUM__"), Some(17));
        std::env::remove_var("__VD_TEST_NUM__");
        assert_eq!(env_get_opt::<u32>("__VD_TEST_NUM__"), None);
    }
}
