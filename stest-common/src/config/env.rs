//! `STEST_*` environment overrides.
//!
//! Every getter returns a [`Sourced`] value. A malformed variable falls back
//! to the default and is recorded, so one pass reports every bad variable
//! instead of stopping at the first.

use super::source::Sourced;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by every harness variable.
pub const PREFIX: &str = "STEST_";

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    #[error("{var}: expected {expected}, got {value:?}")]
    Invalid {
        var: String,
        expected: &'static str,
        value: String,
    },

    #[error("{var}: {value} is outside {min}..={max}")]
    OutOfRange {
        var: String,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Reads `STEST_*` variables and collects what it could not parse.
#[derive(Debug, Default)]
pub struct EnvParser {
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// `(variable, raw value)` when set. Non-unicode values count as unset.
    fn lookup(name: &str) -> Option<(String, String)> {
        let var = format!("{PREFIX}{name}");
        env::var(&var).ok().map(|value| (var, value))
    }

    /// Shared shape of the typed getters: unset gives the default, a value
    /// `parse` rejects gives the default plus an error.
    fn parsed<T>(
        &mut self,
        name: &str,
        default: T,
        expected: &'static str,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Sourced<T> {
        let Some((var, raw)) = Self::lookup(name) else {
            return Sourced::default_value(default);
        };
        match parse(raw.trim()) {
            Some(value) => Sourced::from_env(value, var),
            None => {
                self.errors.push(EnvError::Invalid {
                    var,
                    expected,
                    value: raw,
                });
                Sourced::default_value(default)
            }
        }
    }

    /// `1/true/yes/on` and `0/false/no/off/""`, case-insensitive.
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        self.parsed(name, default, "a boolean", |raw| {
            match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" | "" => Some(false),
                _ => None,
            }
        })
    }

    /// An integer in `min..=max`.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        let sourced = self.parsed(name, default, "an unsigned integer", |raw| {
            raw.parse::<u64>().ok()
        });
        if (min..=max).contains(&sourced.value) {
            return sourced;
        }
        self.errors.push(EnvError::OutOfRange {
            var: sourced.var.unwrap_or_else(|| format!("{PREFIX}{name}")),
            value: sourced.value,
            min,
            max,
        });
        Sourced::default_value(default)
    }

    /// An integer, or `None` when unset or empty.
    pub fn get_optional_u64(&mut self, name: &str) -> Sourced<Option<u64>> {
        self.parsed(name, None, "an unsigned integer", |raw| {
            if raw.is_empty() {
                Some(None)
            } else {
                raw.parse::<u64>().ok().map(Some)
            }
        })
    }

    /// A duration in humantime syntax (`500ms`, `2s`, `1m 30s`).
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        self.parsed(name, default, "a duration such as 500ms or 2s", |raw| {
            humantime::parse_duration(raw).ok()
        })
    }

    /// A `tracing` level name, lowercased.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        self.parsed(name, default.to_string(), "a log level", |raw| {
            let lower = raw.to_ascii_lowercase();
            LOG_LEVELS.contains(&lower.as_str()).then_some(lower)
        })
    }

    /// Any text, or `None` when unset or blank.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match Self::lookup(name) {
            Some((var, value)) if value.trim().is_empty() => Sourced::from_env(None, var),
            Some((var, value)) => Sourced::from_env(Some(value), var),
            None => Sourced::default_value(None),
        }
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use crate::config::source::ConfigSource;

    /// Set (or clear) one variable for the duration of `f`.
    fn with_var<R>(name: &str, value: Option<&str>, f: impl FnOnce() -> R) -> R {
        let var = format!("{PREFIX}{name}");
        // SAFETY: env access is serialized by env_test_lock
        unsafe {
            match value {
                Some(v) => env::set_var(&var, v),
                None => env::remove_var(&var),
            }
        }
        let out = f();
        // SAFETY: env access is serialized by env_test_lock
        unsafe { env::remove_var(&var) };
        out
    }

    #[test]
    fn test_bool_spellings() {
        let _guard = env_test_lock();
        for raw in ["1", "true", "Yes", "ON"] {
            let mut p = EnvParser::new();
            assert!(with_var("T_BOOL", Some(raw), || p.get_bool("T_BOOL", false).value));
            assert!(!p.has_errors(), "{raw}");
        }
        for raw in ["0", "false", "no", "off", ""] {
            let mut p = EnvParser::new();
            assert!(!with_var("T_BOOL", Some(raw), || p.get_bool("T_BOOL", true).value));
        }

        let mut p = EnvParser::new();
        let v = with_var("T_BOOL", Some("maybe"), || p.get_bool("T_BOOL", true));
        assert!(v.value);
        assert_eq!(v.source, ConfigSource::Default);
        assert!(matches!(p.errors(), [EnvError::Invalid { .. }]));
    }

    #[test]
    fn test_u64_range_checks_bounds() {
        let _guard = env_test_lock();
        let mut p = EnvParser::new();
        let v = with_var("T_U64", Some(" 50 "), || p.get_u64_range("T_U64", 10, 1, 100));
        assert_eq!((v.value, v.source), (50, ConfigSource::Environment));
        assert_eq!(v.var.as_deref(), Some("STEST_T_U64"));

        let v = with_var("T_U64", Some("500"), || p.get_u64_range("T_U64", 10, 1, 100));
        assert_eq!(v.value, 10);
        assert_eq!(
            p.take_errors(),
            [EnvError::OutOfRange {
                var: "STEST_T_U64".into(),
                value: 500,
                min: 1,
                max: 100,
            }]
        );

        let v = with_var("T_U64", None, || p.get_u64_range("T_U64", 10, 1, 100));
        assert_eq!(v.source, ConfigSource::Default);
        assert!(!p.has_errors());
    }

    #[test]
    fn test_duration_and_optional_u64() {
        let _guard = env_test_lock();
        let mut p = EnvParser::new();
        let d = with_var("T_DUR", Some("750ms"), || {
            p.get_duration("T_DUR", Duration::from_secs(1))
        });
        assert_eq!(d.value, Duration::from_millis(750));

        let d = with_var("T_DUR", Some("soon"), || {
            p.get_duration("T_DUR", Duration::from_secs(1))
        });
        assert_eq!(d.value, Duration::from_secs(1));

        assert_eq!(with_var("T_OPT", None, || p.get_optional_u64("T_OPT")).value, None);
        let v = with_var("T_OPT", Some(""), || p.get_optional_u64("T_OPT"));
        assert_eq!(v.value, None);
        assert!(v.is_set());
        assert_eq!(
            with_var("T_OPT", Some("12"), || p.get_optional_u64("T_OPT")).value,
            Some(12)
        );
        with_var("T_OPT", Some("twelve"), || p.get_optional_u64("T_OPT"));

        let errors = p.take_errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].to_string().starts_with("STEST_T_DUR"));
        assert!(errors[1].to_string().starts_with("STEST_T_OPT"));
    }

    #[test]
    fn test_log_level_and_strings() {
        let _guard = env_test_lock();
        let mut p = EnvParser::new();
        let v = with_var("T_LEVEL", Some("DEBUG"), || p.get_log_level("T_LEVEL", "info"));
        assert_eq!(v.value, "debug");
        let v = with_var("T_LEVEL", Some("loud"), || p.get_log_level("T_LEVEL", "info"));
        assert_eq!(v.value, "info");
        assert!(p.has_errors());

        let v = with_var("T_STR", Some("  "), || p.get_optional_string("T_STR"));
        assert_eq!(v.value, None);
        let v = with_var("T_STR", Some("stest=trace"), || p.get_optional_string("T_STR"));
        assert_eq!(v.value.as_deref(), Some("stest=trace"));
    }
}
