//! `ESHIFT_*` variable parsing.
//!
//! Every getter returns a [`Sourced`] value and never fails outright: a bad
//! value is recorded and the default is used, so one pass reports every
//! problem. Reads come from the process environment or an injected map.

use super::migration::{ConfigPatch, MAX_CANARY_TIMEOUT_SECS, ManualOverride};
use super::source::Sourced;
use crate::errors::MigrationError;
use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Prefix for every recognised variable.
pub const ENV_PREFIX: &str = "ESHIFT_";

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Error)]
pub enum EnvError {
    /// The value could not be parsed as the expected type.
    #[error("{var}={value:?} is not a valid {expected}")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("{var}={value} outside allowed range {min}..={max}")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("{var}={value:?} is not a log level (expected one of {})", LOG_LEVELS.join("/"))]
    InvalidLogLevel { var: String, value: String },
}

/// Truthy/falsy spellings accepted for flags. `None` for anything else.
pub(crate) fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

enum Lookup {
    Process,
    Map(HashMap<String, String>),
}

/// Reader for prefixed variables that accumulates errors instead of
/// stopping at the first one.
pub struct EnvParser {
    prefix: &'static str,
    lookup: Lookup,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Parser over the process environment.
    pub fn new() -> Self {
        Self {
            prefix: ENV_PREFIX,
            lookup: Lookup::Process,
            errors: Vec::new(),
        }
    }

    /// Parser over an explicit key/value source.
    ///
    /// Keys carry the full prefixed name, e.g. `ESHIFT_CANARY_ENABLED`.
    pub fn from_map<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            prefix: ENV_PREFIX,
            lookup: Lookup::Map(
                vars.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Drain the recorded errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Look up `name` (unprefixed). Returns the prefixed key and its value.
    fn lookup(&self, name: &str) -> (String, Option<String>) {
        let key = format!("{}{}", self.prefix, name);
        let value = match &self.lookup {
            Lookup::Process => env::var(&key).ok(),
            Lookup::Map(map) => map.get(&key).cloned(),
        };
        (key, value)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        match self.lookup(name) {
            (key, Some(value)) => Sourced::from_env(value, key),
            (_, None) => Sourced::default_value(default.to_string()),
        }
    }

    /// An empty value counts as explicitly unset.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match self.lookup(name) {
            (key, Some(value)) => Sourced::from_env(Some(value).filter(|v| !v.is_empty()), key),
            (_, None) => Sourced::default_value(None),
        }
    }

    /// Flag value; see [`parse_flag`] for accepted spellings.
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let (key, Some(raw)) = self.lookup(name) else {
            return Sourced::default_value(default);
        };
        let value = parse_flag(&raw).unwrap_or_else(|| {
            self.errors.push(EnvError::InvalidValue {
                var: key.clone(),
                expected: "flag (1/0, true/false, yes/no, on/off)".to_string(),
                value: raw.clone(),
            });
            default
        });
        Sourced::from_env(value, key)
    }

    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        self.get_in_range(name, default, min..=max, "unsigned 32-bit integer")
    }

    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        self.get_in_range(name, default, min..=max, "unsigned 64-bit integer")
    }

    pub fn get_f64_range(&mut self, name: &str, default: f64, min: f64, max: f64) -> Sourced<f64> {
        self.get_in_range(name, default, min..=max, "number")
    }

    /// Shared numeric getter. Unparseable values fall back to a default
    /// source; parseable but out-of-range ones keep the environment source
    /// so status output shows who set them.
    fn get_in_range<T>(
        &mut self,
        name: &str,
        default: T,
        range: std::ops::RangeInclusive<T>,
        expected: &str,
    ) -> Sourced<T>
    where
        T: FromStr + PartialOrd + Display + Copy,
    {
        let (key, Some(raw)) = self.lookup(name) else {
            return Sourced::default_value(default);
        };
        match raw.trim().parse::<T>() {
            Ok(n) if range.contains(&n) => Sourced::from_env(n, key),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var: key.clone(),
                    value: n.to_string(),
                    min: range.start().to_string(),
                    max: range.end().to_string(),
                });
                Sourced::from_env(default, key)
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: key,
                    expected: expected.to_string(),
                    value: raw,
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Path value; a leading `~/` expands to the home directory.
    pub fn get_path(&mut self, name: &str, default: &str) -> Sourced<PathBuf> {
        let (key, value) = self.lookup(name);
        let expand = |raw: &str| match (raw.strip_prefix("~/"), dirs::home_dir()) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(raw),
        };
        match value {
            Some(raw) => Sourced::from_env(expand(&raw), key),
            None => Sourced::default_value(expand(default)),
        }
    }

    /// Tracing level name, normalised to lowercase.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let (key, Some(raw)) = self.lookup(name) else {
            return Sourced::default_value(default.to_string());
        };
        let level = raw.trim().to_ascii_lowercase();
        if LOG_LEVELS.contains(&level.as_str()) {
            return Sourced::from_env(level, key);
        }
        self.errors.push(EnvError::InvalidLogLevel {
            var: key.clone(),
            value: raw,
        });
        Sourced::from_env(default.to_string(), key)
    }

    /// Manual routing override (`none`, `force_legacy`, `force_new`).
    pub fn get_override(&mut self, name: &str) -> Sourced<ManualOverride> {
        let (key, Some(raw)) = self.lookup(name) else {
            return Sourced::default_value(ManualOverride::None);
        };
        match raw.parse::<ManualOverride>() {
            Ok(parsed) => Sourced::from_env(parsed, key),
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: key,
                    expected: "override (none, force_legacy, force_new)".to_string(),
                    value: raw,
                });
                Sourced::default_value(ManualOverride::None)
            }
        }
    }

    /// Read every migration variable into a patch.
    ///
    /// Only explicitly set variables appear in the patch. Any parse error
    /// rejects the whole patch so a bad environment never half-applies.
    pub fn migration_patch(&mut self) -> Result<ConfigPatch, MigrationError> {
        let patch = ConfigPatch {
            new_engine_percentage: self
                .get_u32_range("NEW_PIPELINE_PERCENTAGE", 0, 0, 100)
                .explicit(),
            canary_enabled: self.get_bool("CANARY_ENABLED", false).explicit(),
            canary_sample_rate: self.get_u32_range("CANARY_SAMPLE_RATE", 0, 0, 100).explicit(),
            canary_timeout_secs: self
                .get_u64_range("CANARY_TIMEOUT_SECS", 1, 1, MAX_CANARY_TIMEOUT_SECS)
                .explicit(),
            circuit_breaker_enabled: self.get_bool("CIRCUIT_BREAKER_ENABLED", true).explicit(),
            error_threshold: self
                .get_u32_range("ERROR_THRESHOLD", 1, 1, u32::MAX)
                .explicit(),
            fallback_to_legacy_on_error: self.get_bool("FALLBACK_TO_LEGACY", true).explicit(),
            auto_rollback_enabled: self.get_bool("AUTO_ROLLBACK_ENABLED", true).explicit(),
            manual_override: self.get_override("MANUAL_OVERRIDE").explicit(),
            ..Default::default()
        };

        if self.has_errors() {
            let violations = self.take_errors().iter().map(ToString::to_string).collect();
            return Err(MigrationError::Configuration { violations });
        }
        Ok(patch)
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}
