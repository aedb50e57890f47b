//! Source tracking for configuration values.

use serde::Serialize;
use std::fmt;

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Built-in default.
    Default,
    /// `ESHIFT_*` environment variable (or an injected key/value source).
    Environment,
    /// TOML configuration file.
    ConfigFile,
    /// Runtime `configure` call.
    Runtime,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Environment => write!(f, "environment"),
            Self::ConfigFile => write!(f, "config file"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}

/// A value paired with its source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Variable name when the value came from the environment.
    pub env_var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            env_var: None,
        }
    }

    pub fn from_env(value: T, env_var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            env_var: Some(env_var.into()),
        }
    }

    /// True when the value was explicitly provided by the environment.
    pub fn is_set(&self) -> bool {
        self.source == ConfigSource::Environment
    }

    /// The value when explicitly set, `None` when it is only a default.
    pub fn explicit(self) -> Option<T> {
        if self.is_set() { Some(self.value) } else { None }
    }
}
