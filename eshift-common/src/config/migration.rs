//! Migration settings and all-or-nothing patching.

use crate::errors::MigrationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CANARY_SAMPLE_RATE: u32 = 10;
pub const DEFAULT_CANARY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ERROR_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_WINDOW_SECS: u64 = 60;
pub const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 30;
pub const DEFAULT_PERFORMANCE_BUFFER: usize = 1000;
pub const DEFAULT_RECOVERY_MAX_ATTEMPTS: u32 = 3;
pub const MAX_CANARY_TIMEOUT_SECS: u64 = 3600;
/// Upper bound for the breaker window and cool-down.
pub const MAX_BREAKER_PERIOD_SECS: u64 = 86_400;

/// Operator override that pins routing to one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualOverride {
    #[default]
    None,
    ForceLegacy,
    ForceNew,
}

impl fmt::Display for ManualOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::ForceLegacy => write!(f, "force_legacy"),
            Self::ForceNew => write!(f, "force_new"),
        }
    }
}

impl FromStr for ManualOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "" | "none" | "off" => Ok(Self::None),
            "force_legacy" | "legacy" => Ok(Self::ForceLegacy),
            "force_new" | "new" | "candidate" => Ok(Self::ForceNew),
            other => Err(format!("unknown override '{other}'")),
        }
    }
}

/// Validated migration settings.
///
/// Instances held by `FeatureFlags` are immutable; changes go through
/// [`ConfigPatch`] and replace the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Share of non-canary traffic routed to the candidate engine (0-100).
    pub new_engine_percentage: u32,
    pub canary_enabled: bool,
    /// Share of requests sampled into canary comparison (0-100).
    pub canary_sample_rate: u32,
    pub canary_timeout_secs: u64,
    pub circuit_breaker_enabled: bool,
    /// Candidate errors inside the window that open the breaker.
    pub error_threshold: u32,
    pub breaker_window_secs: u64,
    /// Time the breaker stays open before admitting a half-open probe.
    pub breaker_cooldown_secs: u64,
    /// Consecutive successful probes needed to close a half-open breaker.
    pub half_open_success_threshold: u32,
    pub fallback_to_legacy_on_error: bool,
    pub auto_rollback_enabled: bool,
    pub manual_override: ManualOverride,
    /// Capacity of the performance sample ring buffer.
    pub performance_buffer_capacity: usize,
    /// Consecutive failed recoveries allowed before recovery is refused.
    pub recovery_max_attempts: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            new_engine_percentage: 0,
            canary_enabled: false,
            canary_sample_rate: DEFAULT_CANARY_SAMPLE_RATE,
            canary_timeout_secs: DEFAULT_CANARY_TIMEOUT_SECS,
            circuit_breaker_enabled: true,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            breaker_window_secs: DEFAULT_BREAKER_WINDOW_SECS,
            breaker_cooldown_secs: DEFAULT_BREAKER_COOLDOWN_SECS,
            half_open_success_threshold: 1,
            fallback_to_legacy_on_error: true,
            auto_rollback_enabled: true,
            manual_override: ManualOverride::None,
            performance_buffer_capacity: DEFAULT_PERFORMANCE_BUFFER,
            recovery_max_attempts: DEFAULT_RECOVERY_MAX_ATTEMPTS,
        }
    }
}

impl MigrationConfig {
    /// Check every constraint, reporting all violations at once.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let mut violations = Vec::new();

        if self.new_engine_percentage > 100 {
            violations.push(format!(
                "new_engine_percentage must be within 0..=100, got {}",
                self.new_engine_percentage
            ));
        }
        if self.canary_sample_rate > 100 {
            violations.push(format!(
                "canary_sample_rate must be within 0..=100, got {}",
                self.canary_sample_rate
            ));
        }
        if !(1..=MAX_CANARY_TIMEOUT_SECS).contains(&self.canary_timeout_secs) {
            violations.push(format!(
                "canary_timeout_secs must be within 1..={MAX_CANARY_TIMEOUT_SECS}, got {}",
                self.canary_timeout_secs
            ));
        }
        if self.error_threshold == 0 {
            violations.push("error_threshold must be at least 1".to_string());
        }
        if !(1..=MAX_BREAKER_PERIOD_SECS).contains(&self.breaker_window_secs) {
            violations.push(format!(
                "breaker_window_secs must be within 1..={MAX_BREAKER_PERIOD_SECS}, got {}",
                self.breaker_window_secs
            ));
        }
        if self.breaker_cooldown_secs > MAX_BREAKER_PERIOD_SECS {
            violations.push(format!(
                "breaker_cooldown_secs must be at most {MAX_BREAKER_PERIOD_SECS}, got {}",
                self.breaker_cooldown_secs
            ));
        }
        if self.half_open_success_threshold == 0 {
            violations.push("half_open_success_threshold must be at least 1".to_string());
        }
        if self.performance_buffer_capacity == 0 {
            violations.push("performance_buffer_capacity must be at least 1".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::Configuration { violations })
        }
    }

    /// Clamped to the validated bound even for a hand-built config.
    pub fn canary_timeout(&self) -> Duration {
        Duration::from_secs(self.canary_timeout_secs.clamp(1, MAX_CANARY_TIMEOUT_SECS))
    }

    pub fn breaker_window(&self) -> Duration {
        Duration::from_secs(self.breaker_window_secs.min(MAX_BREAKER_PERIOD_SECS))
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs.min(MAX_BREAKER_PERIOD_SECS))
    }
}

/// A partial configuration change. Unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub new_engine_percentage: Option<u32>,
    pub canary_enabled: Option<bool>,
    pub canary_sample_rate: Option<u32>,
    pub canary_timeout_secs: Option<u64>,
    pub circuit_breaker_enabled: Option<bool>,
    pub error_threshold: Option<u32>,
    pub breaker_window_secs: Option<u64>,
    pub breaker_cooldown_secs: Option<u64>,
    pub half_open_success_threshold: Option<u32>,
    pub fallback_to_legacy_on_error: Option<bool>,
    pub auto_rollback_enabled: Option<bool>,
    pub manual_override: Option<ManualOverride>,
    pub performance_buffer_capacity: Option<usize>,
    pub recovery_max_attempts: Option<u32>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fields in `other` win over fields in `self`.
    pub fn merge(mut self, other: ConfigPatch) -> ConfigPatch {
        macro_rules! take {
            ($($field:ident),*) => {
                $( if other.$field.is_some() { self.$field = other.$field; } )*
            };
        }
        take!(
            new_engine_percentage,
            canary_enabled,
            canary_sample_rate,
            canary_timeout_secs,
            circuit_breaker_enabled,
            error_threshold,
            breaker_window_secs,
            breaker_cooldown_secs,
            half_open_success_threshold,
            fallback_to_legacy_on_error,
            auto_rollback_enabled,
            manual_override,
            performance_buffer_capacity,
            recovery_max_attempts
        );
        self
    }

    /// Apply onto `base` and validate the result. `base` is never touched.
    pub fn apply(&self, base: &MigrationConfig) -> Result<MigrationConfig, MigrationError> {
        let mut next = base.clone();
        macro_rules! set {
            ($($field:ident),*) => {
                $( if let Some(value) = self.$field { next.$field = value; } )*
            };
        }
        set!(
            new_engine_percentage,
            canary_enabled,
            canary_sample_rate,
            canary_timeout_secs,
            circuit_breaker_enabled,
            error_threshold,
            breaker_window_secs,
            breaker_cooldown_secs,
            half_open_success_threshold,
            fallback_to_legacy_on_error,
            auto_rollback_enabled,
            manual_override,
            performance_buffer_capacity,
            recovery_max_attempts
        );
        next.validate()?;
        Ok(next)
    }
}
