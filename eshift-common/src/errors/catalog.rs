//! Operator-facing error codes.
//!
//! Codes render as `ESHIFT-Exxx`. The hundreds digit picks the category:
//! 0 config, 1 routing, 2 engine, 3 persistence.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable operator-facing error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // config, E001-E099
    /// A configuration value failed validation
    ConfigValidationError,
    /// An environment variable could not be parsed
    ConfigEnvError,
    /// The configuration file could not be read or parsed
    ConfigFileError,

    // routing, E100-E199
    /// Forced candidate execution while the circuit breaker is open
    RoutingBreakerOpen,
    /// Recovery refused because the retry budget is exhausted
    RoutingRecoveryExhausted,

    // engine, E200-E299
    /// An engine returned an error or panicked
    EngineFailed,
    /// The candidate engine exceeded the canary timeout
    EngineTimeout,

    // persistence, E300-E399
    /// The rollback state file could not be read
    StateReadError,
    /// The rollback state file could not be written
    StateWriteError,
}

/// Catalog row: number, message, remediation steps.
struct Row(u16, &'static str, &'static [&'static str]);

impl ErrorCode {
    pub fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigValidationError,
            Self::ConfigEnvError,
            Self::ConfigFileError,
            Self::RoutingBreakerOpen,
            Self::RoutingRecoveryExhausted,
            Self::EngineFailed,
            Self::EngineTimeout,
            Self::StateReadError,
            Self::StateWriteError,
        ]
    }

    const fn row(&self) -> Row {
        match self {
            Self::ConfigValidationError => Row(
                1,
                "Migration settings rejected",
                &[
                    "Keep percentages and sample rates within 0..=100",
                    "Use at least 1 for the error threshold, timeouts and buffer capacity",
                ],
            ),
            Self::ConfigEnvError => Row(
                2,
                "ESHIFT_* variable could not be parsed",
                &["Run `env | grep ESHIFT_` and fix the listed variables"],
            ),
            Self::ConfigFileError => Row(
                3,
                "Config file unreadable or not valid TOML",
                &[
                    "Validate the file with a TOML linter",
                    "Put migration keys under a [migration] table",
                ],
            ),
            Self::RoutingBreakerOpen => Row(
                100,
                "Candidate run refused: circuit breaker is open",
                &[
                    "Wait for the cool-down, or move the breaker to half-open with `eshift reset-breaker`",
                    "Call force_execute_system with bypass_circuit_breaker=true to run it anyway",
                ],
            ),
            Self::RoutingRecoveryExhausted => Row(
                101,
                "No recovery attempts left",
                &[
                    "Check `eshift status` for the last failed recovery step",
                    "Clear the counter with an emergency rollback or `eshift reset-breaker`",
                ],
            ),
            Self::EngineFailed => Row(
                200,
                "Engine run failed",
                &["See the errors list of the returned execution result"],
            ),
            Self::EngineTimeout => Row(
                201,
                "Candidate did not finish before the canary deadline",
                &["Raise ESHIFT_CANARY_TIMEOUT_SECS or profile the candidate engine"],
            ),
            Self::StateReadError => Row(
                300,
                "Rollback state file unreadable",
                &[
                    "Check the file's permissions",
                    "An unparseable file is ignored and the manager starts healthy",
                ],
            ),
            Self::StateWriteError => Row(
                301,
                "Rollback state file could not be replaced",
                &["Check free space and write permission on the state directory"],
            ),
        }
    }

    #[must_use]
    pub const fn code_number(&self) -> u16 {
        self.row().0
    }

    /// `ESHIFT-E` followed by the zero-padded number.
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("ESHIFT-E{:03}", self.code_number())
    }

    /// Derived from the hundreds digit of the number.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() / 100 {
            0 => ErrorCategory::Config,
            1 => ErrorCategory::Routing,
            2 => ErrorCategory::Engine,
            _ => ErrorCategory::Persistence,
        }
    }

    #[must_use]
    pub const fn message(&self) -> &'static str {
        self.row().1
    }

    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        self.row().2
    }

    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self.remediation().iter().map(ToString::to_string).collect(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code_string(), self.message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Config,
    Routing,
    Engine,
    Persistence,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Config => "config",
            Self::Routing => "routing",
            Self::Engine => "engine",
            Self::Persistence => "persistence",
        })
    }
}

/// Serializable catalog entry for CLI output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Code and message on one line, then numbered remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let steps: Vec<String> = self
            .remediation
            .iter()
            .enumerate()
            .map(|(i, step)| format!("  {}. {step}", i + 1))
            .collect();
        if steps.is_empty() {
            format!("[{}] {} ({})", self.code, self.message, self.category)
        } else {
            format!(
                "[{}] {} ({})\nTry:\n{}",
                self.code,
                self.message,
                self.category,
                steps.join("\n")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn numbers_are_unique() {
        let numbers: HashSet<u16> = ErrorCode::all().iter().map(ErrorCode::code_number).collect();
        assert_eq!(numbers.len(), ErrorCode::all().len());
    }

    #[test]
    fn code_strings_are_zero_padded() {
        assert_eq!(ErrorCode::ConfigValidationError.code_string(), "ESHIFT-E001");
        assert_eq!(ErrorCode::StateWriteError.code_string(), "ESHIFT-E301");
    }

    #[test]
    fn category_follows_hundreds_digit() {
        assert_eq!(ErrorCode::ConfigEnvError.category(), ErrorCategory::Config);
        assert_eq!(ErrorCode::RoutingBreakerOpen.category(), ErrorCategory::Routing);
        assert_eq!(ErrorCode::EngineTimeout.category(), ErrorCategory::Engine);
        assert_eq!(ErrorCode::StateReadError.category(), ErrorCategory::Persistence);
    }

    #[test]
    fn every_code_suggests_a_fix() {
        for code in ErrorCode::all() {
            assert!(!code.remediation().is_empty(), "{code:?} lacks remediation");
        }
    }

    #[test]
    fn format_full_lists_numbered_steps() {
        let text = ErrorCode::RoutingBreakerOpen.entry().format_full();
        assert!(text.starts_with("[ESHIFT-E100]"));
        assert!(text.contains("(routing)"));
        assert!(text.contains("\n  1. "));
        assert!(text.contains("\n  2. "));
    }
}
