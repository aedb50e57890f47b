//! Error types for Engine Shift.
//!
//! [`MigrationError`] is the single library error. Engine failures never
//! escape `MigrationAdapter::execute`; they are converted into recorded
//! breaker events plus a fallback or a structured failure result.

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

use crate::engine::EngineKind;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the migration control layer.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Invalid settings. The whole change is rejected; nothing is applied.
    #[error("invalid configuration: {}", .violations.join("; "))]
    Configuration { violations: Vec<String> },

    /// Operator-facing misuse of the routing controls.
    #[error("{message}")]
    Migration { code: ErrorCode, message: String },

    /// Any error raised by an engine.
    #[error("{engine} engine failed: {message}")]
    EngineExecution { engine: EngineKind, message: String },

    /// The rollback state file could not be read or written.
    #[error("rollback state at {}: {message}", .path.display())]
    Persistence {
        code: ErrorCode,
        path: PathBuf,
        message: String,
    },
}

impl MigrationError {
    /// Build a configuration error from a single violation.
    pub fn config(violation: impl Into<String>) -> Self {
        Self::Configuration {
            violations: vec![violation.into()],
        }
    }

    /// Catalog code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration { .. } => ErrorCode::ConfigValidationError,
            Self::Migration { code, .. } => *code,
            Self::EngineExecution { .. } => ErrorCode::EngineFailed,
            Self::Persistence { code, .. } => *code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_lists_every_violation() {
        let err = MigrationError::Configuration {
            violations: vec!["a out of range".into(), "b out of range".into()],
        };
        assert_eq!(
            err.to_string(),
            "invalid configuration: a out of range; b out of range"
        );
        assert_eq!(err.code(), ErrorCode::ConfigValidationError);
    }

    #[test]
    fn engine_error_names_the_engine() {
        let err = MigrationError::EngineExecution {
            engine: EngineKind::Candidate,
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "candidate engine failed: boom");
    }

    #[test]
    fn persistence_error_carries_its_code() {
        let err = MigrationError::Persistence {
            code: ErrorCode::StateWriteError,
            path: PathBuf::from("/tmp/state.json"),
            message: "disk full".into(),
        };
        assert_eq!(err.code(), ErrorCode::StateWriteError);
        assert!(err.to_string().contains("/tmp/state.json"));
    }
}
