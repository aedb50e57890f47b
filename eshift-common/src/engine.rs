//! Engine collaborator contract and the result types it produces.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Which engine a request ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// The existing, trusted implementation.
    Legacy,
    /// The implementation being adopted.
    Candidate,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::Candidate => write!(f, "candidate"),
        }
    }
}

/// A file produced by an engine run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Outcome of one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExecutionResult {
    pub success: bool,
    pub generated_models: Vec<String>,
    pub generated_files: Vec<GeneratedFile>,
    pub errors: Vec<String>,
    pub execution_time_seconds: f64,
    pub statistics: BTreeMap<String, serde_json::Value>,
}

impl ExecutionResult {
    /// A successful result with the given models and files.
    pub fn success(models: Vec<String>, files: Vec<GeneratedFile>) -> Self {
        Self {
            success: true,
            generated_models: models,
            generated_files: files,
            ..Default::default()
        }
    }

    /// A failed result carrying the given errors.
    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
            ..Default::default()
        }
    }

    /// Error detail for logs and breaker records.
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            "engine reported failure without detail".to_string()
        } else {
            self.errors.join("; ")
        }
    }
}

/// Per-request input handed to the engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    /// Opaque schema or input reference understood by the engines.
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            schema: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

impl Default for RequestContext {
    /// Minimal context with a generated request id.
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

/// Error raised by an engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An execution engine: the legacy or the candidate code generator.
///
/// Implementations are called from blocking worker threads and may take
/// arbitrarily long; the adapter enforces timeouts around them.
pub trait Engine: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run the engine for one request.
    fn execute(&self, context: &RequestContext) -> Result<ExecutionResult, EngineError>;

    /// Optional engine-specific counters.
    fn statistics(&self) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::new()
    }
}
