//! Mock engine for tests and load simulation.
//!
//! Produces deterministic generated output, optionally after a delay, and
//! fails with a configurable probability. Call counts are tracked so tests
//! can assert which engine actually ran.

use crate::engine::{Engine, EngineError, ExecutionResult, GeneratedFile, RequestContext};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How a mock run ends.
#[derive(Debug, Clone, PartialEq)]
pub enum MockOutcome {
    /// Return the configured models and files.
    Succeed,
    /// Return `Err(EngineError)`.
    Raise(String),
    /// Return `Ok` with `success = false`.
    ReportFailure(String),
}

#[derive(Debug)]
pub struct MockEngine {
    name: String,
    models: Vec<String>,
    files: Vec<GeneratedFile>,
    delay: Duration,
    outcome: MockOutcome,
    /// Probability (0.0-1.0) of raising instead of the configured outcome.
    failure_rate: f64,
    rng: Mutex<fastrand::Rng>,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl MockEngine {
    pub fn builder(name: impl Into<String>) -> MockEngineBuilder {
        MockEngineBuilder::new(name)
    }

    /// An engine that always succeeds with a single `user` model.
    pub fn succeeding(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    /// An engine that always raises `message`.
    pub fn raising(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::builder(name)
            .outcome(MockOutcome::Raise(message.into()))
            .build()
    }

    /// Number of `execute` calls so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of calls that ended in failure.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    fn roll_failure(&self) -> bool {
        if self.failure_rate <= 0.0 {
            return false;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.f64() < self.failure_rate
    }
}

impl Engine for MockEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _context: &RequestContext) -> Result<ExecutionResult, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let outcome = if self.roll_failure() {
            MockOutcome::Raise(format!("{} injected failure", self.name))
        } else {
            self.outcome.clone()
        };

        match outcome {
            MockOutcome::Succeed => {
                let mut result = ExecutionResult::success(self.models.clone(), self.files.clone());
                result.execution_time_seconds = start.elapsed().as_secs_f64();
                Ok(result)
            }
            MockOutcome::Raise(message) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::new(message))
            }
            MockOutcome::ReportFailure(message) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                let mut result = ExecutionResult::failure(vec![message]);
                result.execution_time_seconds = start.elapsed().as_secs_f64();
                Ok(result)
            }
        }
    }

    fn statistics(&self) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::from([
            ("calls".to_string(), self.calls().into()),
            ("failures".to_string(), self.failures().into()),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct MockEngineBuilder {
    name: String,
    models: Vec<String>,
    files: Vec<GeneratedFile>,
    delay: Duration,
    outcome: MockOutcome,
    failure_rate: f64,
    seed: u64,
}

impl MockEngineBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            models: vec!["user".to_string()],
            files: vec![GeneratedFile::new(
                "models/user.rb",
                "class User\n  attribute :id\nend\n",
            )],
            delay: Duration::ZERO,
            outcome: MockOutcome::Succeed,
            failure_rate: 0.0,
            seed: 0x5eed,
        }
    }

    pub fn models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn files(mut self, files: Vec<GeneratedFile>) -> Self {
        self.files = files;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn outcome(mut self, outcome: MockOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> MockEngine {
        MockEngine {
            name: self.name,
            models: self.models,
            files: self.files,
            delay: self.delay,
            outcome: self.outcome,
            failure_rate: self.failure_rate,
            rng: Mutex::new(fastrand::Rng::with_seed(self.seed)),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}
