//! Per-request orchestration between the legacy and candidate engines.
//!
//! `MigrationAdapter::execute` takes one routing decision per request and
//! then runs exactly one of:
//!
//! - **canary**: both engines concurrently, legacy result returned; the
//!   candidate runs under a deadline and only feeds breaker and statistics.
//! - **candidate**: candidate first, legacy as fallback when enabled.
//! - **legacy**: legacy only.
//!
//! Engine errors never escape; callers always receive `{success, errors}`.

use crate::breaker::CircuitState;
use crate::comparator::{ComparisonResult, OutputComparator};
use crate::config::{MAX_CANARY_TIMEOUT_SECS, MigrationConfig};
use crate::engine::{Engine, EngineError, EngineKind, ExecutionResult, RequestContext};
use crate::errors::{ErrorCode, MigrationError};
use crate::events::MigrationEvent;
use crate::flags::{FeatureFlags, RoutingDecision};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Metadata attached to every adapter result.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationMetadata {
    pub execution_id: String,
    pub request_id: String,
    pub used_candidate: bool,
    pub was_canary_test: bool,
    /// Candidate failed and the legacy engine produced the result.
    pub fallback_used: bool,
    pub circuit_breaker_state_at_decision: CircuitState,
    pub config_snapshot: MigrationConfig,
    /// Present when a canary candidate finished within its deadline.
    pub canary_comparison: Option<ComparisonResult>,
}

/// An engine result plus how it was obtained.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedResult {
    #[serde(flatten)]
    pub result: ExecutionResult,
    pub migration_metadata: MigrationMetadata,
}

/// Best-effort sink for finished executions (metrics export, audit log).
///
/// Called on a blocking worker after the result is built; it can neither
/// delay nor fail the request.
pub trait ExecutionReporter: Send + Sync + 'static {
    fn report(&self, result: &EnrichedResult);
}

/// Snapshot of adapter-local counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdapterStatistics {
    pub executions_total: u64,
    pub executions_legacy: u64,
    pub executions_candidate: u64,
    pub canary_executions: u64,
    pub fallbacks: u64,
    pub candidate_failures: u64,
    pub forced_executions: u64,
    pub legacy_engine: BTreeMap<String, serde_json::Value>,
    pub candidate_engine: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    legacy: AtomicU64,
    candidate: AtomicU64,
    canary: AtomicU64,
    fallbacks: AtomicU64,
    candidate_failures: AtomicU64,
    forced: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outcome of one engine run, after error classification.
struct EngineRun {
    result: Result<ExecutionResult, EngineError>,
    elapsed_seconds: f64,
}

impl EngineRun {
    /// `Some(detail)` when the run failed, raised or reported failure.
    fn failure_detail(&self) -> Option<String> {
        match &self.result {
            Ok(result) if result.success => None,
            Ok(result) => Some(result.error_summary()),
            Err(err) => Some(err.message.clone()),
        }
    }

    fn into_result(self, engine: EngineKind) -> ExecutionResult {
        match self.result {
            Ok(mut result) => {
                if result.execution_time_seconds == 0.0 {
                    result.execution_time_seconds = self.elapsed_seconds;
                }
                result
            }
            Err(err) => {
                let wrapped = MigrationError::EngineExecution {
                    engine,
                    message: err.message,
                };
                let mut result = ExecutionResult::failure(vec![wrapped.to_string()]);
                result.execution_time_seconds = self.elapsed_seconds;
                result
            }
        }
    }

    fn time_seconds(&self) -> f64 {
        match &self.result {
            Ok(result) if result.execution_time_seconds > 0.0 => result.execution_time_seconds,
            _ => self.elapsed_seconds,
        }
    }
}

pub struct MigrationAdapter {
    legacy: Arc<dyn Engine>,
    candidate: Arc<dyn Engine>,
    flags: Arc<FeatureFlags>,
    comparator: OutputComparator,
    reporter: Option<Arc<dyn ExecutionReporter>>,
    counters: Counters,
}

impl MigrationAdapter {
    pub fn new(legacy: Arc<dyn Engine>, candidate: Arc<dyn Engine>, flags: Arc<FeatureFlags>) -> Self {
        Self {
            legacy,
            candidate,
            flags,
            comparator: OutputComparator::default(),
            reporter: None,
            counters: Counters::default(),
        }
    }

    pub fn with_comparator(mut self, comparator: OutputComparator) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ExecutionReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn flags(&self) -> &Arc<FeatureFlags> {
        &self.flags
    }

    /// Run one request. `None` runs with a minimal generated context.
    pub async fn execute(&self, context: Option<RequestContext>) -> EnrichedResult {
        let context = normalize_context(context);
        let decision = self.flags.routing_decision(&context.request_id);
        Counters::bump(&self.counters.total);

        let enriched = if decision.is_canary {
            self.execute_canary(&context, &decision).await
        } else if decision.use_candidate {
            self.execute_candidate(&context, &decision).await
        } else {
            self.execute_legacy(&context, &decision).await
        };

        self.report(&enriched);
        enriched
    }

    /// Run a specific engine regardless of routing.
    ///
    /// Requesting the candidate while the breaker is open fails unless
    /// `bypass_circuit_breaker` is set. Outcomes still feed the breaker.
    pub async fn force_execute_system(
        &self,
        engine: EngineKind,
        bypass_circuit_breaker: bool,
        context: Option<RequestContext>,
    ) -> Result<EnrichedResult, MigrationError> {
        let context = normalize_context(context);
        let state = self.flags.circuit_breaker_state();
        if engine == EngineKind::Candidate && state == CircuitState::Open && !bypass_circuit_breaker
        {
            return Err(MigrationError::Migration {
                code: ErrorCode::RoutingBreakerOpen,
                message: "circuit breaker is open; pass bypass_circuit_breaker to force the candidate engine"
                    .to_string(),
            });
        }

        if bypass_circuit_breaker {
            warn!(
                request_id = %context.request_id,
                "Forcing {} engine with circuit breaker {}", engine, state
            );
        } else {
            info!(request_id = %context.request_id, "Forcing {} engine", engine);
        }

        Counters::bump(&self.counters.total);
        Counters::bump(&self.counters.forced);
        let run = self.run(engine, &context).await;
        self.record(engine, &run);
        match engine {
            EngineKind::Legacy => Counters::bump(&self.counters.legacy),
            EngineKind::Candidate => {
                Counters::bump(&self.counters.candidate);
                if run.failure_detail().is_some() {
                    Counters::bump(&self.counters.candidate_failures);
                }
            }
        }

        let config = self.flags.config();
        let enriched = EnrichedResult {
            result: run.into_result(engine),
            migration_metadata: MigrationMetadata {
                execution_id: Uuid::new_v4().to_string(),
                request_id: context.request_id.clone(),
                used_candidate: engine == EngineKind::Candidate,
                was_canary_test: false,
                fallback_used: false,
                circuit_breaker_state_at_decision: state,
                config_snapshot: config.as_ref().clone(),
                canary_comparison: None,
            },
        };
        self.report(&enriched);
        Ok(enriched)
    }

    pub fn statistics(&self) -> AdapterStatistics {
        let c = &self.counters;
        AdapterStatistics {
            executions_total: c.total.load(Ordering::Relaxed),
            executions_legacy: c.legacy.load(Ordering::Relaxed),
            executions_candidate: c.candidate.load(Ordering::Relaxed),
            canary_executions: c.canary.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            candidate_failures: c.candidate_failures.load(Ordering::Relaxed),
            forced_executions: c.forced.load(Ordering::Relaxed),
            legacy_engine: self.legacy.statistics(),
            candidate_engine: self.candidate.statistics(),
        }
    }

    async fn execute_legacy(&self, context: &RequestContext, decision: &RoutingDecision) -> EnrichedResult {
        Counters::bump(&self.counters.legacy);
        let run = self.run(EngineKind::Legacy, context).await;
        self.record(EngineKind::Legacy, &run);
        self.enrich(run.into_result(EngineKind::Legacy), decision, false, false, None)
    }

    async fn execute_candidate(
        &self,
        context: &RequestContext,
        decision: &RoutingDecision,
    ) -> EnrichedResult {
        let run = self.run(EngineKind::Candidate, context).await;
        self.record(EngineKind::Candidate, &run);

        let Some(detail) = run.failure_detail() else {
            Counters::bump(&self.counters.candidate);
            return self.enrich(run.into_result(EngineKind::Candidate), decision, true, false, None);
        };
        Counters::bump(&self.counters.candidate_failures);

        if decision.config.fallback_to_legacy_on_error {
            warn!(
                request_id = %context.request_id,
                "Candidate engine failed, falling back to legacy: {}", detail
            );
            Counters::bump(&self.counters.fallbacks);
            Counters::bump(&self.counters.legacy);
            let legacy = self.run(EngineKind::Legacy, context).await;
            self.record(EngineKind::Legacy, &legacy);
            return self.enrich(legacy.into_result(EngineKind::Legacy), decision, false, true, None);
        }

        warn!(
            request_id = %context.request_id,
            "Candidate engine failed and fallback is disabled: {}", detail
        );
        Counters::bump(&self.counters.candidate);
        let mut failed = ExecutionResult::failure(vec![format!("New pipeline failed: {detail}")]);
        failed.execution_time_seconds = run.time_seconds();
        self.enrich(failed, decision, true, false, None)
    }

    async fn execute_canary(&self, context: &RequestContext, decision: &RoutingDecision) -> EnrichedResult {
        Counters::bump(&self.counters.canary);
        Counters::bump(&self.counters.legacy);

        let timeout = decision.config.canary_timeout();
        let started = tokio::time::Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + Duration::from_secs(MAX_CANARY_TIMEOUT_SECS));
        let mut candidate = self.spawn_engine(EngineKind::Candidate, context);
        let legacy = self.run(EngineKind::Legacy, context).await;
        self.record(EngineKind::Legacy, &legacy);

        let comparison = match tokio::time::timeout_at(deadline, &mut candidate).await {
            Ok(joined) => {
                let run = joined_run(joined);
                self.record(EngineKind::Candidate, &run);
                Some(self.compare_canary(context, &legacy, &run))
            }
            Err(_) => {
                warn!(
                    request_id = %context.request_id,
                    "Canary candidate exceeded {:?}; returning legacy result", timeout
                );
                self.flags.record_candidate_timeout(timeout.as_secs());
                record_late_outcome(Arc::clone(&self.flags), candidate);
                None
            }
        };

        self.enrich(legacy.into_result(EngineKind::Legacy), decision, false, false, comparison)
    }

    fn compare_canary(
        &self,
        context: &RequestContext,
        legacy: &EngineRun,
        candidate: &EngineRun,
    ) -> ComparisonResult {
        let legacy_result = clone_result(legacy, EngineKind::Legacy);
        let candidate_result = clone_result(candidate, EngineKind::Candidate);
        let comparison = self.comparator.compare(&legacy_result, &candidate_result);

        self.flags.record_comparison(comparison.overall_match);
        self.flags
            .record_performance(legacy.time_seconds(), candidate.time_seconds());
        self.flags.events().emit(MigrationEvent::CanaryCompared {
            request_id: context.request_id.clone(),
            overall_match: comparison.overall_match,
            critical: comparison.critical_discrepancies.len(),
            warnings: comparison.warning_discrepancies.len(),
        });

        if comparison.overall_match {
            debug!(request_id = %context.request_id, "Canary matched: {}", comparison.summary());
        } else {
            warn!(request_id = %context.request_id, "Canary mismatch: {}", comparison.summary());
            for d in &comparison.critical_discrepancies {
                warn!(request_id = %context.request_id, "  {:?}: {}", d.kind, d.description);
            }
        }
        comparison
    }

    fn engine(&self, kind: EngineKind) -> Arc<dyn Engine> {
        match kind {
            EngineKind::Legacy => Arc::clone(&self.legacy),
            EngineKind::Candidate => Arc::clone(&self.candidate),
        }
    }

    fn spawn_engine(&self, kind: EngineKind, context: &RequestContext) -> JoinHandle<EngineRun> {
        let engine = self.engine(kind);
        let context = context.clone();
        tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let result = engine.execute(&context);
            EngineRun {
                result,
                elapsed_seconds: start.elapsed().as_secs_f64(),
            }
        })
    }

    async fn run(&self, kind: EngineKind, context: &RequestContext) -> EngineRun {
        joined_run(self.spawn_engine(kind, context).await)
    }

    fn record(&self, kind: EngineKind, run: &EngineRun) {
        match run.failure_detail() {
            None => self.flags.record_success(kind),
            Some(detail) => self.flags.record_error(kind, &detail),
        }
    }

    fn enrich(
        &self,
        result: ExecutionResult,
        decision: &RoutingDecision,
        used_candidate: bool,
        fallback_used: bool,
        canary_comparison: Option<ComparisonResult>,
    ) -> EnrichedResult {
        EnrichedResult {
            result,
            migration_metadata: MigrationMetadata {
                execution_id: Uuid::new_v4().to_string(),
                request_id: decision.request_id.clone(),
                used_candidate,
                was_canary_test: decision.is_canary,
                fallback_used,
                circuit_breaker_state_at_decision: decision.circuit_state,
                config_snapshot: decision.config.as_ref().clone(),
                canary_comparison,
            },
        }
    }

    fn report(&self, enriched: &EnrichedResult) {
        let Some(reporter) = self.reporter.clone() else {
            return;
        };
        let enriched = enriched.clone();
        // Fire and forget: a slow or panicking reporter cannot affect the caller.
        drop(tokio::task::spawn_blocking(move || reporter.report(&enriched)));
    }
}

/// Await a canary candidate that outlived its deadline.
///
/// The timeout already charged the breaker once, so the late outcome is
/// only counted and logged.
fn record_late_outcome(flags: Arc<FeatureFlags>, handle: JoinHandle<EngineRun>) {
    tokio::spawn(async move {
        let run = joined_run(handle.await);
        let detail = run.failure_detail();
        if let Some(detail) = &detail {
            warn!("Late canary candidate failed: {}", detail);
        }
        flags.record_late_completion(detail.is_some());
    });
}

fn joined_run(joined: Result<EngineRun, tokio::task::JoinError>) -> EngineRun {
    joined.unwrap_or_else(|err| EngineRun {
        result: Err(EngineError::new(format!("engine task aborted: {err}"))),
        elapsed_seconds: 0.0,
    })
}

fn clone_result(run: &EngineRun, kind: EngineKind) -> ExecutionResult {
    EngineRun {
        result: run.result.clone(),
        elapsed_seconds: run.elapsed_seconds,
    }
    .into_result(kind)
}

fn normalize_context(context: Option<RequestContext>) -> RequestContext {
    match context {
        Some(ctx) if !ctx.request_id.trim().is_empty() => ctx,
        Some(ctx) => RequestContext {
            request_id: Uuid::new_v4().to_string(),
            ..ctx
        },
        None => RequestContext::default(),
    }
}
