//! Subcommand handlers. Each returns `Ok(false)` when the operation ran
//! but did not succeed, so `main` can set the exit code.

use anyhow::{Context as _, Result, bail};
use directories::ProjectDirs;
use eshift_common::config::{ConfigPatch, EnvParser, MigrationConfig, default_config_path};
use eshift_common::flags::{FeatureFlags, SeededRandom};
use eshift_common::logging::init_logging;
use eshift_common::mock_engine::MockEngine;
use eshift_common::rollback::{
    FileStateStore, MemoryStateStore, RollbackOutcome, StateStore, default_state_path,
};
use eshift_common::status::HealthStatus;
use eshift_common::{
    AdapterStatistics, ErrorCode, MigrationSystem, PerformanceStatistics, RequestContext,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

pub struct Context {
    pub json: bool,
    pub flags: Arc<FeatureFlags>,
    pub state_path: PathBuf,
}

impl Context {
    /// Resolve logging, configuration and the state file location.
    ///
    /// Precedence: defaults, then the config file, then `ESHIFT_*`.
    pub fn load(
        config_path: Option<PathBuf>,
        state_file: Option<PathBuf>,
        json: bool,
        verbose: bool,
    ) -> Result<Self> {
        let mut env = EnvParser::new();
        let level = env.get_log_level("LOG_LEVEL", "warn");
        let log_json = env.get_bool("LOG_JSON", false);
        let state_env = env.get_path("STATE_FILE", "");
        if env.has_errors() {
            let errors: Vec<String> = env.take_errors().iter().map(ToString::to_string).collect();
            bail!(
                "[{}] invalid environment: {}",
                ErrorCode::ConfigEnvError.code_string(),
                errors.join("; ")
            );
        }

        let level = if verbose { "debug".to_string() } else { level.value };
        init_logging(&level, log_json.value);

        let flags = Arc::new(FeatureFlags::new(MigrationConfig::default())?);
        if let Some(path) = config_path.or_else(default_config_file) {
            flags
                .configure_from_file(&path)
                .with_context(|| format!("Failed to apply config file {:?}", path))?;
        }
        flags
            .configure_from_environment()
            .context("Failed to apply ESHIFT_* environment")?;

        let state_path = state_file
            .or_else(|| state_env.explicit())
            .unwrap_or_else(default_state_file);
        debug!("Using rollback state file {:?}", state_path);

        Ok(Self::new(flags, state_path, json))
    }

    pub fn new(flags: Arc<FeatureFlags>, state_path: PathBuf, json: bool) -> Self {
        Self {
            json,
            flags,
            state_path,
        }
    }

    fn system(&self) -> MigrationSystem {
        let (legacy, candidate) = demo_engines(0.0, 0);
        MigrationSystem::from_flags(
            Arc::clone(&self.flags),
            legacy,
            candidate,
            Arc::new(FileStateStore::new(&self.state_path)),
        )
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "eshift")
}

fn default_state_file() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_local_dir().join("rollback_state.json"))
        .unwrap_or_else(default_state_path)
}

fn default_config_file() -> Option<PathBuf> {
    project_dirs()
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .or_else(default_config_path)
}

fn demo_engines(candidate_failure_rate: f64, seed: u64) -> (Arc<MockEngine>, Arc<MockEngine>) {
    let legacy = MockEngine::builder("legacy-demo")
        .delay(Duration::from_millis(2))
        .build();
    let candidate = MockEngine::builder("candidate-demo")
        .delay(Duration::from_millis(1))
        .failure_rate(candidate_failure_rate)
        .seed(seed)
        .build();
    (Arc::new(legacy), Arc::new(candidate))
}

pub fn status(ctx: &Context) -> Result<bool> {
    let status = ctx.system().current_status();
    ctx.emit(&status, || {
        let c = &status.feature_flags.config;
        let r = &status.rollback_status;
        let mut lines = vec![
            format!("Engine Shift status: {}", status.system_health),
            format!(
                "  Routing:  candidate {}% | canary {} ({}%) | override {} | source {}",
                c.new_engine_percentage,
                if c.canary_enabled { "on" } else { "off" },
                c.canary_sample_rate,
                c.manual_override,
                status.feature_flags.config_source
            ),
            format!(
                "  Breaker:  {} (threshold {} in {}s, cool-down {}s)",
                status.feature_flags.circuit_breaker_state,
                c.error_threshold,
                c.breaker_window_secs,
                c.breaker_cooldown_secs
            ),
            format!(
                "  Rollback: {} | {} records | recovery failures {}/{}",
                r.current_state, r.history_len, r.recovery_failures, r.recovery_max_attempts
            ),
        ];
        if let Some(last) = &r.last_rollback {
            lines.push(format!(
                "  Last:     {} {:?} by {}: {}",
                last.triggered_at.to_rfc3339(),
                last.trigger,
                last.operator.as_deref().unwrap_or("-"),
                last.reason
            ));
        }
        lines.push(format!("  State:    {}", r.state_location));
        lines.join("\n")
    })?;
    Ok(true)
}

pub fn health(ctx: &Context) -> Result<bool> {
    let report = ctx.system().health_check();
    ctx.emit(&report, || {
        let mut lines = vec![format!("Overall: {}", report.overall_health)];
        for (name, component) in &report.component_health {
            lines.push(format!("  {:<16} {}", name, component.status));
            for issue in &component.issues {
                lines.push(format!("    - {issue}"));
            }
        }
        lines.join("\n")
    })?;
    Ok(report.overall_health != HealthStatus::Critical)
}

pub fn stats(ctx: &Context) -> Result<bool> {
    let stats = ctx.system().statistics();
    ctx.emit(&stats, || {
        let mut lines = vec![
            format_performance(&stats.performance_metrics),
            format!(
                "Breaker: {} | errors {} | successes {} | opened {} times",
                stats
                    .circuit_breaker_metrics
                    .state
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                stats.circuit_breaker_metrics.total_errors,
                stats.circuit_breaker_metrics.total_successes,
                stats.circuit_breaker_metrics.times_opened
            ),
            format!("Rollback history ({} records):", stats.rollback_history.len()),
        ];
        for record in &stats.rollback_history {
            lines.push(format!(
                "  {} {:?} success={} {}ms: {}",
                record.triggered_at.to_rfc3339(),
                record.trigger,
                record.success,
                record.rollback_time_ms,
                record.reason
            ));
        }
        lines.join("\n")
    })?;
    Ok(true)
}

fn format_performance(perf: &PerformanceStatistics) -> String {
    format!(
        "Performance: {} samples (capacity {}) | legacy avg {:.1}ms | candidate avg {:.1}ms | improvement {:+.1}%\n\
         Canary: {} compared, {} matched, {} timeouts, {} late ({} failed)",
        perf.sample_count,
        perf.sample_capacity,
        perf.average_legacy_seconds * 1000.0,
        perf.average_candidate_seconds * 1000.0,
        perf.average_improvement_percent,
        perf.canary_comparisons,
        perf.canary_matches,
        perf.candidate_timeouts,
        perf.late_candidate_completions,
        perf.late_candidate_failures
    )
}

fn emit_outcome(ctx: &Context, outcome: &RollbackOutcome) -> Result<bool> {
    ctx.emit(outcome, || match &outcome.error {
        None => format!(
            "Rollback complete in {}ms; state {} (record {})",
            outcome.rollback_time_ms, outcome.state, outcome.record_id
        ),
        Some(err) => format!(
            "Rollback FAILED after {}ms; state {}; legacy routing is still forced in this process: {}",
            outcome.rollback_time_ms, outcome.state, err
        ),
    })?;
    Ok(outcome.success)
}

pub fn rollback(ctx: &Context, reason: &str, operator: Option<&str>) -> Result<bool> {
    let system = ctx.system();
    info!("Emergency rollback requested: {}", reason);
    let outcome = system.rollback().emergency_rollback(reason, operator);
    emit_outcome(ctx, &outcome)
}

pub fn recover(ctx: &Context) -> Result<bool> {
    let report = ctx.system().rollback().attempt_rollback_recovery();
    ctx.emit(&report, || {
        let mut lines = vec![format!(
            "Recovery {} in {}ms; state {}",
            if report.success { "succeeded" } else { "failed" },
            report.elapsed_ms,
            report.state
        )];
        lines.extend(report.steps.iter().map(|s| format!("  - {s}")));
        if let Some(err) = &report.error {
            lines.push(format!("  error: {err}"));
        }
        lines.push(
            "  note: breaker state is per process; this run checked its own fresh breaker"
                .to_string(),
        );
        lines.join("\n")
    })?;
    Ok(report.success)
}

pub fn trip_breaker(ctx: &Context) -> Result<bool> {
    let system = ctx.system();
    system.flags().trip_circuit_breaker();
    if !system.flags().config().auto_rollback_enabled {
        let state = system.flags().circuit_breaker_state();
        ctx.emit(&state, || {
            format!("Breaker is {state}; auto-rollback disabled, no rollback executed")
        })?;
        return Ok(true);
    }
    let outcome = system.rollback().execute_automatic_rollback();
    emit_outcome(ctx, &outcome)
}

#[derive(Serialize)]
struct ResetSummary {
    breaker_reset: bool,
    recovery_failures_cleared: u32,
}

pub fn reset_breaker(ctx: &Context) -> Result<bool> {
    let system = ctx.system();
    let cleared = system.rollback().recovery_failures();
    system.rollback().reset_recovery_attempts();
    // Breaker state is process-local; this only matters for an open breaker here.
    let breaker_reset = system.flags().reset_circuit_breaker();
    let summary = ResetSummary {
        breaker_reset,
        recovery_failures_cleared: cleared,
    };
    ctx.emit(&summary, || {
        format!(
            "Recovery failure counter cleared (was {}); breaker {}",
            cleared,
            if breaker_reset { "moved to half-open" } else { "was not open" }
        )
    })?;
    Ok(true)
}

pub struct SimulateOptions {
    pub requests: usize,
    pub candidate_failure_rate: Option<f64>,
    pub percentage: Option<u32>,
    pub canary_rate: Option<u32>,
    pub seed: Option<u64>,
    pub persist: bool,
}

#[derive(Serialize)]
struct SimulationSummary {
    run_id: String,
    seed: u64,
    requests: usize,
    succeeded: usize,
    used_candidate: usize,
    canary_tests: usize,
    fallbacks: usize,
    elapsed_ms: u64,
    breaker_state: String,
    rollback_state: String,
    rollbacks: usize,
    adapter: AdapterStatistics,
    performance: PerformanceStatistics,
}

pub async fn simulate(ctx: &Context, options: SimulateOptions) -> Result<bool> {
    let failure_rate = match options.candidate_failure_rate {
        Some(rate) if (0.0..=1.0).contains(&rate) => rate,
        Some(rate) => bail!("--candidate-failure-rate must be within 0.0..=1.0, got {rate}"),
        None => {
            let mut env = EnvParser::new();
            let rate = env.get_f64_range("SIMULATE_FAILURE_RATE", 0.0, 0.0, 1.0);
            if env.has_errors() {
                let errors: Vec<String> =
                    env.take_errors().iter().map(ToString::to_string).collect();
                bail!(
                    "[{}] invalid environment: {}",
                    ErrorCode::ConfigEnvError.code_string(),
                    errors.join("; ")
                );
            }
            rate.value
        }
    };
    let run_id = Uuid::new_v4();
    let seed = options.seed.unwrap_or_else(|| run_id.as_u64_pair().0);

    let flags = Arc::new(FeatureFlags::with_random_source(
        ctx.flags.config().as_ref().clone(),
        Arc::new(SeededRandom::new(seed)),
    )?);
    let patch = ConfigPatch {
        new_engine_percentage: options.percentage,
        canary_enabled: options.canary_rate.map(|_| true),
        canary_sample_rate: options.canary_rate,
        ..Default::default()
    };
    if !patch.is_empty() {
        flags.configure(&patch).context("Invalid simulation settings")?;
    }

    let file_store = FileStateStore::new(&ctx.state_path);
    let store: Arc<dyn StateStore> = if options.persist {
        Arc::new(file_store)
    } else {
        // Start from the real state but keep the run's changes in memory.
        match file_store.load() {
            Ok(Some(state)) => Arc::new(MemoryStateStore::with_state(state)),
            _ => Arc::new(MemoryStateStore::new()),
        }
    };

    let (legacy, candidate) = demo_engines(failure_rate, seed);
    let system = Arc::new(MigrationSystem::from_flags(flags, legacy, candidate, store));
    let monitor = system.start_monitor();
    let rollbacks_before = system.rollback().rollback_history().len();

    info!(
        "Simulating {} requests (seed {}, candidate failure rate {:.2})",
        options.requests, seed, failure_rate
    );
    let started = Instant::now();
    let tasks: Vec<_> = (0..options.requests)
        .map(|i| {
            let system = Arc::clone(&system);
            tokio::spawn(async move {
                system
                    .execute(Some(RequestContext::new(format!("sim-{i}"))))
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut used_candidate = 0;
    let mut canary_tests = 0;
    let mut fallbacks = 0;
    for task in tasks {
        let out = task.await.context("Simulated request task failed")?;
        succeeded += usize::from(out.result.success);
        used_candidate += usize::from(out.migration_metadata.used_candidate);
        canary_tests += usize::from(out.migration_metadata.was_canary_test);
        fallbacks += usize::from(out.migration_metadata.fallback_used);
    }
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    // Let the monitor drain any pending rollback recommendation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    monitor.abort();

    let summary = SimulationSummary {
        run_id: run_id.to_string(),
        seed,
        requests: options.requests,
        succeeded,
        used_candidate,
        canary_tests,
        fallbacks,
        elapsed_ms,
        breaker_state: system.flags().circuit_breaker_state().to_string(),
        rollback_state: system.rollback().current_state().to_string(),
        rollbacks: system.rollback().rollback_history().len() - rollbacks_before,
        adapter: system.adapter().statistics(),
        performance: system.flags().performance_statistics(),
    };

    ctx.emit(&summary, || {
        format!(
            "Simulation {} (seed {}): {} requests in {}ms\n  \
             succeeded {} | candidate {} | canary {} | fallbacks {}\n  \
             breaker {} | rollback {} ({} new rollbacks)\n{}",
            summary.run_id,
            summary.seed,
            summary.requests,
            summary.elapsed_ms,
            summary.succeeded,
            summary.used_candidate,
            summary.canary_tests,
            summary.fallbacks,
            summary.breaker_state,
            summary.rollback_state,
            summary.rollbacks,
            format_performance(&summary.performance)
        )
    })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eshift_common::rollback::RollbackState;
    use tempfile::TempDir;

    fn context(dir: &TempDir, config: MigrationConfig) -> Context {
        Context::new(
            Arc::new(FeatureFlags::new(config).unwrap()),
            dir.path().join("state.json"),
            true,
        )
    }

    #[test]
    fn rollback_persists_across_invocations() {
        let dir = TempDir::new().unwrap();
        assert!(rollback(&context(&dir, MigrationConfig::default()), "drill", Some("ops")).unwrap());

        let ctx = context(&dir, MigrationConfig::default());
        let status = ctx.system().current_status();
        assert_eq!(status.rollback_status.current_state, RollbackState::RolledBack);
        assert_eq!(status.rollback_status.history_len, 1);
    }

    #[test]
    fn recover_after_rollback_returns_to_healthy() {
        let dir = TempDir::new().unwrap();
        rollback(&context(&dir, MigrationConfig::default()), "drill", None).unwrap();
        assert!(recover(&context(&dir, MigrationConfig::default())).unwrap());
        let ctx = context(&dir, MigrationConfig::default());
        assert_eq!(
            ctx.system().rollback().current_state(),
            RollbackState::Healthy
        );
    }

    #[test]
    fn trip_breaker_runs_automatic_rollback() {
        let dir = TempDir::new().unwrap();
        assert!(trip_breaker(&context(&dir, MigrationConfig::default())).unwrap());
        let history = context(&dir, MigrationConfig::default())
            .system()
            .rollback()
            .rollback_history();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn health_is_not_critical_when_fresh() {
        let dir = TempDir::new().unwrap();
        assert!(health(&context(&dir, MigrationConfig::default())).unwrap());
    }

    #[tokio::test]
    async fn simulate_without_persist_leaves_state_file_untouched() {
        let dir = TempDir::new().unwrap();
        let ctx = context(
            &dir,
            MigrationConfig {
                error_threshold: 2,
                ..Default::default()
            },
        );
        let ok = simulate(
            &ctx,
            SimulateOptions {
                requests: 20,
                candidate_failure_rate: Some(1.0),
                percentage: Some(100),
                canary_rate: None,
                seed: Some(1),
                persist: false,
            },
        )
        .await
        .unwrap();
        assert!(ok);
        assert!(!dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn simulate_rejects_bad_failure_rate() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, MigrationConfig::default());
        let result = simulate(
            &ctx,
            SimulateOptions {
                requests: 1,
                candidate_failure_rate: Some(2.0),
                percentage: None,
                canary_rate: None,
                seed: None,
                persist: false,
            },
        )
        .await;
        assert!(result.is_err());
    }
}
