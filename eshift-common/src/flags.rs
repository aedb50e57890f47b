//! Feature flags: routing decisions, breaker ownership and statistics.
//!
//! `FeatureFlags` is constructed once at startup and shared (via `Arc`)
//! with every adapter. All mutable state sits behind one mutex so a
//! routing decision always sees a consistent `(config, breaker state)`
//! snapshot and concurrent outcome recording never loses updates.
//!
//! # Routing precedence
//!
//! 1. `ForceLegacy` override: legacy, unconditionally.
//! 2. Breaker open: legacy. A `ForceNew` override does not bypass it;
//!    operators use an explicit forced run for that.
//! 3. `ForceNew` override: candidate.
//! 4. Canary sampled in (`canary_sample_rate / 100`): canary, legacy result.
//! 5. Candidate with probability `new_engine_percentage / 100`, else legacy.

use crate::breaker::{BreakerMetrics, BreakerSettings, CircuitBreaker, CircuitState, Transition};
use crate::config::{
    ConfigPatch, ConfigSource, EnvParser, ManualOverride, MigrationConfig, load_config_file,
};
use crate::engine::EngineKind;
use crate::errors::{ErrorCode, MigrationError};
use crate::events::{EventBus, MigrationEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Source of uniform random numbers in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Thread-local generator used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        fastrand::f64()
    }
}

/// Deterministic generator for tests and simulations.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<fastrand::Rng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        self.rng.lock().unwrap_or_else(|e| e.into_inner()).f64()
    }
}

/// Where a request goes, before the random draws are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub use_candidate: bool,
    pub is_canary: bool,
}

/// Pure routing function over a configuration and breaker snapshot.
///
/// `canary_draw` and `candidate_draw` are uniform samples in `[0, 1)`.
pub fn route(
    config: &MigrationConfig,
    breaker: CircuitState,
    canary_draw: f64,
    candidate_draw: f64,
) -> Route {
    const LEGACY: Route = Route {
        use_candidate: false,
        is_canary: false,
    };

    match config.manual_override {
        ManualOverride::ForceLegacy => return LEGACY,
        _ if breaker == CircuitState::Open => return LEGACY,
        ManualOverride::ForceNew => {
            return Route {
                use_candidate: true,
                is_canary: false,
            };
        }
        ManualOverride::None => {}
    }

    if config.canary_enabled && canary_draw < f64::from(config.canary_sample_rate) / 100.0 {
        return Route {
            use_candidate: false,
            is_canary: true,
        };
    }

    Route {
        use_candidate: candidate_draw < f64::from(config.new_engine_percentage) / 100.0,
        is_canary: false,
    }
}

/// One routing decision, fixed for the whole request.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub request_id: String,
    pub use_candidate: bool,
    pub is_canary: bool,
    pub circuit_state: CircuitState,
    pub config: Arc<MigrationConfig>,
}

/// Timing pair collected from a canary run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub legacy_time_seconds: f64,
    pub candidate_time_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of performance and routing counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStatistics {
    /// Samples currently held in the ring buffer.
    pub sample_count: usize,
    pub sample_capacity: usize,
    /// Samples recorded since startup, including evicted ones.
    pub total_samples: u64,
    pub average_legacy_seconds: f64,
    pub average_candidate_seconds: f64,
    /// Positive when the candidate is faster.
    pub average_improvement_percent: f64,
    pub legacy_decisions: u64,
    pub candidate_decisions: u64,
    pub canary_decisions: u64,
    pub legacy_successes: u64,
    pub legacy_errors: u64,
    pub candidate_successes: u64,
    pub candidate_errors: u64,
    pub candidate_timeouts: u64,
    pub late_candidate_completions: u64,
    /// Late completions that failed. Already charged as a timeout.
    pub late_candidate_failures: u64,
    pub canary_comparisons: u64,
    pub canary_matches: u64,
    pub latest_sample: Option<PerformanceSample>,
}

/// Ring buffer plus running sums; every update is O(1).
#[derive(Debug)]
struct PerformanceTracker {
    samples: VecDeque<PerformanceSample>,
    capacity: usize,
    legacy_sum: f64,
    candidate_sum: f64,
    counters: PerformanceStatistics,
}

impl PerformanceTracker {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            legacy_sum: 0.0,
            candidate_sum: 0.0,
            counters: PerformanceStatistics::default(),
        }
    }

    fn push(&mut self, sample: PerformanceSample) {
        while self.samples.len() >= self.capacity {
            self.evict_oldest();
        }
        self.legacy_sum += sample.legacy_time_seconds;
        self.candidate_sum += sample.candidate_time_seconds;
        self.samples.push_back(sample);
        self.counters.total_samples += 1;
    }

    fn evict_oldest(&mut self) {
        if let Some(old) = self.samples.pop_front() {
            self.legacy_sum -= old.legacy_time_seconds;
            self.candidate_sum -= old.candidate_time_seconds;
        }
    }

    fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.samples.len() > capacity {
            self.evict_oldest();
        }
    }

    fn snapshot(&self) -> PerformanceStatistics {
        let n = self.samples.len();
        let (avg_legacy, avg_candidate) = if n == 0 {
            (0.0, 0.0)
        } else {
            (self.legacy_sum / n as f64, self.candidate_sum / n as f64)
        };
        let improvement = if avg_legacy > 0.0 {
            (avg_legacy - avg_candidate) / avg_legacy * 100.0
        } else {
            0.0
        };
        PerformanceStatistics {
            sample_count: n,
            sample_capacity: self.capacity,
            average_legacy_seconds: avg_legacy,
            average_candidate_seconds: avg_candidate,
            average_improvement_percent: improvement,
            latest_sample: self.samples.back().cloned(),
            ..self.counters.clone()
        }
    }
}

/// Serializable view of the flags for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureFlagState {
    pub config: MigrationConfig,
    pub config_source: ConfigSource,
    pub circuit_breaker_state: CircuitState,
    pub rollback_recommended: bool,
}

struct FlagsState {
    config: Arc<MigrationConfig>,
    config_source: ConfigSource,
    breaker: CircuitBreaker,
    performance: PerformanceTracker,
}

impl FlagsState {
    fn settings(&self) -> BreakerSettings {
        BreakerSettings::from(self.config.as_ref())
    }
}

pub struct FeatureFlags {
    state: Mutex<FlagsState>,
    random: Arc<dyn RandomSource>,
    events: EventBus,
}

impl FeatureFlags {
    /// Build flags over a validated configuration.
    pub fn new(config: MigrationConfig) -> Result<Self, MigrationError> {
        Self::with_random_source(config, Arc::new(ThreadRandom))
    }

    pub fn with_random_source(
        config: MigrationConfig,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self, MigrationError> {
        config.validate()?;
        let capacity = config.performance_buffer_capacity;
        Ok(Self {
            state: Mutex::new(FlagsState {
                config: Arc::new(config),
                config_source: ConfigSource::Default,
                breaker: CircuitBreaker::new(),
                performance: PerformanceTracker::new(capacity),
            }),
            random,
            events: EventBus::default(),
        })
    }

    /// Publish on a shared bus instead of a private one.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn lock(&self) -> MutexGuard<'_, FlagsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<MigrationConfig> {
        self.lock().config.clone()
    }

    /// Apply a partial change. On any violation nothing changes.
    pub fn configure(&self, patch: &ConfigPatch) -> Result<Arc<MigrationConfig>, MigrationError> {
        self.configure_from(patch, ConfigSource::Runtime)
    }

    /// Apply `ESHIFT_*` variables from the process environment.
    pub fn configure_from_environment(&self) -> Result<Arc<MigrationConfig>, MigrationError> {
        self.configure_from_env_parser(&mut EnvParser::new())
    }

    /// Apply variables from an explicit key/value source.
    pub fn configure_from_env_parser(
        &self,
        parser: &mut EnvParser,
    ) -> Result<Arc<MigrationConfig>, MigrationError> {
        let patch = parser.migration_patch()?;
        self.configure_from(&patch, ConfigSource::Environment)
    }

    /// Apply the `[migration]` table of a TOML file. A missing file is a no-op.
    pub fn configure_from_file(&self, path: &Path) -> Result<Arc<MigrationConfig>, MigrationError> {
        let patch = load_config_file(path)?;
        if patch.is_empty() {
            return Ok(self.config());
        }
        self.configure_from(&patch, ConfigSource::ConfigFile)
    }

    pub(crate) fn configure_from(
        &self,
        patch: &ConfigPatch,
        source: ConfigSource,
    ) -> Result<Arc<MigrationConfig>, MigrationError> {
        let next = {
            let mut state = self.lock();
            let next = match patch.apply(&state.config) {
                Ok(next) => Arc::new(next),
                Err(err) => {
                    warn!("Rejected configuration change from {}: {}", source, err);
                    return Err(err);
                }
            };
            state.performance.resize(next.performance_buffer_capacity);
            state.config = next.clone();
            state.config_source = source;
            next
        };

        info!(
            "Migration config updated from {}: candidate={}%, canary={} ({}%), override={}",
            source,
            next.new_engine_percentage,
            next.canary_enabled,
            next.canary_sample_rate,
            next.manual_override
        );
        self.events.emit(MigrationEvent::ConfigChanged {
            new_engine_percentage: next.new_engine_percentage,
            manual_override: next.manual_override.to_string(),
        });
        Ok(next)
    }

    /// Decide where `request_id` runs. Called once per request.
    pub fn routing_decision(&self, request_id: &str) -> RoutingDecision {
        let canary_draw = self.random.next_f64();
        let candidate_draw = self.random.next_f64();

        let (decision, transitions, auto_rollback) = {
            let mut state = self.lock();
            let settings = state.settings();
            let transitions: Vec<Transition> =
                state.breaker.refresh(&settings, Instant::now()).into_iter().collect();
            let circuit_state = state.breaker.state();
            let route = route(&state.config, circuit_state, canary_draw, candidate_draw);

            let counters = &mut state.performance.counters;
            if route.is_canary {
                counters.canary_decisions += 1;
            } else if route.use_candidate {
                counters.candidate_decisions += 1;
            } else {
                counters.legacy_decisions += 1;
            }

            let decision = RoutingDecision {
                request_id: request_id.to_string(),
                use_candidate: route.use_candidate,
                is_canary: route.is_canary,
                circuit_state,
                config: state.config.clone(),
            };
            (decision, transitions, state.config.auto_rollback_enabled)
        };

        self.publish(&transitions, auto_rollback);
        debug!(
            request_id,
            use_candidate = decision.use_candidate,
            is_canary = decision.is_canary,
            breaker = %decision.circuit_state,
            "Routing decision"
        );
        decision
    }

    /// Record a successful run. Only candidate outcomes drive the breaker.
    pub fn record_success(&self, engine: EngineKind) {
        let (transitions, auto_rollback) = {
            let mut state = self.lock();
            match engine {
                EngineKind::Legacy => {
                    state.performance.counters.legacy_successes += 1;
                    return;
                }
                EngineKind::Candidate => {
                    state.performance.counters.candidate_successes += 1;
                    let settings = state.settings();
                    let now = Instant::now();
                    let mut transitions: Vec<Transition> =
                        state.breaker.refresh(&settings, now).into_iter().collect();
                    transitions.extend(state.breaker.record_success(&settings, now));
                    (transitions, state.config.auto_rollback_enabled)
                }
            }
        };
        self.publish(&transitions, auto_rollback);
    }

    /// Record a failed run. Only candidate outcomes drive the breaker.
    pub fn record_error(&self, engine: EngineKind, error: &str) {
        let (transitions, auto_rollback) = {
            let mut state = self.lock();
            match engine {
                EngineKind::Legacy => {
                    state.performance.counters.legacy_errors += 1;
                    drop(state);
                    warn!("Legacy engine error recorded: {}", error);
                    return;
                }
                EngineKind::Candidate => {
                    state.performance.counters.candidate_errors += 1;
                    let settings = state.settings();
                    let now = Instant::now();
                    let mut transitions: Vec<Transition> =
                        state.breaker.refresh(&settings, now).into_iter().collect();
                    transitions.extend(state.breaker.record_error(&settings, now));
                    (transitions, state.config.auto_rollback_enabled)
                }
            }
        };
        warn!("Candidate engine error recorded: {}", error);
        self.publish(&transitions, auto_rollback);
    }

    /// A canary candidate run exceeded its deadline; counts as an error.
    pub fn record_candidate_timeout(&self, timeout_secs: u64) {
        self.lock().performance.counters.candidate_timeouts += 1;
        self.record_error(
            EngineKind::Candidate,
            &format!(
                "[{}] candidate exceeded canary timeout of {timeout_secs}s",
                ErrorCode::EngineTimeout.code_string()
            ),
        );
    }

    /// A candidate run finished after its canary deadline. The breaker was
    /// already charged by [`record_candidate_timeout`](Self::record_candidate_timeout),
    /// so this only counts.
    pub fn record_late_completion(&self, failed: bool) {
        let counters = &mut self.lock().performance.counters;
        counters.late_candidate_completions += 1;
        if failed {
            counters.late_candidate_failures += 1;
        }
    }

    pub fn record_performance(&self, legacy_time_seconds: f64, candidate_time_seconds: f64) {
        self.lock().performance.push(PerformanceSample {
            legacy_time_seconds,
            candidate_time_seconds,
            timestamp: Utc::now(),
        });
    }

    pub fn record_comparison(&self, overall_match: bool) {
        let mut state = self.lock();
        state.performance.counters.canary_comparisons += 1;
        if overall_match {
            state.performance.counters.canary_matches += 1;
        }
    }

    pub fn performance_statistics(&self) -> PerformanceStatistics {
        self.lock().performance.snapshot()
    }

    /// Current breaker state, applying any elapsed cool-down.
    pub fn circuit_breaker_state(&self) -> CircuitState {
        let (transitions, state, auto_rollback) = {
            let mut state = self.lock();
            let settings = state.settings();
            let transitions: Vec<Transition> =
                state.breaker.refresh(&settings, Instant::now()).into_iter().collect();
            (transitions, state.breaker.state(), state.config.auto_rollback_enabled)
        };
        self.publish(&transitions, auto_rollback);
        state
    }

    pub fn circuit_breaker_metrics(&self) -> BreakerMetrics {
        // Refresh first so the reported state is current.
        self.circuit_breaker_state();
        self.lock().breaker.metrics()
    }

    /// Force the breaker open immediately (operational drill hook).
    ///
    /// Returns false when it was already open.
    pub fn trip_circuit_breaker(&self) -> bool {
        let (transition, auto_rollback) = {
            let mut state = self.lock();
            (state.breaker.trip(Instant::now()), state.config.auto_rollback_enabled)
        };
        let tripped = transition.is_some();
        self.publish(&transition.into_iter().collect::<Vec<_>>(), auto_rollback);
        tripped
    }

    /// Operator reset: open -> half-open. Returns false when not open.
    pub fn reset_circuit_breaker(&self) -> bool {
        let transition = self.lock().breaker.reset();
        let reset = transition.is_some();
        self.publish(&transition.into_iter().collect::<Vec<_>>(), false);
        reset
    }

    /// Rollback is recommended exactly when the breaker is open.
    pub fn rollback_recommended(&self) -> bool {
        self.circuit_breaker_state() == CircuitState::Open
    }

    pub fn state(&self) -> FeatureFlagState {
        let breaker_state = self.circuit_breaker_state();
        let state = self.lock();
        FeatureFlagState {
            config: state.config.as_ref().clone(),
            config_source: state.config_source,
            circuit_breaker_state: breaker_state,
            rollback_recommended: breaker_state == CircuitState::Open,
        }
    }

    fn publish(&self, transitions: &[Transition], auto_rollback: bool) {
        for transition in transitions {
            info!(
                "Circuit breaker {} -> {} ({:?})",
                transition.from, transition.to, transition.reason
            );
            self.events.emit(MigrationEvent::BreakerTransition {
                from: transition.from,
                to: transition.to,
                reason: transition.reason,
            });
            if transition.to == CircuitState::Open && auto_rollback {
                self.events.emit(MigrationEvent::RollbackRecommended {
                    reason: format!("circuit breaker opened ({:?})", transition.reason),
                });
            }
        }
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::breaker::TransitionReason;
    use proptest::prelude::*;

    /// Returns the scripted values in order, then repeats the last one.
    struct ScriptedRandom {
        values: Mutex<VecDeque<f64>>,
    }

    impl ScriptedRandom {
        fn new(values: &[f64]) -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(values.iter().copied().collect()),
            })
        }
    }

    impl RandomSource for ScriptedRandom {
        fn next_f64(&self) -> f64 {
            let mut values = self.values.lock().unwrap();
            if values.len() > 1 {
                values.pop_front().unwrap()
            } else {
                values.front().copied().unwrap_or(0.0)
            }
        }
    }

    fn flags(config: MigrationConfig) -> FeatureFlags {
        FeatureFlags::with_random_source(config, Arc::new(SeededRandom::new(7))).unwrap()
    }

    #[test]
    fn route_force_legacy_wins_over_everything() {
        let config = MigrationConfig {
            new_engine_percentage: 100,
            canary_enabled: true,
            canary_sample_rate: 100,
            manual_override: ManualOverride::ForceLegacy,
            ..Default::default()
        };
        for state in [CircuitState::Closed, CircuitState::HalfOpen, CircuitState::Open] {
            let r = route(&config, state, 0.0, 0.0);
            assert!(!r.use_candidate && !r.is_canary);
        }
    }

    #[test]
    fn route_force_new_does_not_bypass_open_breaker() {
        let config = MigrationConfig {
            manual_override: ManualOverride::ForceNew,
            ..Default::default()
        };
        assert!(!route(&config, CircuitState::Open, 0.9, 0.9).use_candidate);
        assert!(route(&config, CircuitState::Closed, 0.9, 0.9).use_candidate);
        assert!(route(&config, CircuitState::HalfOpen, 0.9, 0.9).use_candidate);
    }

    #[test]
    fn route_open_breaker_forces_legacy_without_canary() {
        let config = MigrationConfig {
            new_engine_percentage: 100,
            canary_enabled: true,
            canary_sample_rate: 100,
            ..Default::default()
        };
        let r = route(&config, CircuitState::Open, 0.0, 0.0);
        assert_eq!(
            r,
            Route {
                use_candidate: false,
                is_canary: false
            }
        );
    }

    #[test]
    fn route_canary_sample_keeps_legacy_primary() {
        let config = MigrationConfig {
            new_engine_percentage: 100,
            canary_enabled: true,
            canary_sample_rate: 30,
            ..Default::default()
        };
        let sampled = route(&config, CircuitState::Closed, 0.29, 0.0);
        assert!(sampled.is_canary && !sampled.use_candidate);
        let not_sampled = route(&config, CircuitState::Closed, 0.30, 0.0);
        assert!(!not_sampled.is_canary && not_sampled.use_candidate);
    }

    #[test]
    fn route_percentage_edges() {
        let zero = MigrationConfig::default();
        let full = MigrationConfig {
            new_engine_percentage: 100,
            ..Default::default()
        };
        assert!(!route(&zero, CircuitState::Closed, 0.5, 0.0).use_candidate);
        assert!(route(&full, CircuitState::Closed, 0.5, 0.999_999).use_candidate);
    }

    #[test]
    fn half_of_requests_go_to_candidate_at_fifty_percent() {
        let flags = flags(MigrationConfig {
            new_engine_percentage: 50,
            ..Default::default()
        });
        let candidate = (0..1000)
            .filter(|i| flags.routing_decision(&format!("req-{i}")).use_candidate)
            .count();
        let fraction = candidate as f64 / 1000.0;
        assert!((fraction - 0.5).abs() <= 0.05, "fraction was {fraction}");
    }

    #[test]
    fn canary_draw_uses_injected_source() {
        let flags = FeatureFlags::with_random_source(
            MigrationConfig {
                canary_enabled: true,
                canary_sample_rate: 50,
                ..Default::default()
            },
            ScriptedRandom::new(&[0.1, 0.9, 0.6, 0.9]),
        )
        .unwrap();
        assert!(flags.routing_decision("a").is_canary);
        assert!(!flags.routing_decision("b").is_canary);
        let stats = flags.performance_statistics();
        assert_eq!(stats.canary_decisions, 1);
        assert_eq!(stats.legacy_decisions, 1);
    }

    #[test]
    fn configure_is_all_or_nothing() {
        let flags = flags(MigrationConfig::default());
        let err = flags
            .configure(&ConfigPatch {
                new_engine_percentage: Some(40),
                canary_sample_rate: Some(140),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, MigrationError::Configuration { .. }));
        assert_eq!(flags.config().new_engine_percentage, 0);

        flags
            .configure(&ConfigPatch {
                new_engine_percentage: Some(40),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(flags.config().new_engine_percentage, 40);
        assert_eq!(flags.state().config_source, ConfigSource::Runtime);
    }

    #[test]
    fn configure_from_env_parser_applies_only_set_values() {
        let flags = flags(MigrationConfig::default());
        let mut parser = EnvParser::from_map([
            ("ESHIFT_NEW_PIPELINE_PERCENTAGE", "15"),
            ("ESHIFT_CANARY_ENABLED", "true"),
        ]);
        let config = flags.configure_from_env_parser(&mut parser).unwrap();
        assert_eq!(config.new_engine_percentage, 15);
        assert!(config.canary_enabled);
        assert_eq!(config.error_threshold, MigrationConfig::default().error_threshold);
        assert_eq!(flags.state().config_source, ConfigSource::Environment);
    }

    #[test]
    fn configure_from_file_tracks_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[migration]\nnew_engine_percentage = 35\n").unwrap();
        let flags = flags(MigrationConfig::default());
        assert_eq!(flags.configure_from_file(&path).unwrap().new_engine_percentage, 35);
        assert_eq!(flags.state().config_source, ConfigSource::ConfigFile);
        // Missing file leaves everything as is.
        flags.configure_from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(flags.config().new_engine_percentage, 35);
    }

    #[test]
    fn huge_durations_are_rejected_from_runtime_and_file() {
        let flags = flags(MigrationConfig::default());
        let before = flags.config();

        let patch = ConfigPatch {
            canary_enabled: Some(true),
            canary_sample_rate: Some(100),
            canary_timeout_secs: Some(u64::MAX),
            ..Default::default()
        };
        assert!(flags.configure(&patch).is_err());

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            // TOML integers are i64, so this is the largest value a file can carry.
            format!("[migration]\nbreaker_window_secs = {0}\nbreaker_cooldown_secs = {0}\n", i64::MAX),
        )
        .unwrap();
        assert!(matches!(
            flags.configure_from_file(&path),
            Err(MigrationError::Configuration { .. })
        ));
        assert_eq!(*flags.config(), *before);
    }

    #[test]
    fn intermittent_candidate_failures_trip_within_window() {
        let flags = flags(MigrationConfig {
            error_threshold: 5,
            ..Default::default()
        });
        for i in 0..4 {
            flags.record_error(EngineKind::Candidate, &format!("flaky {i}"));
            flags.record_success(EngineKind::Candidate);
        }
        assert_eq!(flags.circuit_breaker_state(), CircuitState::Closed);
        assert_eq!(flags.circuit_breaker_metrics().window_error_count, 4);

        flags.record_error(EngineKind::Candidate, "flaky 4");
        assert_eq!(flags.circuit_breaker_state(), CircuitState::Open);
    }

    #[test]
    #[serial_test::serial]
    fn configure_from_environment_reads_process_env() {
        let flags = flags(MigrationConfig::default());
        // SAFETY: serialized with every other process-env test via #[serial]
        unsafe { std::env::set_var("ESHIFT_NEW_PIPELINE_PERCENTAGE", "64") };
        let result = flags.configure_from_environment();
        unsafe { std::env::remove_var("ESHIFT_NEW_PIPELINE_PERCENTAGE") };
        assert_eq!(result.unwrap().new_engine_percentage, 64);
    }

    #[test]
    fn threshold_errors_open_breaker_and_recommend_rollback() {
        let flags = flags(MigrationConfig {
            error_threshold: 2,
            ..Default::default()
        });
        let mut rx = flags.events().subscribe();

        flags.record_error(EngineKind::Candidate, "first");
        assert_eq!(flags.circuit_breaker_state(), CircuitState::Closed);
        flags.record_error(EngineKind::Candidate, "second");
        assert_eq!(flags.circuit_breaker_state(), CircuitState::Open);
        assert!(flags.rollback_recommended());

        assert_eq!(
            rx.try_recv().unwrap(),
            MigrationEvent::BreakerTransition {
                from: CircuitState::Closed,
                to: CircuitState::Open,
                reason: TransitionReason::ErrorThreshold,
            }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            MigrationEvent::RollbackRecommended { .. }
        ));
    }

    #[test]
    fn no_rollback_signal_when_auto_rollback_disabled() {
        let flags = flags(MigrationConfig {
            error_threshold: 1,
            auto_rollback_enabled: false,
            ..Default::default()
        });
        let mut rx = flags.events().subscribe();
        flags.record_error(EngineKind::Candidate, "boom");
        assert!(matches!(
            rx.try_recv().unwrap(),
            MigrationEvent::BreakerTransition { .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn legacy_errors_never_touch_breaker() {
        let flags = flags(MigrationConfig {
            error_threshold: 1,
            ..Default::default()
        });
        for _ in 0..5 {
            flags.record_error(EngineKind::Legacy, "legacy broke");
        }
        assert_eq!(flags.circuit_breaker_state(), CircuitState::Closed);
        assert_eq!(flags.performance_statistics().legacy_errors, 5);
    }

    #[test]
    fn probe_success_closes_and_probe_failure_reopens() {
        let flags = flags(MigrationConfig {
            error_threshold: 1,
            ..Default::default()
        });
        flags.record_error(EngineKind::Candidate, "x");
        assert!(flags.reset_circuit_breaker());
        assert_eq!(flags.circuit_breaker_state(), CircuitState::HalfOpen);
        flags.record_success(EngineKind::Candidate);
        assert_eq!(flags.circuit_breaker_state(), CircuitState::Closed);

        flags.record_error(EngineKind::Candidate, "y");
        flags.reset_circuit_breaker();
        flags.record_error(EngineKind::Candidate, "z");
        assert_eq!(flags.circuit_breaker_state(), CircuitState::Open);
    }

    #[test]
    fn zero_cooldown_moves_to_half_open_on_next_read() {
        let flags = flags(MigrationConfig {
            error_threshold: 1,
            breaker_cooldown_secs: 0,
            ..Default::default()
        });
        flags.record_error(EngineKind::Candidate, "x");
        assert_eq!(flags.circuit_breaker_state(), CircuitState::HalfOpen);
    }

    #[test]
    fn trip_forces_open_and_routes_legacy() {
        let flags = flags(MigrationConfig {
            new_engine_percentage: 100,
            ..Default::default()
        });
        assert!(flags.trip_circuit_breaker());
        assert!(!flags.trip_circuit_breaker());
        assert!(!flags.routing_decision("r").use_candidate);
        assert_eq!(flags.circuit_breaker_metrics().times_opened, 1);
    }

    #[test]
    fn concurrent_errors_open_breaker_exactly_once() {
        let flags = Arc::new(flags(MigrationConfig {
            error_threshold: 50,
            ..Default::default()
        }));
        let mut rx = flags.events().subscribe();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flags = flags.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        flags.record_error(EngineKind::Candidate, "race");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = flags.circuit_breaker_metrics();
        assert_eq!(metrics.total_errors, 200);
        assert_eq!(metrics.times_opened, 1);
        let mut opened = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, MigrationEvent::BreakerTransition { to: CircuitState::Open, .. }) {
                opened += 1;
            }
        }
        assert_eq!(opened, 1);
    }

    #[test]
    fn performance_buffer_is_bounded_with_running_averages() {
        let flags = flags(MigrationConfig {
            performance_buffer_capacity: 3,
            ..Default::default()
        });
        for i in 1..=5 {
            flags.record_performance(i as f64, i as f64 / 2.0);
        }
        let stats = flags.performance_statistics();
        assert_eq!(stats.sample_count, 3);
        assert_eq!(stats.total_samples, 5);
        // Window holds samples 3, 4, 5.
        assert!((stats.average_legacy_seconds - 4.0).abs() < 1e-9);
        assert!((stats.average_candidate_seconds - 2.0).abs() < 1e-9);
        assert!((stats.average_improvement_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn shrinking_buffer_evicts_oldest() {
        let flags = flags(MigrationConfig::default());
        for i in 0..10 {
            flags.record_performance(i as f64, 1.0);
        }
        flags
            .configure(&ConfigPatch {
                performance_buffer_capacity: Some(2),
                ..Default::default()
            })
            .unwrap();
        let stats = flags.performance_statistics();
        assert_eq!(stats.sample_count, 2);
        assert!((stats.average_legacy_seconds - 8.5).abs() < 1e-9);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn force_legacy_is_pure_and_total(
            pct in 0u32..=100,
            rate in 0u32..=100,
            canary in any::<bool>(),
            a in 0.0f64..1.0,
            b in 0.0f64..1.0,
            state_idx in 0usize..3,
        ) {
            let state = [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen][state_idx];
            let config = MigrationConfig {
                new_engine_percentage: pct,
                canary_enabled: canary,
                canary_sample_rate: rate,
                manual_override: ManualOverride::ForceLegacy,
                ..Default::default()
            };
            let r = route(&config, state, a, b);
            prop_assert!(!r.use_candidate);
            prop_assert!(!r.is_canary);
            prop_assert_eq!(r, route(&config, state, a, b));
        }

        #[test]
        fn never_candidate_and_canary_at_once(
            pct in 0u32..=100,
            rate in 0u32..=100,
            a in 0.0f64..1.0,
            b in 0.0f64..1.0,
        ) {
            let config = MigrationConfig {
                new_engine_percentage: pct,
                canary_enabled: true,
                canary_sample_rate: rate,
                ..Default::default()
            };
            let r = route(&config, CircuitState::Closed, a, b);
            prop_assert!(!(r.use_candidate && r.is_canary));
        }
    }

    #[test]
    fn candidate_fraction_tracks_percentage_across_range() {
        for pct in [0u32, 10, 25, 75, 90, 100] {
            let flags = flags(MigrationConfig {
                new_engine_percentage: pct,
                ..Default::default()
            });
            let hits = (0..1000)
                .filter(|_| flags.routing_decision("r").use_candidate)
                .count();
            let fraction = hits as f64 / 1000.0;
            assert!(
                (fraction - f64::from(pct) / 100.0).abs() <= 0.05,
                "pct={pct} fraction={fraction}"
            );
        }
    }

    #[test]
    fn legacy_engine_kind_counts_successes() {
        let flags = flags(MigrationConfig::default());
        flags.record_success(EngineKind::Legacy);
        flags.record_success(EngineKind::Candidate);
        let stats = flags.performance_statistics();
        assert_eq!(stats.legacy_successes, 1);
        assert_eq!(stats.candidate_successes, 1);
    }

    #[test]
    fn comparisons_and_timeouts_are_counted() {
        let flags = flags(MigrationConfig::default());
        flags.record_comparison(true);
        flags.record_comparison(false);
        flags.record_candidate_timeout(30);
        flags.record_late_completion(true);
        let stats = flags.performance_statistics();
        assert_eq!(stats.canary_comparisons, 2);
        assert_eq!(stats.canary_matches, 1);
        assert_eq!(stats.candidate_timeouts, 1);
        assert_eq!(stats.candidate_errors, 1);
        assert_eq!(stats.late_candidate_completions, 1);
        assert_eq!(stats.late_candidate_failures, 1);
        assert_eq!(flags.circuit_breaker_metrics().total_errors, 1);
    }
}
