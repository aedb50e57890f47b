//! Status, health and statistics surfaces.
//!
//! Health is evaluated from plain snapshots so the rules can be tested
//! without wiring a full system.

use crate::adapter::AdapterStatistics;
use crate::breaker::{BreakerMetrics, CircuitState};
use crate::config::ManualOverride;
use crate::flags::{FeatureFlagState, PerformanceStatistics};
use crate::rollback::{RollbackRecord, RollbackState, RollbackStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Canary match rate below which the canary component is degraded.
pub const CANARY_MATCH_RATE_WARNING: f64 = 0.95;

// ── Health ────────────────────────────────────────────────────────────────

/// Ordered so the worst component determines the overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub issues: Vec<String>,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            issues: Vec::new(),
        }
    }

    fn flag(&mut self, status: HealthStatus, issue: String) {
        self.status = self.status.max(status);
        self.issues.push(issue);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub overall_health: HealthStatus,
    pub component_health: BTreeMap<String, ComponentHealth>,
}

impl HealthReport {
    pub fn issues(&self) -> impl Iterator<Item = (&str, &str)> {
        self.component_health.iter().flat_map(|(name, health)| {
            health
                .issues
                .iter()
                .map(move |issue| (name.as_str(), issue.as_str()))
        })
    }
}

/// Inputs to [`evaluate_health`].
pub struct HealthInputs<'a> {
    pub flags: &'a FeatureFlagState,
    pub breaker: &'a BreakerMetrics,
    pub rollback: &'a RollbackStatus,
    pub performance: &'a PerformanceStatistics,
}

pub fn evaluate_health(inputs: &HealthInputs<'_>) -> HealthReport {
    let mut components = BTreeMap::new();

    let mut breaker = ComponentHealth::healthy();
    match inputs.flags.circuit_breaker_state {
        CircuitState::Closed => {}
        CircuitState::HalfOpen => breaker.flag(
            HealthStatus::Degraded,
            "circuit breaker half-open; probing candidate".to_string(),
        ),
        CircuitState::Open => breaker.flag(
            HealthStatus::Critical,
            format!(
                "circuit breaker open ({} errors total, opened {} times)",
                inputs.breaker.total_errors, inputs.breaker.times_opened
            ),
        ),
    }
    if !inputs.flags.config.circuit_breaker_enabled {
        breaker.flag(
            HealthStatus::Degraded,
            "circuit breaker disabled; candidate errors never open it".to_string(),
        );
    }
    components.insert("circuit_breaker".to_string(), breaker);

    let mut rollback = ComponentHealth::healthy();
    match inputs.rollback.current_state {
        RollbackState::Healthy => {}
        RollbackState::RolledBack => rollback.flag(
            HealthStatus::Degraded,
            "rolled back; all traffic forced to legacy".to_string(),
        ),
        RollbackState::Recovering => {
            rollback.flag(HealthStatus::Degraded, "recovery in progress".to_string())
        }
        RollbackState::RollbackFailed => rollback.flag(
            HealthStatus::Critical,
            format!(
                "rollback failed ({}/{} recovery attempts used)",
                inputs.rollback.recovery_failures, inputs.rollback.recovery_max_attempts
            ),
        ),
    }
    if inputs.rollback.recovery_failures >= inputs.rollback.recovery_max_attempts
        && inputs.rollback.current_state != RollbackState::Healthy
    {
        rollback.flag(
            HealthStatus::Critical,
            "recovery attempts exhausted; operator action required".to_string(),
        );
    }
    components.insert("rollback".to_string(), rollback);

    let mut routing = ComponentHealth::healthy();
    match inputs.flags.config.manual_override {
        ManualOverride::None => {}
        other => routing.flag(
            HealthStatus::Degraded,
            format!("manual override {other} active"),
        ),
    }
    components.insert("routing".to_string(), routing);

    let mut canary = ComponentHealth::healthy();
    let perf = inputs.performance;
    if perf.canary_comparisons > 0 {
        let rate = perf.canary_matches as f64 / perf.canary_comparisons as f64;
        if rate < CANARY_MATCH_RATE_WARNING {
            canary.flag(
                HealthStatus::Degraded,
                format!(
                    "canary match rate {:.1}% ({} of {})",
                    rate * 100.0,
                    perf.canary_matches,
                    perf.canary_comparisons
                ),
            );
        }
    }
    if perf.candidate_timeouts > 0 {
        canary.flag(
            HealthStatus::Degraded,
            format!("{} candidate runs exceeded the canary timeout", perf.candidate_timeouts),
        );
    }
    components.insert("canary".to_string(), canary);

    let overall_health = components
        .values()
        .map(|c| c.status)
        .max()
        .unwrap_or(HealthStatus::Healthy);

    HealthReport {
        overall_health,
        component_health: components,
    }
}

// ── Status / statistics ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub system_health: HealthStatus,
    pub feature_flags: FeatureFlagState,
    pub rollback_status: RollbackStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatistics {
    pub performance_metrics: PerformanceStatistics,
    pub adapter: AdapterStatistics,
    pub rollback_history: Vec<RollbackRecord>,
    pub feature_flag_state: FeatureFlagState,
    pub circuit_breaker_metrics: BreakerMetrics,
}
