//! Wiring of flags, adapter and rollback manager behind one handle.
//!
//! One `FeatureFlags` instance is built here and shared with the adapter
//! and the rollback manager; nothing reaches for global state.

use crate::adapter::{EnrichedResult, MigrationAdapter};
use crate::config::MigrationConfig;
use crate::engine::{Engine, RequestContext};
use crate::errors::MigrationError;
use crate::flags::{FeatureFlags, RandomSource, ThreadRandom};
use crate::rollback::{RollbackManager, StateStore};
use crate::status::{HealthInputs, HealthReport, SystemStatistics, SystemStatus, evaluate_health};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct MigrationSystem {
    flags: Arc<FeatureFlags>,
    adapter: Arc<MigrationAdapter>,
    rollback: Arc<RollbackManager>,
}

impl MigrationSystem {
    pub fn new(
        config: MigrationConfig,
        legacy: Arc<dyn Engine>,
        candidate: Arc<dyn Engine>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, MigrationError> {
        Self::with_random_source(config, legacy, candidate, store, Arc::new(ThreadRandom))
    }

    pub fn with_random_source(
        config: MigrationConfig,
        legacy: Arc<dyn Engine>,
        candidate: Arc<dyn Engine>,
        store: Arc<dyn StateStore>,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self, MigrationError> {
        let flags = Arc::new(FeatureFlags::with_random_source(config, random)?);
        Ok(Self::from_flags(flags, legacy, candidate, store))
    }

    /// Wire around already configured flags.
    ///
    /// Configure the flags first: the rollback manager may force legacy
    /// routing while loading persisted state, and later configuration
    /// must not silently undo that.
    pub fn from_flags(
        flags: Arc<FeatureFlags>,
        legacy: Arc<dyn Engine>,
        candidate: Arc<dyn Engine>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let rollback = Arc::new(RollbackManager::new(Arc::clone(&flags), store));
        let adapter = Arc::new(MigrationAdapter::new(legacy, candidate, Arc::clone(&flags)));
        Self {
            flags,
            adapter,
            rollback,
        }
    }

    pub fn flags(&self) -> &Arc<FeatureFlags> {
        &self.flags
    }

    pub fn adapter(&self) -> &Arc<MigrationAdapter> {
        &self.adapter
    }

    pub fn rollback(&self) -> &Arc<RollbackManager> {
        &self.rollback
    }

    /// Start the automatic rollback monitor. Requires a tokio runtime.
    pub fn start_monitor(&self) -> JoinHandle<()> {
        self.rollback.spawn_monitor()
    }

    pub async fn execute(&self, context: Option<RequestContext>) -> EnrichedResult {
        self.adapter.execute(context).await
    }

    pub fn health_check(&self) -> HealthReport {
        let flags = self.flags.state();
        let breaker = self.flags.circuit_breaker_metrics();
        let rollback = self.rollback.status();
        let performance = self.flags.performance_statistics();
        evaluate_health(&HealthInputs {
            flags: &flags,
            breaker: &breaker,
            rollback: &rollback,
            performance: &performance,
        })
    }

    pub fn current_status(&self) -> SystemStatus {
        SystemStatus {
            system_health: self.health_check().overall_health,
            feature_flags: self.flags.state(),
            rollback_status: self.rollback.status(),
        }
    }

    pub fn statistics(&self) -> SystemStatistics {
        SystemStatistics {
            performance_metrics: self.flags.performance_statistics(),
            adapter: self.adapter.statistics(),
            rollback_history: self.rollback.rollback_history(),
            feature_flag_state: self.flags.state(),
            circuit_breaker_metrics: self.flags.circuit_breaker_metrics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_engine::MockEngine;
    use crate::rollback::{MemoryStateStore, RollbackState};
    use crate::status::HealthStatus;

    fn system(config: MigrationConfig) -> MigrationSystem {
        MigrationSystem::new(
            config,
            Arc::new(MockEngine::succeeding("legacy")),
            Arc::new(MockEngine::succeeding("candidate")),
            Arc::new(MemoryStateStore::new()),
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = MigrationSystem::new(
            MigrationConfig {
                new_engine_percentage: 101,
                ..Default::default()
            },
            Arc::new(MockEngine::succeeding("legacy")),
            Arc::new(MockEngine::succeeding("candidate")),
            Arc::new(MemoryStateStore::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, MigrationError::Configuration { .. }));
    }

    #[tokio::test]
    async fn status_and_statistics_reflect_activity() {
        let system = system(MigrationConfig {
            new_engine_percentage: 100,
            ..Default::default()
        });
        system.execute(None).await;
        system.rollback().emergency_rollback("drill", Some("ops"));

        let status = system.current_status();
        assert_eq!(status.system_health, HealthStatus::Degraded);
        assert_eq!(status.rollback_status.current_state, RollbackState::RolledBack);

        let stats = system.statistics();
        assert_eq!(stats.adapter.executions_candidate, 1);
        assert_eq!(stats.rollback_history.len(), 1);
        assert_eq!(stats.circuit_breaker_metrics.total_successes, 1);

        let json = serde_json::to_value(&stats).unwrap();
        assert!(json["performance_metrics"].is_object());
        assert!(json["feature_flag_state"]["config"].is_object());
    }

    #[test]
    fn fresh_system_is_healthy() {
        let report = system(MigrationConfig::default()).health_check();
        assert_eq!(report.overall_health, HealthStatus::Healthy);
    }
}
