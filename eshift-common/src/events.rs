//! Event broadcast for breaker transitions, rollbacks and canary results.
//!
//! Components never call each other across this boundary: `FeatureFlags`
//! emits `RollbackRecommended` and the rollback monitor reacts to it.

use crate::breaker::{CircuitState, TransitionReason};
use crate::rollback::RollbackTrigger;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const MIN_CAPACITY: usize = 256;

/// Events published by the migration control layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MigrationEvent {
    BreakerTransition {
        from: CircuitState,
        to: CircuitState,
        reason: TransitionReason,
    },
    /// The breaker opened while auto-rollback is enabled.
    RollbackRecommended { reason: String },
    ConfigChanged { new_engine_percentage: u32, manual_override: String },
    RollbackExecuted {
        trigger: RollbackTrigger,
        success: bool,
        rollback_time_ms: u64,
    },
    RecoveryCompleted { success: bool, elapsed_ms: u64 },
    CanaryCompared {
        request_id: String,
        overall_match: bool,
        critical: usize,
        warnings: usize,
    },
}

impl MigrationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BreakerTransition { .. } => "breaker_transition",
            Self::RollbackRecommended { .. } => "rollback_recommended",
            Self::ConfigChanged { .. } => "config_changed",
            Self::RollbackExecuted { .. } => "rollback_executed",
            Self::RecoveryCompleted { .. } => "recovery_completed",
            Self::CanaryCompared { .. } => "canary_compared",
        }
    }

    /// Render as a single JSON line with a timestamp.
    pub fn to_json_line(&self) -> Option<String> {
        let payload = json!({
            "data": self,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => Some(serialized),
            Err(err) => {
                warn!("Failed to serialize event {}: {}", self.name(), err);
                None
            }
        }
    }
}

/// Broadcast channel for migration events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MigrationEvent>,
}

impl EventBus {
    /// Capacity below `MIN_CAPACITY` is raised to it.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(MIN_CAPACITY));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Never blocks; having no subscriber is fine.
    pub fn emit(&self, event: MigrationEvent) {
        debug!(event = event.name(), "Emitting migration event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(MIN_CAPACITY)
    }
}
