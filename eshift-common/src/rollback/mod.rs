//! Rollback management.
//!
//! State machine:
//!
//! ```text
//! healthy --rollback--> rolled_back --recover--> recovering --> healthy
//!                                                           \-> rollback_failed
//! rollback_failed --recover (bounded)--> recovering --> ...
//! ```
//!
//! Every transition is persisted through a [`StateStore`] and reloaded at
//! construction. A restart in `rolled_back` or `rollback_failed` keeps
//! forcing legacy routing until a recovery succeeds.

mod store;

pub use store::{
    FileStateStore, MemoryStateStore, PersistedState, STATE_SCHEMA_VERSION, StateStore,
    default_state_path,
};

use crate::breaker::CircuitState;
use crate::config::{ConfigPatch, ConfigSource, ManualOverride};
use crate::errors::{ErrorCode, MigrationError};
use crate::events::MigrationEvent;
use crate::flags::FeatureFlags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackState {
    Healthy,
    RolledBack,
    RollbackFailed,
    Recovering,
}

impl RollbackState {
    /// States in which legacy routing must be forced.
    pub fn forces_legacy(self) -> bool {
        !matches!(self, Self::Healthy)
    }
}

impl fmt::Display for RollbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::RollbackFailed => write!(f, "rollback_failed"),
            Self::Recovering => write!(f, "recovering"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    CircuitBreaker,
    EmergencyManual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub id: String,
    pub triggered_at: DateTime<Utc>,
    pub trigger: RollbackTrigger,
    pub reason: String,
    /// Opaque audit string; never authenticated.
    #[serde(default)]
    pub operator: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub rollback_time_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Result of a rollback request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackOutcome {
    pub success: bool,
    pub rollback_time_ms: u64,
    pub state: RollbackState,
    pub record_id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub success: bool,
    pub steps: Vec<String>,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    pub state: RollbackState,
}

/// Read-only view for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackStatus {
    pub current_state: RollbackState,
    pub rollback_recommended: bool,
    pub history_len: usize,
    pub last_rollback: Option<RollbackRecord>,
    pub recovery_failures: u32,
    pub recovery_max_attempts: u32,
    pub last_recovery: Option<RecoveryReport>,
    pub state_location: String,
}

pub struct RollbackManager {
    flags: Arc<FeatureFlags>,
    store: Arc<dyn StateStore>,
    state: Mutex<PersistedState>,
}

impl RollbackManager {
    /// Load persisted state and re-apply a forced-legacy override if the
    /// last known state requires it. An unreadable store starts healthy.
    pub fn new(flags: Arc<FeatureFlags>, store: Arc<dyn StateStore>) -> Self {
        let mut persisted = match store.load() {
            Ok(Some(state)) => {
                info!(
                    "Loaded rollback state {} ({} records) from {}",
                    state.current_state,
                    state.history.len(),
                    store.location()
                );
                state
            }
            Ok(None) => PersistedState::default(),
            Err(err) => {
                warn!(
                    "Failed to load rollback state from {}: {}; starting healthy",
                    store.location(),
                    err
                );
                PersistedState::default()
            }
        };

        if persisted.current_state == RollbackState::Recovering {
            warn!("Previous recovery was interrupted; staying rolled back");
            persisted.current_state = RollbackState::RolledBack;
        }

        if persisted.current_state.forces_legacy() {
            if let Err(err) = force_legacy(&flags) {
                error!("Failed to re-apply forced legacy routing: {}", err);
            } else {
                info!(
                    "Rollback state is {}; legacy routing forced",
                    persisted.current_state
                );
            }
        }

        Self {
            flags,
            store,
            state: Mutex::new(persisted),
        }
    }

    /// Manager over a JSON state file.
    pub fn with_state_file(flags: Arc<FeatureFlags>, path: impl Into<PathBuf>) -> Self {
        Self::new(flags, Arc::new(FileStateStore::new(path)))
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_state(&self) -> RollbackState {
        self.lock().current_state
    }

    pub fn rollback_history(&self) -> Vec<RollbackRecord> {
        self.lock().history.clone()
    }

    pub fn recovery_failures(&self) -> u32 {
        self.lock().recovery_failures
    }

    /// Delegates to the breaker: recommended exactly when it is open.
    pub fn rollback_recommended(&self) -> bool {
        self.flags.rollback_recommended()
    }

    pub fn status(&self) -> RollbackStatus {
        let rollback_recommended = self.rollback_recommended();
        let recovery_max_attempts = self.flags.config().recovery_max_attempts;
        let state = self.lock();
        RollbackStatus {
            current_state: state.current_state,
            rollback_recommended,
            history_len: state.history.len(),
            last_rollback: state.history.last().cloned(),
            recovery_failures: state.recovery_failures,
            recovery_max_attempts,
            last_recovery: state.last_recovery.clone(),
            state_location: self.store.location(),
        }
    }

    /// Roll back because the breaker opened.
    pub fn execute_automatic_rollback(&self) -> RollbackOutcome {
        let metrics = self.flags.circuit_breaker_metrics();
        let reason = match metrics.last_transition {
            Some(t) if t.to == CircuitState::Open => format!(
                "circuit breaker opened ({:?}, {} errors total)",
                t.reason, metrics.total_errors
            ),
            _ => "circuit breaker recommended rollback".to_string(),
        };
        self.rollback(RollbackTrigger::CircuitBreaker, reason, None)
    }

    /// Operator-initiated rollback, available in any breaker state.
    /// Also clears the consecutive recovery failure counter.
    pub fn emergency_rollback(&self, reason: &str, operator: Option<&str>) -> RollbackOutcome {
        self.rollback(
            RollbackTrigger::EmergencyManual,
            reason.to_string(),
            operator.map(str::to_string),
        )
    }

    fn rollback(
        &self,
        trigger: RollbackTrigger,
        reason: String,
        operator: Option<String>,
    ) -> RollbackOutcome {
        let started = Instant::now();
        let mut state = self.lock();

        // Routing is forced to legacy before anything touches the store.
        let override_error = force_legacy(&self.flags).err().map(|e| e.to_string());

        if trigger == RollbackTrigger::EmergencyManual {
            state.recovery_failures = 0;
        }

        let id = Uuid::new_v4().to_string();
        let previous = state.current_state;
        state.current_state = RollbackState::RolledBack;
        state.history.push(RollbackRecord {
            id: id.clone(),
            triggered_at: Utc::now(),
            trigger,
            reason: reason.clone(),
            operator: operator.clone(),
            success: true,
            rollback_time_ms: 0,
            error: None,
        });

        let mut failure = override_error;
        if failure.is_none()
            && let Err(err) = self.store.save(&state)
        {
            failure = Some(err.to_string());
        }

        let rollback_time_ms = elapsed_ms(started);
        if let Some(message) = &failure {
            state.current_state = RollbackState::RollbackFailed;
            if let Some(record) = state.history.last_mut() {
                record.success = false;
                record.error = Some(message.clone());
                record.rollback_time_ms = rollback_time_ms;
            }
            if let Err(err) = self.store.save(&state) {
                warn!("Failed to persist failed rollback: {}", err);
            }
            error!("Rollback ({:?}) failed: {}", trigger, message);
        } else {
            if let Some(record) = state.history.last_mut() {
                record.rollback_time_ms = rollback_time_ms;
            }
            // Record the timing; the rolled-back state itself is already durable.
            if let Err(err) = self.store.save(&state) {
                warn!("Failed to persist rollback timing: {}", err);
            }
            info!(
                "Rollback ({:?}) executed in {}ms: {} -> {} (reason: {}, operator: {})",
                trigger,
                rollback_time_ms,
                previous,
                state.current_state,
                reason,
                operator.as_deref().unwrap_or("-")
            );
        }

        let outcome = RollbackOutcome {
            success: failure.is_none(),
            rollback_time_ms,
            state: state.current_state,
            record_id: id,
            error: failure,
        };
        drop(state);

        self.flags.events().emit(MigrationEvent::RollbackExecuted {
            trigger,
            success: outcome.success,
            rollback_time_ms,
        });
        outcome
    }

    /// Try to return to normal routing.
    ///
    /// Refused while the breaker is open or after `recovery_max_attempts`
    /// consecutive failures. Internal failures are recorded as
    /// `rollback_failed` and returned in the report, never raised.
    pub fn attempt_rollback_recovery(&self) -> RecoveryReport {
        let started = Instant::now();
        let max_attempts = self.flags.config().recovery_max_attempts;
        let breaker = self.flags.circuit_breaker_state();
        let mut state = self.lock();
        let mut steps = Vec::new();

        if state.current_state == RollbackState::Healthy {
            steps.push("already healthy; nothing to recover".to_string());
            return RecoveryReport {
                success: true,
                steps,
                elapsed_ms: elapsed_ms(started),
                error: None,
                state: RollbackState::Healthy,
            };
        }

        if state.recovery_failures >= max_attempts {
            let message = format!(
                "[{}] recovery limit reached ({} consecutive failures); run an emergency rollback or reset the counter",
                ErrorCode::RoutingRecoveryExhausted.code_string(),
                state.recovery_failures
            );
            warn!("{}", message);
            return RecoveryReport {
                success: false,
                steps,
                elapsed_ms: elapsed_ms(started),
                error: Some(message),
                state: state.current_state,
            };
        }

        if breaker == CircuitState::Open {
            let message = "circuit breaker is open; recovery refused".to_string();
            info!("{}", message);
            return RecoveryReport {
                success: false,
                steps,
                elapsed_ms: elapsed_ms(started),
                error: Some(message),
                state: state.current_state,
            };
        }
        steps.push(format!("verified circuit breaker is {breaker}"));

        let prior = state.current_state;
        let result = self.run_recovery(&mut state, &mut steps);
        let elapsed = elapsed_ms(started);

        let report = match result {
            Ok(()) => {
                info!("Rollback recovery completed in {}ms", elapsed);
                RecoveryReport {
                    success: true,
                    steps,
                    elapsed_ms: elapsed,
                    error: None,
                    state: RollbackState::Healthy,
                }
            }
            Err(message) => {
                state.current_state = RollbackState::RollbackFailed;
                state.recovery_failures += 1;
                // Keep routing safe whatever step failed.
                if let Err(err) = force_legacy(&self.flags) {
                    error!("Failed to re-force legacy routing: {}", err);
                }
                error!(
                    "Rollback recovery from {} failed (attempt {}/{}): {}",
                    prior, state.recovery_failures, max_attempts, message
                );
                RecoveryReport {
                    success: false,
                    steps,
                    elapsed_ms: elapsed,
                    error: Some(message),
                    state: RollbackState::RollbackFailed,
                }
            }
        };

        state.last_recovery = Some(report.clone());
        if let Err(err) = self.store.save(&state) {
            warn!(success = report.success, "Failed to persist recovery report: {}", err);
        }
        drop(state);

        self.flags.events().emit(MigrationEvent::RecoveryCompleted {
            success: report.success,
            elapsed_ms: report.elapsed_ms,
        });
        report
    }

    fn run_recovery(
        &self,
        state: &mut PersistedState,
        steps: &mut Vec<String>,
    ) -> Result<(), String> {
        state.current_state = RollbackState::Recovering;
        self.store.save(state).map_err(|e| e.to_string())?;
        steps.push("persisted recovering state".to_string());

        let patch = ConfigPatch {
            manual_override: Some(ManualOverride::None),
            ..Default::default()
        };
        self.flags
            .configure_from(&patch, ConfigSource::Runtime)
            .map_err(|e| e.to_string())?;
        steps.push("cleared forced legacy override".to_string());

        state.current_state = RollbackState::Healthy;
        state.recovery_failures = 0;
        self.store.save(state).map_err(|e| e.to_string())?;
        steps.push("persisted healthy state".to_string());
        Ok(())
    }

    /// Operator reset of the consecutive recovery failure counter.
    pub fn reset_recovery_attempts(&self) {
        let mut state = self.lock();
        state.recovery_failures = 0;
        if let Err(err) = self.store.save(&state) {
            warn!("Failed to persist recovery counter reset: {}", err);
        }
    }

    /// Subscribe to flag events and roll back automatically when the
    /// breaker recommends it and auto-rollback is enabled.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut rx = self.flags.events().subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(MigrationEvent::RollbackRecommended { reason }) => {
                        debug!("Rollback recommended: {}", reason);
                        manager.handle_recommendation().await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Rollback monitor lagged by {} events", skipped);
                        if manager.rollback_recommended() {
                            manager.handle_recommendation().await;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle_recommendation(self: &Arc<Self>) {
        if !self.flags.config().auto_rollback_enabled {
            return;
        }
        if self.current_state() != RollbackState::Healthy {
            debug!("Already rolled back; ignoring recommendation");
            return;
        }
        let manager = Arc::clone(self);
        match tokio::task::spawn_blocking(move || manager.execute_automatic_rollback()).await {
            Ok(outcome) if outcome.success => {}
            Ok(outcome) => warn!(
                "Automatic rollback did not persist: {}",
                outcome.error.unwrap_or_default()
            ),
            Err(err) => error!("Automatic rollback task failed: {}", err),
        }
    }
}

fn force_legacy(flags: &FeatureFlags) -> Result<(), MigrationError> {
    if flags.config().manual_override == ManualOverride::ForceLegacy {
        return Ok(());
    }
    let patch = ConfigPatch {
        manual_override: Some(ManualOverride::ForceLegacy),
        ..Default::default()
    };
    flags.configure_from(&patch, ConfigSource::Runtime).map(|_| ())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
