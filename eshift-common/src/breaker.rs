//! Circuit breaker guarding the candidate engine.
//!
//! Explicit three-state machine:
//!
//! - **Closed**: candidate traffic flows; errors inside the sliding window
//!   are counted and the breaker opens once the count reaches the threshold.
//!   Successes do not reset the count; errors only leave the window by age.
//! - **Open**: candidate traffic is refused. After the cool-down (or an
//!   operator reset) the breaker moves to HalfOpen, never straight to Closed.
//! - **HalfOpen**: probes are admitted. Enough consecutive successes close
//!   the breaker; any failure reopens it.
//!
//! The breaker itself is not synchronized. `FeatureFlags` owns it behind a
//! mutex so check-then-transition is a single critical section. Time-based
//! methods take `now` so transitions are deterministic under test.

use crate::config::MigrationConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Windowed error count reached the threshold.
    ErrorThreshold,
    /// A half-open probe failed.
    ProbeFailed,
    /// Enough half-open probes succeeded.
    ProbeSucceeded,
    /// The open cool-down elapsed.
    CooldownElapsed,
    /// Operator forced the breaker open.
    ManualTrip,
    /// Operator reset an open breaker.
    ManualReset,
}

/// A single observable state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
}

/// Breaker thresholds, derived from [`MigrationConfig`].
#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    /// When false the breaker counts but never opens on its own.
    pub enabled: bool,
    pub error_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
    pub half_open_success_threshold: u32,
}

impl From<&MigrationConfig> for BreakerSettings {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            enabled: config.circuit_breaker_enabled,
            error_threshold: config.error_threshold.max(1),
            window: config.breaker_window(),
            cooldown: config.breaker_cooldown(),
            half_open_success_threshold: config.half_open_success_threshold.max(1),
        }
    }
}

/// Counters exposed on the statistics surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub state: Option<CircuitState>,
    pub total_errors: u64,
    pub total_successes: u64,
    pub times_opened: u64,
    pub window_error_count: usize,
    pub consecutive_probe_successes: u32,
    pub last_opened_at: Option<DateTime<Utc>>,
    pub last_transition: Option<Transition>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    /// Timestamps of errors recorded while closed, oldest first.
    window: VecDeque<Instant>,
    opened_at: Option<Instant>,
    consecutive_probe_successes: u32,
    metrics: BreakerMetrics,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            consecutive_probe_successes: 0,
            metrics: BreakerMetrics::default(),
        }
    }

    /// State as last computed. Call [`refresh`](Self::refresh) first to
    /// apply an elapsed cool-down.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        BreakerMetrics {
            state: Some(self.state),
            window_error_count: self.window.len(),
            consecutive_probe_successes: self.consecutive_probe_successes,
            ..self.metrics.clone()
        }
    }

    /// Apply time-based transitions: Open -> HalfOpen once cooled down.
    pub fn refresh(&mut self, settings: &BreakerSettings, now: Instant) -> Option<Transition> {
        if self.state != CircuitState::Open {
            return None;
        }
        let opened_at = self.opened_at?;
        if now.saturating_duration_since(opened_at) >= settings.cooldown {
            return Some(self.transition(CircuitState::HalfOpen, TransitionReason::CooldownElapsed));
        }
        None
    }

    /// Record a candidate success. Call [`refresh`](Self::refresh) first.
    pub fn record_success(&mut self, settings: &BreakerSettings, now: Instant) -> Option<Transition> {
        self.metrics.total_successes += 1;

        match self.state {
            CircuitState::Closed => {
                self.prune(settings, now);
                None
            }
            CircuitState::HalfOpen => {
                self.consecutive_probe_successes += 1;
                if self.consecutive_probe_successes >= settings.half_open_success_threshold {
                    Some(self.transition(CircuitState::Closed, TransitionReason::ProbeSucceeded))
                } else {
                    None
                }
            }
            // Late outcomes can arrive while open; they only count.
            CircuitState::Open => None,
        }
    }

    /// Record a candidate error. Call [`refresh`](Self::refresh) first.
    pub fn record_error(&mut self, settings: &BreakerSettings, now: Instant) -> Option<Transition> {
        self.metrics.total_errors += 1;

        match self.state {
            CircuitState::Closed => {
                self.window.push_back(now);
                self.prune(settings, now);
                if settings.enabled && self.window.len() >= settings.error_threshold as usize {
                    self.opened_at = Some(now);
                    Some(self.transition(CircuitState::Open, TransitionReason::ErrorThreshold))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.opened_at = Some(now);
                Some(self.transition(CircuitState::Open, TransitionReason::ProbeFailed))
            }
            CircuitState::Open => None,
        }
    }

    /// Force the breaker open regardless of counts.
    pub fn trip(&mut self, now: Instant) -> Option<Transition> {
        if self.state == CircuitState::Open {
            return None;
        }
        self.opened_at = Some(now);
        Some(self.transition(CircuitState::Open, TransitionReason::ManualTrip))
    }

    /// Operator reset: Open -> HalfOpen. Other states are left alone so
    /// recovery always passes through a probe.
    pub fn reset(&mut self) -> Option<Transition> {
        if self.state != CircuitState::Open {
            return None;
        }
        Some(self.transition(CircuitState::HalfOpen, TransitionReason::ManualReset))
    }

    fn prune(&mut self, settings: &BreakerSettings, now: Instant) {
        while let Some(oldest) = self.window.front() {
            if now.saturating_duration_since(*oldest) > settings.window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&mut self, to: CircuitState, reason: TransitionReason) -> Transition {
        let transition = Transition {
            from: self.state,
            to,
            reason,
        };
        self.state = to;
        self.consecutive_probe_successes = 0;
        match to {
            CircuitState::Open => {
                self.metrics.times_opened += 1;
                self.metrics.last_opened_at = Some(Utc::now());
            }
            CircuitState::Closed => {
                self.window.clear();
                self.opened_at = None;
            }
            CircuitState::HalfOpen => {
                self.window.clear();
            }
        }
        self.metrics.last_transition = Some(transition);
        transition
    }
}
