//! Engine Shift: safety controls for migrating traffic from a legacy
//! engine to a candidate engine.
//!
//! Components, leaves first:
//!
//! - [`config`]: validated settings, environment and file sources.
//! - [`breaker`]: closed/open/half-open circuit breaker.
//! - [`flags`]: routing decisions, breaker ownership, statistics.
//! - [`comparator`]: structural diff of two engine results.
//! - [`adapter`]: per-request orchestration with canary and fallback.
//! - [`rollback`]: durable rollback state and bounded recovery.
//! - [`system`]: one handle wiring the above together.

pub mod adapter;
pub mod breaker;
pub mod comparator;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod flags;
pub mod logging;
pub mod mock_engine;
pub mod rollback;
pub mod status;
pub mod system;

pub use adapter::{
    AdapterStatistics, EnrichedResult, ExecutionReporter, MigrationAdapter, MigrationMetadata,
};
pub use breaker::{BreakerMetrics, CircuitState};
pub use comparator::{ComparisonResult, Discrepancy, OutputComparator, Severity};
pub use config::{ConfigPatch, ManualOverride, MigrationConfig};
pub use engine::{Engine, EngineError, EngineKind, ExecutionResult, GeneratedFile, RequestContext};
pub use errors::{ErrorCode, MigrationError};
pub use events::{EventBus, MigrationEvent};
pub use flags::{FeatureFlags, PerformanceStatistics, RandomSource, RoutingDecision, SeededRandom};
pub use rollback::{RollbackManager, RollbackState, RollbackTrigger};
pub use status::{HealthReport, HealthStatus, SystemStatistics, SystemStatus};
pub use system::MigrationSystem;
