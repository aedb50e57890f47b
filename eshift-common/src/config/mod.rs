//! Configuration system for Engine Shift.
//!
//! - [`MigrationConfig`]: validated settings, replaced atomically
//! - [`ConfigPatch`]: partial, all-or-nothing changes
//! - Environment variable parsing with type safety and source tracking
//! - Optional TOML configuration file

pub mod env;
pub mod file;
pub mod migration;
pub mod source;

pub use env::{ENV_PREFIX, EnvError, EnvParser};
pub use file::{default_config_path, load_config_file, parse_config};
pub use migration::{
    ConfigPatch, MAX_BREAKER_PERIOD_SECS, MAX_CANARY_TIMEOUT_SECS, ManualOverride, MigrationConfig,
};
pub use source::{ConfigSource, Sourced};
