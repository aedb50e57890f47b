//! Durable rollback state.
//!
//! The state file is the source of truth across restarts. Writes go to a
//! uniquely named temp file in the same directory, are fsynced, then
//! renamed over the target so readers never observe a partial document.

use super::{RecoveryReport, RollbackRecord, RollbackState};
use crate::errors::{ErrorCode, MigrationError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// On-disk document. Unknown fields are ignored on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub current_state: RollbackState,
    #[serde(default)]
    pub history: Vec<RollbackRecord>,
    #[serde(default)]
    pub recovery_failures: u32,
    #[serde(default)]
    pub last_recovery: Option<RecoveryReport>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            current_state: RollbackState::Healthy,
            history: Vec::new(),
            recovery_failures: 0,
            last_recovery: None,
        }
    }
}

/// Storage for [`PersistedState`].
///
/// `load` returns `Ok(None)` when nothing has been saved yet.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<Option<PersistedState>, MigrationError>;
    fn save(&self, state: &PersistedState) -> Result<(), MigrationError>;
    /// Human-readable location for status output.
    fn location(&self) -> String;
}

/// Default state file: `<data_local_dir>/eshift/rollback_state.json`.
pub fn default_state_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("eshift")
        .join("rollback_state.json")
}

/// JSON file store with atomic replace.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persistence_error(&self, code: ErrorCode, message: String) -> MigrationError {
        MigrationError::Persistence {
            code,
            path: self.path.clone(),
            message,
        }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<PersistedState>, MigrationError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(self.persistence_error(ErrorCode::StateReadError, err.to_string()));
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| self.persistence_error(ErrorCode::StateReadError, err.to_string()))
    }

    fn save(&self, state: &PersistedState) -> Result<(), MigrationError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let content = serde_json::to_vec_pretty(state)
            .map_err(|err| self.persistence_error(ErrorCode::StateWriteError, err.to_string()))?;
        atomic_write(&self.path, &content)
            .map_err(|err| self.persistence_error(ErrorCode::StateWriteError, err.to_string()))?;
        debug!("Persisted rollback state to {:?}", self.path);
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// In-memory store for tests and ephemeral runs. Writes can be made to
/// fail to exercise persistence error paths.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<PersistedState>>,
    fail_writes: AtomicBool,
    saves: AtomicU64,
    rejected_saves: AtomicU64,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Save attempts refused while writes were failing.
    pub fn rejected_saves(&self) -> u64 {
        self.rejected_saves.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Option<PersistedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<PersistedState>, MigrationError> {
        Ok(self.snapshot())
    }

    fn save(&self, state: &PersistedState) -> Result<(), MigrationError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            self.rejected_saves.fetch_add(1, Ordering::SeqCst);
            return Err(MigrationError::Persistence {
                code: ErrorCode::StateWriteError,
                path: PathBuf::from("<memory>"),
                message: "writes disabled".to_string(),
            });
        }
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> String {
        "<memory>".to_string()
    }
}
