//! Capabilities the scheduler delegates to: the executor that performs the
//! actual schema change, and the oracle that gates cutover under load.

use crate::MigrationRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::RwLock;
use thiserror::Error;

/// Opaque reference to a running execution, persisted on the record so a
/// restarted scheduler can resume polling it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutorHandle(pub String);

impl ExecutorHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorProgress {
    pub ready_to_complete: bool,
    pub liveness_at: DateTime<Utc>,
    pub artifacts: Vec<String>,
    /// Set when the execution failed on its own, outside cutover or abort.
    pub failure: Option<String>,
}

impl ExecutorProgress {
    pub fn alive(liveness_at: DateTime<Utc>, ready_to_complete: bool) -> Self {
        Self {
            ready_to_complete,
            liveness_at,
            artifacts: Vec::new(),
            failure: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CutoverResult {
    Complete,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortResult {
    Cancelled,
    /// The execution was past its point of no return.
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("executor error: {message}")]
pub struct ExecutorError {
    pub message: String,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub trait Executor: Send + Sync {
    fn begin(&self, record: &MigrationRecord) -> Result<ExecutorHandle, ExecutorError>;

    fn poll(&self, handle: &ExecutorHandle) -> Result<ExecutorProgress, ExecutorError>;

    fn cutover(&self, handle: &ExecutorHandle) -> Result<CutoverResult, ExecutorError>;

    fn abort(&self, handle: &ExecutorHandle) -> Result<AbortResult, ExecutorError>;

    fn is_instant(&self, _record: &MigrationRecord) -> bool {
        false
    }
}

pub trait ThrottleOracle: Send + Sync {
    fn is_throttled(&self, record: &MigrationRecord) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NeverThrottled;

impl ThrottleOracle for NeverThrottled {
    fn is_throttled(&self, _record: &MigrationRecord) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct ThrottleState {
    all: bool,
    migrations: BTreeSet<String>,
}

/// Operator-controlled throttling, either for every migration or by uuid.
#[derive(Debug, Default)]
pub struct ManualThrottle {
    state: RwLock<ThrottleState>,
}

impl ManualThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throttle_all(&self) {
        self.write(|state| state.all = true);
    }

    pub fn unthrottle_all(&self) {
        self.write(|state| {
            state.all = false;
            state.migrations.clear();
        });
    }

    pub fn throttle(&self, uuid: &str) {
        self.write(|state| {
            state.migrations.insert(uuid.to_string());
        });
    }

    pub fn unthrottle(&self, uuid: &str) {
        self.write(|state| {
            state.migrations.remove(uuid);
        });
    }

    fn write(&self, apply: impl FnOnce(&mut ThrottleState)) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        apply(&mut state);
    }
}

impl ThrottleOracle for ManualThrottle {
    fn is_throttled(&self, record: &MigrationRecord) -> bool {
        let state = self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.all || state.migrations.contains(&record.uuid)
    }
}
