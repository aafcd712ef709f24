pub mod admission;
pub mod commands;
pub mod config;
pub mod conflict;
pub mod scheduler;
pub mod service;
pub mod telemetry;

use osm_core::CoreError;
use osm_storage::{SqliteError, StorageError};
use thiserror::Error;

pub use commands::{CleanupOutcome, Submission, SubmitDisposition};
pub use config::{ConfigError, SchedulerConfig};
pub use conflict::ConflictTracker;
pub use scheduler::{Scheduler, TickReport};
pub use service::SchedulerService;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("migration {uuid} exists with context {existing_context:?}, not {requested_context:?}")]
    AmbiguousResubmission {
        uuid: String,
        existing_context: String,
        requested_context: String,
    },
    #[error("invalid migration descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("cannot revert {uuid}: {reason}")]
    RevertTarget { uuid: String, reason: String },
    #[error("migration not found: {0}")]
    NotFound(String),
    #[error("migration {uuid} kept changing under concurrent updates ({attempts} attempts)")]
    Contention { uuid: String, attempts: u32 },
    #[error("scheduler worker failed: {0}")]
    Worker(String),
}

impl SchedulerError {
    /// Errors that mean the store itself is unusable. The shard loop stops on
    /// these; everything else is logged and retried on the next tick. A row
    /// that fails to decode is a data problem, not an outage.
    pub fn is_fatal(&self) -> bool {
        match self {
            SchedulerError::Storage(StorageError::Sqlite(err)) => !matches!(
                err,
                SqliteError::FromSqlConversionFailure(..)
                    | SqliteError::InvalidColumnType(..)
                    | SqliteError::IntegralValueOutOfRange(..)
            ),
            SchedulerError::Storage(
                StorageError::LockPoisoned | StorageError::UnsupportedSchemaVersion { .. },
            )
            | SchedulerError::Worker(_) => true,
            _ => false,
        }
    }
}
