use crate::scheduler::Scheduler;
use crate::SchedulerError;
use chrono::{DateTime, Utc};
use osm_core::{
    generate_uuid, validate_uuid, CommandOutcome, CoreError, MigrationDescriptor, MigrationKind,
    MigrationRecord, MigrationStatus, NotApplicableReason, ShardScope, StrategyOptions,
};
use osm_storage::{StorageError, UpdateOutcome};
use std::collections::BTreeSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitDisposition {
    Created,
    /// The uuid was already known and still active, or already Complete.
    Existing,
    /// A Failed or Cancelled record started a new cycle.
    Reopened,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub record: MigrationRecord,
    pub disposition: SubmitDisposition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Artifacts(Vec<String>),
    NotApplicable(NotApplicableReason),
}

impl Scheduler {
    /// Registers a migration, or returns the existing record for a known
    /// `(uuid, migration_context)`.
    pub fn submit(
        &self,
        mut descriptor: MigrationDescriptor,
        strategy: StrategyOptions,
        migration_context: &str,
        now: DateTime<Utc>,
    ) -> Result<Submission, SchedulerError> {
        if strategy.strategy.is_direct() {
            return Err(SchedulerError::InvalidDescriptor(
                "direct strategy bypasses the scheduler".to_string(),
            ));
        }
        if let MigrationKind::Statement { statement, .. } = &descriptor.kind {
            if statement.trim().is_empty() {
                return Err(SchedulerError::InvalidDescriptor(
                    "empty statement".to_string(),
                ));
            }
            descriptor.target_tables = descriptor
                .target_tables
                .iter()
                .map(|table| table.trim().to_string())
                .filter(|table| !table.is_empty())
                .collect();
            if descriptor.target_tables.is_empty() {
                return Err(CoreError::EmptyTargetTables.into());
            }
        }

        let uuid = descriptor.uuid.clone().unwrap_or_else(generate_uuid);
        validate_uuid(&uuid)?;

        for _ in 0..self.attempts() {
            if let Some(existing) = self.store.get(&uuid)? {
                if existing.migration_context != migration_context {
                    return Err(SchedulerError::AmbiguousResubmission {
                        uuid,
                        existing_context: existing.migration_context,
                        requested_context: migration_context.to_string(),
                    });
                }
                if !matches!(
                    existing.status,
                    MigrationStatus::Failed | MigrationStatus::Cancelled
                ) {
                    debug!(
                        event = "migration_resubmitted",
                        shard = %self.shard(),
                        uuid = %existing.uuid,
                        status = %existing.status,
                    );
                    return Ok(Submission {
                        record: existing,
                        disposition: SubmitDisposition::Existing,
                    });
                }

                let outcome = self.store.compare_and_update(&uuid, existing.status, |current| {
                    current.reopen(strategy.clone()).is_ok()
                })?;
                if let UpdateOutcome::Applied(record) = outcome {
                    info!(
                        event = "migration_reopened",
                        shard = %self.shard(),
                        uuid = %record.uuid,
                        status = %record.status,
                        retries = record.retries,
                    );
                    return Ok(Submission {
                        record,
                        disposition: SubmitDisposition::Reopened,
                    });
                }
                continue;
            }

            let target_tables = self.resolve_target_tables(&descriptor)?;
            let record = MigrationRecord::queued(
                uuid.clone(),
                migration_context,
                descriptor.kind.clone(),
                target_tables,
                strategy.clone(),
                now,
            );
            match self.store.insert(&record) {
                Ok(()) => {
                    self.log_transition(&record);
                    return Ok(Submission {
                        record,
                        disposition: SubmitDisposition::Created,
                    });
                }
                Err(StorageError::DuplicateKey(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Err(SchedulerError::Contention {
            uuid,
            attempts: self.attempts(),
        })
    }

    fn resolve_target_tables(
        &self,
        descriptor: &MigrationDescriptor,
    ) -> Result<BTreeSet<String>, SchedulerError> {
        let MigrationKind::Revert { reverted_uuid } = &descriptor.kind else {
            return Ok(descriptor.target_tables.clone());
        };

        let Some(reverted) = self.store.get(reverted_uuid)? else {
            return Err(SchedulerError::RevertTarget {
                uuid: reverted_uuid.clone(),
                reason: "migration not found".to_string(),
            });
        };
        if reverted.status != MigrationStatus::Complete {
            return Err(SchedulerError::RevertTarget {
                uuid: reverted_uuid.clone(),
                reason: format!("migration is {}", reverted.status),
            });
        }
        Ok(reverted.target_tables)
    }

    pub fn launch(
        &self,
        uuid: &str,
        scope: &ShardScope,
    ) -> Result<CommandOutcome, SchedulerError> {
        if !scope.matches(self.shard()) {
            return Ok(CommandOutcome::NotApplicable(
                NotApplicableReason::ShardOutOfScope,
            ));
        }
        self.apply_command(
            uuid,
            |record| match record.status {
                MigrationStatus::Queued if record.postpone_launch() => Ok(()),
                MigrationStatus::Queued => Err(NotApplicableReason::LaunchNotPostponed),
                status => Err(NotApplicableReason::Status(status)),
            },
            |record| {
                record.strategy.postpone_launch = false;
                true
            },
        )
    }

    pub fn complete(&self, uuid: &str) -> Result<CommandOutcome, SchedulerError> {
        self.apply_command(
            uuid,
            |record| match record.status {
                MigrationStatus::Queued | MigrationStatus::Ready => Ok(()),
                MigrationStatus::Running if record.cutover_started => {
                    Err(NotApplicableReason::CutoverInProgress)
                }
                MigrationStatus::Running => Ok(()),
                status => Err(NotApplicableReason::Status(status)),
            },
            |record| {
                record.complete_requested = true;
                true
            },
        )
    }

    /// Cancels Queued and Ready records outright; a Running record gets an
    /// abort request that the next tick hands to the executor.
    pub fn cancel(
        &self,
        uuid: &str,
        now: DateTime<Utc>,
    ) -> Result<CommandOutcome, SchedulerError> {
        self.apply_command(
            uuid,
            |record| match record.status {
                MigrationStatus::Queued | MigrationStatus::Ready => Ok(()),
                MigrationStatus::Running if record.cutover_started => {
                    Err(NotApplicableReason::CutoverInProgress)
                }
                MigrationStatus::Running => Ok(()),
                status => Err(NotApplicableReason::Status(status)),
            },
            |record| match record.status {
                MigrationStatus::Running => {
                    record.cancel_requested = true;
                    true
                }
                _ => {
                    record.message = Some("cancelled by request".to_string());
                    record.transition(MigrationStatus::Cancelled, now).is_ok()
                }
            },
        )
    }

    pub fn get_status(&self, uuid: &str) -> Result<MigrationRecord, SchedulerError> {
        self.store
            .get(uuid)?
            .ok_or_else(|| SchedulerError::NotFound(uuid.to_string()))
    }

    /// Records in submission order. An empty filter lists every status.
    pub fn list(
        &self,
        statuses: &[MigrationStatus],
    ) -> Result<Vec<MigrationRecord>, SchedulerError> {
        let all = MigrationStatus::ALL;
        let statuses = if statuses.is_empty() {
            &all[..]
        } else {
            statuses
        };
        Ok(self.store.scan_by_status(statuses)?)
    }

    pub fn artifacts_for_cleanup(&self) -> Result<Vec<(String, Vec<String>)>, SchedulerError> {
        Ok(self.store.artifacts_for_cleanup()?)
    }

    pub fn cleanup(&self, uuid: &str) -> Result<CleanupOutcome, SchedulerError> {
        for _ in 0..self.attempts() {
            let Some(record) = self.store.get(uuid)? else {
                return Ok(CleanupOutcome::NotApplicable(
                    NotApplicableReason::UnknownMigration,
                ));
            };
            if !record.status.is_terminal() {
                return Ok(CleanupOutcome::NotApplicable(NotApplicableReason::Status(
                    record.status,
                )));
            }

            let outcome = self.store.compare_and_update(uuid, record.status, |current| {
                current.cleanup_requested = true;
                true
            })?;
            if let UpdateOutcome::Applied(updated) = outcome {
                return Ok(CleanupOutcome::Artifacts(
                    updated.artifacts.into_iter().collect(),
                ));
            }
        }
        Err(SchedulerError::Contention {
            uuid: uuid.to_string(),
            attempts: self.attempts(),
        })
    }

    pub fn launch_all(&self, scope: &ShardScope) -> Result<Vec<String>, SchedulerError> {
        if !scope.matches(self.shard()) {
            return Ok(Vec::new());
        }
        let mut launched = Vec::new();
        for record in self.store.scan_by_status(&[MigrationStatus::Queued])? {
            if record.postpone_launch() && self.launch(&record.uuid, scope)?.is_applied() {
                launched.push(record.uuid);
            }
        }
        Ok(launched)
    }

    pub fn complete_all(&self) -> Result<Vec<String>, SchedulerError> {
        let mut completed = Vec::new();
        for record in self.store.scan_by_status(&[
            MigrationStatus::Queued,
            MigrationStatus::Ready,
            MigrationStatus::Running,
        ])? {
            if !record.postpone_completion() || record.complete_requested {
                continue;
            }
            if self.complete(&record.uuid)?.is_applied() {
                completed.push(record.uuid);
            }
        }
        Ok(completed)
    }

    pub fn cancel_all_pending(&self, now: DateTime<Utc>) -> Result<Vec<String>, SchedulerError> {
        let mut cancelled = Vec::new();
        for record in self.store.scan_by_status(&[
            MigrationStatus::Queued,
            MigrationStatus::Ready,
            MigrationStatus::Running,
        ])? {
            if self.cancel(&record.uuid, now)?.is_applied() {
                cancelled.push(record.uuid);
            }
        }
        Ok(cancelled)
    }

    /// Reads the record, lets `check` decide applicability, then writes
    /// `mutate` if the record has not moved in between. `check` runs again on
    /// the fresh row inside the update.
    fn apply_command<C, M>(
        &self,
        uuid: &str,
        check: C,
        mutate: M,
    ) -> Result<CommandOutcome, SchedulerError>
    where
        C: Fn(&MigrationRecord) -> Result<(), NotApplicableReason>,
        M: Fn(&mut MigrationRecord) -> bool,
    {
        for _ in 0..self.attempts() {
            let Some(record) = self.store.get(uuid)? else {
                return Ok(CommandOutcome::NotApplicable(
                    NotApplicableReason::UnknownMigration,
                ));
            };
            if let Err(reason) = check(&record) {
                return Ok(CommandOutcome::NotApplicable(reason));
            }

            let outcome = self.store.compare_and_update(uuid, record.status, |current| {
                check(current).is_ok() && mutate(current)
            })?;
            match outcome {
                UpdateOutcome::Applied(updated) => {
                    self.log_transition(&updated);
                    return Ok(CommandOutcome::Applied);
                }
                UpdateOutcome::Missing => {
                    return Ok(CommandOutcome::NotApplicable(
                        NotApplicableReason::UnknownMigration,
                    ))
                }
                UpdateOutcome::Declined(_) | UpdateOutcome::Conflict { .. } => {
                    debug!(event = "command_retry", shard = %self.shard(), uuid = %uuid);
                }
            }
        }
        Err(SchedulerError::Contention {
            uuid: uuid.to_string(),
            attempts: self.attempts(),
        })
    }

    fn attempts(&self) -> u32 {
        self.config.max_store_retries.saturating_add(1)
    }
}
