use crate::admission::{self, QueuedVerdict, ReadyVerdict};
use crate::config::SchedulerConfig;
use crate::conflict::ConflictTracker;
use crate::SchedulerError;
use chrono::{DateTime, Utc};
use osm_core::collaborators::{
    AbortResult, CutoverResult, Executor, ExecutorHandle, ExecutorProgress, NeverThrottled,
    ThrottleOracle,
};
use osm_core::{MigrationRecord, MigrationStatus};
use osm_storage::{MigrationStore, UpdateOutcome};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: usize,
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub abandoned: usize,
    pub postponed: usize,
    pub blocked: usize,
    pub awaiting_slot: usize,
    pub throttled: usize,
    pub executor_errors: usize,
    pub store_conflicts: usize,
}

impl TickReport {
    pub fn has_transitions(&self) -> bool {
        self.promoted + self.started + self.completed + self.failed + self.cancelled > 0
    }
}

/// Reconciliation engine for one shard. Every tick reads the store, drives
/// Running migrations through the executor, and admits new work.
pub struct Scheduler {
    pub(crate) config: SchedulerConfig,
    pub(crate) store: Arc<MigrationStore>,
    executor: Arc<dyn Executor>,
    throttle: Arc<dyn ThrottleOracle>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<MigrationStore>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            config,
            store,
            executor,
            throttle: Arc::new(NeverThrottled),
        }
    }

    pub fn with_throttle(mut self, throttle: Arc<dyn ThrottleOracle>) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn shard(&self) -> &str {
        &self.config.shard
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &MigrationStore {
        &self.store
    }

    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let mut report = TickReport::default();

        for record in self.store.scan_by_status(&[MigrationStatus::Running])? {
            self.drive_running(record, now, &mut report)?;
        }

        let holders = self
            .store
            .scan_by_status(&[MigrationStatus::Ready, MigrationStatus::Running])?;
        let mut tracker = ConflictTracker::from_records(&holders);

        let queued = self.store.scan_by_status(&[MigrationStatus::Queued])?;
        self.admit_queued(queued, &mut tracker, now, &mut report)?;

        let ready = self.store.scan_by_status(&[MigrationStatus::Ready])?;
        self.start_ready(ready, &mut tracker, now, &mut report)?;

        if report.has_transitions() {
            info!(
                event = "scheduler_tick",
                shard = %self.shard(),
                promoted = report.promoted,
                started = report.started,
                completed = report.completed,
                failed = report.failed,
                cancelled = report.cancelled,
            );
        }
        Ok(report)
    }

    fn admit_queued(
        &self,
        queued: Vec<MigrationRecord>,
        tracker: &mut ConflictTracker,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        for record in queued {
            let instant_capable =
                record.strategy.prefer_instant_ddl && self.executor.is_instant(&record);
            match admission::evaluate_queued(&record, tracker, instant_capable) {
                QueuedVerdict::Promote => {}
                QueuedVerdict::AwaitLaunch | QueuedVerdict::AwaitComplete => {
                    report.postponed += 1;
                    continue;
                }
                QueuedVerdict::Blocked { holders } => {
                    debug!(
                        event = "migration_blocked",
                        shard = %self.shard(),
                        uuid = %record.uuid,
                        holders = ?holders,
                    );
                    report.blocked += 1;
                    continue;
                }
            }

            let outcome = self.store.compare_and_update(
                &record.uuid,
                MigrationStatus::Queued,
                |current| {
                    !current.postpone_launch()
                        && current.transition(MigrationStatus::Ready, now).is_ok()
                },
            )?;
            if let Some(updated) = self.observe(outcome, report) {
                self.log_transition(&updated);
                tracker.hold(&updated);
                report.promoted += 1;
            }
        }
        Ok(())
    }

    fn start_ready(
        &self,
        ready: Vec<MigrationRecord>,
        tracker: &mut ConflictTracker,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        for record in ready {
            if let ReadyVerdict::AwaitExclusiveSlot { holder } =
                admission::evaluate_ready(&record, tracker)
            {
                debug!(
                    event = "migration_awaiting_slot",
                    shard = %self.shard(),
                    uuid = %record.uuid,
                    holder = %holder,
                );
                report.awaiting_slot += 1;
                continue;
            }

            let outcome = self.store.compare_and_update(
                &record.uuid,
                MigrationStatus::Ready,
                |current| current.transition(MigrationStatus::Running, now).is_ok(),
            )?;
            if let Some(updated) = self.observe(outcome, report) {
                self.log_transition(&updated);
                tracker.hold(&updated);
                report.started += 1;
                self.begin_execution(&updated, now, report)?;
            }
        }
        Ok(())
    }

    fn drive_running(
        &self,
        record: MigrationRecord,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        if record.cancel_requested && !record.cutover_started {
            return self.abort_running(&record, now, report);
        }

        let Some(handle) = record.executor_handle.clone().map(ExecutorHandle::new) else {
            return self.begin_execution(&record, now, report);
        };

        let record = match self.executor.poll(&handle) {
            Ok(progress) => {
                if let Some(failure) = progress.failure.clone() {
                    self.settle(
                        &record,
                        MigrationStatus::Failed,
                        Some(failure),
                        &progress.artifacts,
                        now,
                        report,
                    )?;
                    return Ok(());
                }
                match self.record_progress(&record, &progress, report)? {
                    Some(updated) => updated,
                    None => return Ok(()),
                }
            }
            Err(err) => {
                warn!(
                    event = "executor_poll_error",
                    shard = %self.shard(),
                    uuid = %record.uuid,
                    error = %err,
                );
                report.executor_errors += 1;
                record
            }
        };

        if !record.cutover_started {
            if let Some(silence) = self.silence(&record, now) {
                let message = format!(
                    "abandoned: no liveness for {}s",
                    silence.num_seconds()
                );
                if self.settle(&record, MigrationStatus::Failed, Some(message), &[], now, report)? {
                    report.abandoned += 1;
                }
                return Ok(());
            }
        }

        if !self.cutover_permitted(&record, report) {
            return Ok(());
        }
        self.cut_over(&record, &handle, now, report)
    }

    fn begin_execution(
        &self,
        record: &MigrationRecord,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        match self.executor.begin(record) {
            Ok(handle) => {
                let outcome = self.store.compare_and_update(
                    &record.uuid,
                    MigrationStatus::Running,
                    |current| {
                        if current.executor_handle.is_some() {
                            return false;
                        }
                        current.executor_handle = Some(handle.as_str().to_string());
                        true
                    },
                )?;
                if self.observe(outcome, report).is_some() {
                    debug!(
                        event = "migration_execution_started",
                        shard = %self.shard(),
                        uuid = %record.uuid,
                        handle = %handle.as_str(),
                    );
                }
                Ok(())
            }
            Err(err) => {
                report.executor_errors += 1;
                self.settle(
                    record,
                    MigrationStatus::Failed,
                    Some(err.to_string()),
                    &[],
                    now,
                    report,
                )?;
                Ok(())
            }
        }
    }

    fn record_progress(
        &self,
        record: &MigrationRecord,
        progress: &ExecutorProgress,
        report: &mut TickReport,
    ) -> Result<Option<MigrationRecord>, SchedulerError> {
        let outcome = self.store.compare_and_update(
            &record.uuid,
            MigrationStatus::Running,
            |current| {
                current.ready_to_complete = progress.ready_to_complete;
                current.liveness_at = match current.liveness_at {
                    Some(previous) if previous > progress.liveness_at => Some(previous),
                    _ => Some(progress.liveness_at),
                };
                current.add_artifacts(progress.artifacts.iter().cloned());
                true
            },
        )?;
        Ok(self.observe(outcome, report))
    }

    fn silence(&self, record: &MigrationRecord, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let last_seen = record.liveness_at.or(record.started_at)?;
        let silence = now - last_seen;
        (silence > self.config.liveness_timeout()).then_some(silence)
    }

    fn cutover_permitted(&self, record: &MigrationRecord, report: &mut TickReport) -> bool {
        if record.cutover_started {
            return true;
        }
        if !record.ready_to_complete || !record.completion_permitted() || record.cancel_requested
        {
            return false;
        }
        if self.throttle.is_throttled(record) {
            debug!(
                event = "migration_throttled",
                shard = %self.shard(),
                uuid = %record.uuid,
            );
            report.throttled += 1;
            return false;
        }
        true
    }

    fn cut_over(
        &self,
        record: &MigrationRecord,
        handle: &ExecutorHandle,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        if !record.cutover_started {
            let outcome = self.store.compare_and_update(
                &record.uuid,
                MigrationStatus::Running,
                |current| {
                    if current.cancel_requested {
                        return false;
                    }
                    current.cutover_started = true;
                    true
                },
            )?;
            if self.observe(outcome, report).is_none() {
                return Ok(());
            }
        }

        info!(
            event = "migration_cutover",
            shard = %self.shard(),
            uuid = %record.uuid,
        );
        let (next, message) = match self.executor.cutover(handle) {
            Ok(CutoverResult::Complete) => (MigrationStatus::Complete, None),
            Ok(CutoverResult::Failed(message)) => (MigrationStatus::Failed, Some(message)),
            Err(err) => {
                report.executor_errors += 1;
                (MigrationStatus::Failed, Some(err.to_string()))
            }
        };
        self.settle(record, next, message, &[], now, report)?;
        Ok(())
    }

    fn abort_running(
        &self,
        record: &MigrationRecord,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        let Some(handle) = record.executor_handle.clone().map(ExecutorHandle::new) else {
            self.settle(
                record,
                MigrationStatus::Cancelled,
                Some("cancelled before execution began".to_string()),
                &[],
                now,
                report,
            )?;
            return Ok(());
        };

        let (next, message) = match self.executor.abort(&handle) {
            Ok(AbortResult::Cancelled) => (MigrationStatus::Cancelled, None),
            Ok(AbortResult::Failed(message)) => (MigrationStatus::Failed, Some(message)),
            Err(err) => {
                report.executor_errors += 1;
                (MigrationStatus::Failed, Some(err.to_string()))
            }
        };
        self.settle(record, next, message, &[], now, report)?;
        Ok(())
    }

    /// Moves a Running record to a terminal status. Returns whether this call
    /// performed the transition.
    fn settle(
        &self,
        record: &MigrationRecord,
        next: MigrationStatus,
        message: Option<String>,
        artifacts: &[String],
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<bool, SchedulerError> {
        let outcome = self
            .store
            .compare_and_update(&record.uuid, record.status, |current| {
                current.add_artifacts(artifacts.iter().cloned());
                if message.is_some() {
                    current.message = message.clone();
                }
                current.transition(next, now).is_ok()
            })?;

        let Some(updated) = self.observe(outcome, report) else {
            return Ok(false);
        };
        match next {
            MigrationStatus::Complete => report.completed += 1,
            MigrationStatus::Failed => report.failed += 1,
            MigrationStatus::Cancelled => report.cancelled += 1,
            _ => {}
        }
        if next == MigrationStatus::Failed {
            warn!(
                event = "migration_failed",
                shard = %self.shard(),
                uuid = %updated.uuid,
                status = %updated.status,
                message = updated.message.as_deref().unwrap_or(""),
            );
        } else {
            self.log_transition(&updated);
        }
        Ok(true)
    }

    fn observe(&self, outcome: UpdateOutcome, report: &mut TickReport) -> Option<MigrationRecord> {
        match outcome {
            UpdateOutcome::Applied(record) => Some(record),
            UpdateOutcome::Conflict { found } => {
                debug!(
                    event = "store_conflict",
                    shard = %self.shard(),
                    found = %found,
                );
                report.store_conflicts += 1;
                None
            }
            UpdateOutcome::Declined(_) | UpdateOutcome::Missing => None,
        }
    }

    pub(crate) fn log_transition(&self, record: &MigrationRecord) {
        info!(
            event = "migration_transition",
            shard = %self.shard(),
            uuid = %record.uuid,
            status = %record.status,
        );
    }
}
