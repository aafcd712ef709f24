pub mod collaborators;
pub mod strategy;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

pub use strategy::{DdlStrategy, StrategyOptions};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid strategy: {0}")]
    InvalidStrategy(String),
    #[error("invalid migration uuid: {0:?}")]
    InvalidUuid(String),
    #[error("unknown status: {0}")]
    UnknownStatus(String),
    #[error("unknown ddl action: {0}")]
    UnknownAction(String),
    #[error("migration must name at least one target table")]
    EmptyTargetTables,
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: MigrationStatus,
        to: MigrationStatus,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Queued,
    Ready,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl MigrationStatus {
    pub const ALL: [MigrationStatus; 6] = [
        MigrationStatus::Queued,
        MigrationStatus::Ready,
        MigrationStatus::Running,
        MigrationStatus::Complete,
        MigrationStatus::Failed,
        MigrationStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Queued => "queued",
            MigrationStatus::Ready => "ready",
            MigrationStatus::Running => "running",
            MigrationStatus::Complete => "complete",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Complete | MigrationStatus::Failed | MigrationStatus::Cancelled
        )
    }

    pub fn holds_tables(&self) -> bool {
        matches!(self, MigrationStatus::Ready | MigrationStatus::Running)
    }

    /// Forward edges of the lifecycle. Leaving a terminal state is only possible
    /// through [`MigrationRecord::reopen`].
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, next),
            (Queued, Ready)
                | (Queued, Cancelled)
                | (Ready, Running)
                | (Ready, Cancelled)
                | (Running, Complete)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = CoreError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "queued" => Ok(MigrationStatus::Queued),
            "ready" => Ok(MigrationStatus::Ready),
            "running" => Ok(MigrationStatus::Running),
            "complete" => Ok(MigrationStatus::Complete),
            "failed" => Ok(MigrationStatus::Failed),
            "cancelled" | "canceled" => Ok(MigrationStatus::Cancelled),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DdlAction {
    Create,
    Alter,
    Drop,
}

impl DdlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DdlAction::Create => "create",
            DdlAction::Alter => "alter",
            DdlAction::Drop => "drop",
        }
    }
}

impl FromStr for DdlAction {
    type Err = CoreError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "create" => Ok(DdlAction::Create),
            "alter" => Ok(DdlAction::Alter),
            "drop" => Ok(DdlAction::Drop),
            other => Err(CoreError::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationKind {
    Statement { action: DdlAction, statement: String },
    Revert { reverted_uuid: String },
}

/// What a caller submits. Statement descriptors arrive pre-validated; the
/// target tables of a revert are resolved from the reverted migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationDescriptor {
    #[serde(default)]
    pub uuid: Option<String>,
    pub kind: MigrationKind,
    #[serde(default)]
    pub target_tables: BTreeSet<String>,
}

impl MigrationDescriptor {
    pub fn statement(
        action: DdlAction,
        statement: impl Into<String>,
        tables: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            uuid: None,
            kind: MigrationKind::Statement {
                action,
                statement: statement.into(),
            },
            target_tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn revert(reverted_uuid: impl Into<String>) -> Self {
        Self {
            uuid: None,
            kind: MigrationKind::Revert {
                reverted_uuid: reverted_uuid.into(),
            },
            target_tables: BTreeSet::new(),
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationRecord {
    pub uuid: String,
    pub migration_context: String,
    pub kind: MigrationKind,
    pub target_tables: BTreeSet<String>,
    pub strategy: StrategyOptions,
    pub status: MigrationStatus,
    pub ready_to_complete: bool,
    pub complete_requested: bool,
    pub cancel_requested: bool,
    pub cutover_started: bool,
    pub cleanup_requested: bool,
    pub retries: u32,
    pub artifacts: BTreeSet<String>,
    pub executor_handle: Option<String>,
    pub message: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub liveness_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MigrationRecord {
    pub fn queued(
        uuid: impl Into<String>,
        migration_context: impl Into<String>,
        kind: MigrationKind,
        target_tables: BTreeSet<String>,
        strategy: StrategyOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            migration_context: migration_context.into(),
            kind,
            target_tables,
            strategy,
            status: MigrationStatus::Queued,
            ready_to_complete: false,
            complete_requested: false,
            cancel_requested: false,
            cutover_started: false,
            cleanup_requested: false,
            retries: 0,
            artifacts: BTreeSet::new(),
            executor_handle: None,
            message: None,
            requested_at: now,
            ready_at: None,
            started_at: None,
            liveness_at: None,
            completed_at: None,
        }
    }

    pub fn allow_concurrent(&self) -> bool {
        self.strategy.allow_concurrent
    }

    pub fn postpone_launch(&self) -> bool {
        self.strategy.postpone_launch
    }

    pub fn postpone_completion(&self) -> bool {
        self.strategy.postpone_completion
    }

    pub fn completion_permitted(&self) -> bool {
        !self.strategy.postpone_completion || self.complete_requested
    }

    /// CREATE and DROP are applied in a single cutover step, as is an ALTER
    /// that prefers instant DDL and that the executor can apply instantly.
    pub fn is_immediate(&self, instant_capable: bool) -> bool {
        match &self.kind {
            MigrationKind::Statement { action, .. } => match action {
                DdlAction::Create | DdlAction::Drop => true,
                DdlAction::Alter => self.strategy.prefer_instant_ddl && instant_capable,
            },
            MigrationKind::Revert { .. } => false,
        }
    }

    pub fn transition(
        &mut self,
        next: MigrationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }

        match next {
            MigrationStatus::Ready => self.ready_at = Some(now),
            MigrationStatus::Running => {
                self.started_at = Some(now);
                self.liveness_at = Some(now);
            }
            MigrationStatus::Complete | MigrationStatus::Failed | MigrationStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            MigrationStatus::Queued => {}
        }
        self.status = next;
        Ok(())
    }

    /// Starts a new Queued cycle for a Failed or Cancelled record. The uuid,
    /// context, request time and artifacts survive; everything the previous
    /// cycle decided is reset.
    pub fn reopen(&mut self, strategy: StrategyOptions) -> Result<(), CoreError> {
        if !matches!(
            self.status,
            MigrationStatus::Failed | MigrationStatus::Cancelled
        ) {
            return Err(CoreError::IllegalTransition {
                from: self.status,
                to: MigrationStatus::Queued,
            });
        }

        self.status = MigrationStatus::Queued;
        self.strategy = strategy;
        self.retries = self.retries.saturating_add(1);
        self.ready_to_complete = false;
        self.complete_requested = false;
        self.cancel_requested = false;
        self.cutover_started = false;
        self.cleanup_requested = false;
        self.executor_handle = None;
        self.message = None;
        self.ready_at = None;
        self.started_at = None;
        self.liveness_at = None;
        self.completed_at = None;
        Ok(())
    }

    pub fn add_artifacts<I, S>(&mut self, artifacts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifacts.extend(
            artifacts
                .into_iter()
                .map(Into::into)
                .filter(|artifact: &String| !artifact.trim().is_empty()),
        );
    }
}

/// Shards a Launch command applies to. An empty scope applies everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardScope {
    shards: BTreeSet<String>,
}

impl ShardScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Self {
        Self {
            shards: input
                .split(',')
                .map(str::trim)
                .filter(|shard| !shard.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn matches(&self, shard: &str) -> bool {
        self.shards.is_empty() || self.shards.contains(shard)
    }

    pub fn is_all(&self) -> bool {
        self.shards.is_empty()
    }
}

impl FromStr for ShardScope {
    type Err = CoreError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(ShardScope::parse(input))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotApplicableReason {
    UnknownMigration,
    ShardOutOfScope,
    Status(MigrationStatus),
    LaunchNotPostponed,
    CutoverInProgress,
}

impl fmt::Display for NotApplicableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotApplicableReason::UnknownMigration => f.write_str("unknown migration"),
            NotApplicableReason::ShardOutOfScope => f.write_str("shard not in scope"),
            NotApplicableReason::Status(status) => write!(f, "migration is {status}"),
            NotApplicableReason::LaunchNotPostponed => f.write_str("launch is not postponed"),
            NotApplicableReason::CutoverInProgress => f.write_str("cutover in progress"),
        }
    }
}

/// Result of Launch, Complete and Cancel. Not applicable is a normal answer
/// for the caller, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied,
    NotApplicable(NotApplicableReason),
}

impl CommandOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CommandOutcome::Applied)
    }
}

fn uuid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("valid regex")
    })
}

pub fn validate_uuid(uuid: &str) -> Result<(), CoreError> {
    if uuid_pattern().is_match(uuid) {
        Ok(())
    } else {
        Err(CoreError::InvalidUuid(uuid.to_string()))
    }
}

/// Migration UUIDs are rendered with underscores so they are usable inside
/// artifact table names.
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + offset_secs, 0)
            .single()
            .expect("valid timestamp")
    }

    fn alter(tables: &[&str]) -> MigrationRecord {
        MigrationRecord::queued(
            "u1",
            "ctx",
            MigrationKind::Statement {
                action: DdlAction::Alter,
                statement: "alter table t1 engine=innodb".to_string(),
            },
            tables.iter().map(|t| t.to_string()).collect(),
            StrategyOptions::default(),
            ts(0),
        )
    }

    #[test]
    fn status_roundtrips_through_strings() {
        for status in MigrationStatus::ALL {
            assert_eq!(status.as_str().parse::<MigrationStatus>(), Ok(status));
        }
        assert_eq!(
            "canceled".parse::<MigrationStatus>(),
            Ok(MigrationStatus::Cancelled)
        );
        assert!("paused".parse::<MigrationStatus>().is_err());
    }

    #[test]
    fn lifecycle_stamps_timestamps() {
        let mut record = alter(&["t1"]);
        record.transition(MigrationStatus::Ready, ts(1)).expect("ready");
        record.transition(MigrationStatus::Running, ts(2)).expect("running");
        record.transition(MigrationStatus::Complete, ts(3)).expect("complete");

        assert_eq!(record.ready_at, Some(ts(1)));
        assert_eq!(record.started_at, Some(ts(2)));
        assert_eq!(record.liveness_at, Some(ts(2)));
        assert_eq!(record.completed_at, Some(ts(3)));
    }

    #[test]
    fn terminal_states_are_write_once() {
        let mut record = alter(&["t1"]);
        record
            .transition(MigrationStatus::Cancelled, ts(1))
            .expect("cancel");
        for next in MigrationStatus::ALL {
            assert!(record.transition(next, ts(2)).is_err());
        }
        assert_eq!(record.status, MigrationStatus::Cancelled);
    }

    #[test]
    fn queued_cannot_skip_ready() {
        let mut record = alter(&["t1"]);
        assert_eq!(
            record.transition(MigrationStatus::Running, ts(1)),
            Err(CoreError::IllegalTransition {
                from: MigrationStatus::Queued,
                to: MigrationStatus::Running
            })
        );
    }

    #[test]
    fn only_running_records_fail() {
        let mut record = alter(&["t1"]);
        assert!(record.transition(MigrationStatus::Failed, ts(1)).is_err());
        record.transition(MigrationStatus::Ready, ts(1)).expect("ready");
        assert_eq!(
            record.transition(MigrationStatus::Failed, ts(2)),
            Err(CoreError::IllegalTransition {
                from: MigrationStatus::Ready,
                to: MigrationStatus::Failed
            })
        );
        record.transition(MigrationStatus::Running, ts(2)).expect("running");
        record.transition(MigrationStatus::Failed, ts(3)).expect("failed");
        assert_eq!(record.completed_at, Some(ts(3)));
    }

    #[test]
    fn reopen_resets_cycle_but_keeps_artifacts() {
        let mut record = alter(&["t1"]);
        record.transition(MigrationStatus::Ready, ts(1)).expect("ready");
        record.transition(MigrationStatus::Running, ts(2)).expect("running");
        record.ready_to_complete = true;
        record.cancel_requested = true;
        record.add_artifacts(["_vt_hld_u1", " "]);
        record.transition(MigrationStatus::Cancelled, ts(3)).expect("cancel");

        record.reopen(StrategyOptions::default()).expect("reopen");

        assert_eq!(record.status, MigrationStatus::Queued);
        assert_eq!(record.retries, 1);
        assert!(!record.ready_to_complete);
        assert!(!record.cancel_requested);
        assert_eq!(record.started_at, None);
        assert_eq!(record.requested_at, ts(0));
        assert_eq!(
            record.artifacts.iter().cloned().collect::<Vec<_>>(),
            vec!["_vt_hld_u1".to_string()]
        );
    }

    #[test]
    fn reopen_rejects_complete_and_active_records() {
        let mut record = alter(&["t1"]);
        assert!(record.reopen(StrategyOptions::default()).is_err());

        record.transition(MigrationStatus::Ready, ts(1)).expect("ready");
        record.transition(MigrationStatus::Running, ts(2)).expect("running");
        record.transition(MigrationStatus::Complete, ts(3)).expect("complete");
        assert!(record.reopen(StrategyOptions::default()).is_err());
        assert_eq!(record.retries, 0);
    }

    #[test]
    fn immediate_operations() {
        let mut record = alter(&["t1"]);
        assert!(!record.is_immediate(true));
        record.strategy.prefer_instant_ddl = true;
        assert!(!record.is_immediate(false));
        assert!(record.is_immediate(true));

        record.kind = MigrationKind::Statement {
            action: DdlAction::Drop,
            statement: "drop table t1".to_string(),
        };
        assert!(record.is_immediate(false));

        record.kind = MigrationKind::Revert {
            reverted_uuid: "u0".to_string(),
        };
        assert!(!record.is_immediate(true));
    }

    #[test]
    fn shard_scope_matching() {
        assert!(ShardScope::parse("").matches("1"));
        assert!(ShardScope::all().is_all());
        assert!(ShardScope::parse("x, y, 1").matches("1"));
        assert!(!ShardScope::parse("x,y,z").matches("1"));
        assert!(ShardScope::parse(" , ").is_all());
    }

    #[test]
    fn descriptor_accepts_gateway_json() {
        let descriptor: MigrationDescriptor = serde_json::from_str(
            r#"{"kind":{"kind":"statement","action":"drop","statement":"drop table t1"},
                "target_tables":["t1"]}"#,
        )
        .expect("statement descriptor");
        assert_eq!(
            descriptor,
            MigrationDescriptor::statement(DdlAction::Drop, "drop table t1", ["t1"])
        );

        let revert: MigrationDescriptor = serde_json::from_str(
            r#"{"uuid":"r1","kind":{"kind":"revert","reverted_uuid":"u1"}}"#,
        )
        .expect("revert descriptor");
        assert_eq!(revert, MigrationDescriptor::revert("u1").with_uuid("r1"));
    }

    #[test]
    fn uuid_validation_and_generation() {
        assert!(validate_uuid("00000000_1111_2222_3333_444444444444").is_ok());
        assert!(validate_uuid("").is_err());
        assert!(validate_uuid("a b").is_err());
        assert!(validate_uuid("_leading").is_err());

        let generated = generate_uuid();
        assert!(validate_uuid(&generated).is_ok());
        assert!(!generated.contains('-'));
        assert_ne!(generated, generate_uuid());
    }
}
