use chrono::{DateTime, SecondsFormat, Utc};
use osm_core::{
    DdlAction, DdlStrategy, MigrationKind, MigrationRecord, MigrationStatus, StrategyOptions,
};
use rusqlite::types::Type;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub use rusqlite::types::Type as SqliteType;
pub use rusqlite::Error as SqliteError;

pub const MIGRATION_STORE_SCHEMA_VERSION: i64 = 2;

const RECORD_COLUMNS: &str = "
    uuid,
    migration_context,
    kind,
    ddl_action,
    statement,
    reverted_uuid,
    target_tables_json,
    strategy,
    allow_concurrent,
    postpone_launch,
    postpone_completion,
    prefer_instant_ddl,
    executor_flags_json,
    status,
    ready_to_complete,
    complete_requested,
    cancel_requested,
    cutover_started,
    cleanup_requested,
    retries,
    artifacts_json,
    executor_handle,
    message,
    requested_at,
    ready_at,
    started_at,
    liveness_at,
    completed_at
";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("duplicate migration uuid: {0}")]
    DuplicateKey(String),
    #[error("store connection lock poisoned")]
    LockPoisoned,
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Result of [`MigrationStore::compare_and_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The mutation was written; carries the record as stored.
    Applied(MigrationRecord),
    /// The mutator looked at the current record and chose not to write.
    Declined(MigrationRecord),
    /// The record was no longer in the expected status.
    Conflict { found: MigrationStatus },
    Missing,
}

impl UpdateOutcome {
    pub fn applied(self) -> Option<MigrationRecord> {
        match self {
            UpdateOutcome::Applied(record) => Some(record),
            _ => None,
        }
    }
}

/// Durable table of migration records for one shard. All mutations after the
/// initial insert go through [`MigrationStore::compare_and_update`], which
/// runs inside an immediate transaction so concurrent writers serialize.
pub struct MigrationStore {
    conn: Mutex<Connection>,
}

impl MigrationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > MIGRATION_STORE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: MIGRATION_STORE_SCHEMA_VERSION,
            });
        }

        let conn = self.lock()?;
        if current < 1 {
            let sql = include_str!("../migrations/0001_migration_schema.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_artifact_cleanup.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 2", []).map(|_| ())?;
        }

        Ok(())
    }

    /// Inserts a new record. A record with the same uuid is never replaced.
    pub fn insert(&self, record: &MigrationRecord) -> Result<(), StorageError> {
        let row = RecordRow::encode(record)?;
        let conn = self.lock()?;
        let changes = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO schema_migrations ({RECORD_COLUMNS}, row_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, 0)"
            ),
            params![
                record.uuid,
                record.migration_context,
                row.kind,
                row.ddl_action,
                row.statement,
                row.reverted_uuid,
                row.target_tables_json,
                record.strategy.strategy.as_str(),
                record.strategy.allow_concurrent,
                record.strategy.postpone_launch,
                record.strategy.postpone_completion,
                record.strategy.prefer_instant_ddl,
                row.executor_flags_json,
                record.status.as_str(),
                record.ready_to_complete,
                record.complete_requested,
                record.cancel_requested,
                record.cutover_started,
                record.cleanup_requested,
                i64::from(record.retries),
                row.artifacts_json,
                record.executor_handle,
                record.message,
                format_timestamp(record.requested_at),
                record.ready_at.map(format_timestamp),
                record.started_at.map(format_timestamp),
                record.liveness_at.map(format_timestamp),
                record.completed_at.map(format_timestamp),
            ],
        )?;

        if changes == 0 {
            return Err(StorageError::DuplicateKey(record.uuid.clone()));
        }
        Ok(())
    }

    pub fn get(&self, uuid: &str) -> Result<Option<MigrationRecord>, StorageError> {
        let conn = self.lock()?;
        load_record(&conn, uuid)
    }

    /// Records in any of `statuses`, in submission order.
    pub fn scan_by_status(
        &self,
        statuses: &[MigrationStatus],
    ) -> Result<Vec<MigrationRecord>, StorageError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=statuses.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {RECORD_COLUMNS}
             FROM schema_migrations
             WHERE status IN ({placeholders})
             ORDER BY requested_at ASC, rowid ASC"
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(statuses.iter().map(MigrationStatus::as_str)),
            record_from_row,
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Applies `mutator` to the record if it is still in `expected` status.
    ///
    /// The mutator returns `false` to decline the write after inspecting the
    /// current record. The uuid is restored after the mutator runs.
    pub fn compare_and_update<F>(
        &self,
        uuid: &str,
        expected: MigrationStatus,
        mutator: F,
    ) -> Result<UpdateOutcome, StorageError>
    where
        F: FnOnce(&mut MigrationRecord) -> bool,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut record) = load_record(&tx, uuid)? else {
            return Ok(UpdateOutcome::Missing);
        };
        if record.status != expected {
            return Ok(UpdateOutcome::Conflict {
                found: record.status,
            });
        }

        let current = record.clone();
        if !mutator(&mut record) {
            return Ok(UpdateOutcome::Declined(current));
        }
        record.uuid = current.uuid.clone();
        if record == current {
            return Ok(UpdateOutcome::Applied(record));
        }

        let row = RecordRow::encode(&record)?;
        let changes = tx.execute(
            "
            UPDATE schema_migrations SET
                migration_context = ?2,
                kind = ?3,
                ddl_action = ?4,
                statement = ?5,
                reverted_uuid = ?6,
                target_tables_json = ?7,
                strategy = ?8,
                allow_concurrent = ?9,
                postpone_launch = ?10,
                postpone_completion = ?11,
                prefer_instant_ddl = ?12,
                executor_flags_json = ?13,
                status = ?14,
                ready_to_complete = ?15,
                complete_requested = ?16,
                cancel_requested = ?17,
                cutover_started = ?18,
                cleanup_requested = ?19,
                retries = ?20,
                artifacts_json = ?21,
                executor_handle = ?22,
                message = ?23,
                requested_at = ?24,
                ready_at = ?25,
                started_at = ?26,
                liveness_at = ?27,
                completed_at = ?28,
                row_version = row_version + 1
            WHERE uuid = ?1 AND status = ?29
            ",
            params![
                record.uuid,
                record.migration_context,
                row.kind,
                row.ddl_action,
                row.statement,
                row.reverted_uuid,
                row.target_tables_json,
                record.strategy.strategy.as_str(),
                record.strategy.allow_concurrent,
                record.strategy.postpone_launch,
                record.strategy.postpone_completion,
                record.strategy.prefer_instant_ddl,
                row.executor_flags_json,
                record.status.as_str(),
                record.ready_to_complete,
                record.complete_requested,
                record.cancel_requested,
                record.cutover_started,
                record.cleanup_requested,
                i64::from(record.retries),
                row.artifacts_json,
                record.executor_handle,
                record.message,
                format_timestamp(record.requested_at),
                record.ready_at.map(format_timestamp),
                record.started_at.map(format_timestamp),
                record.liveness_at.map(format_timestamp),
                record.completed_at.map(format_timestamp),
                expected.as_str(),
            ],
        )?;

        if changes == 0 {
            return Ok(UpdateOutcome::Conflict {
                found: current.status,
            });
        }
        tx.commit()?;
        Ok(UpdateOutcome::Applied(record))
    }

    /// Terminal records that still own side tables, for cleanup collaborators.
    pub fn artifacts_for_cleanup(&self) -> Result<Vec<(String, Vec<String>)>, StorageError> {
        let terminal = [
            MigrationStatus::Complete,
            MigrationStatus::Failed,
            MigrationStatus::Cancelled,
        ];
        Ok(self
            .scan_by_status(&terminal)?
            .into_iter()
            .filter(|record| !record.artifacts.is_empty())
            .map(|record| (record.uuid, record.artifacts.into_iter().collect()))
            .collect())
    }

    pub fn count_by_status(&self, status: MigrationStatus) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?)
    }

    pub fn row_version(&self, uuid: &str) -> Result<Option<i64>, StorageError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT row_version FROM schema_migrations WHERE uuid = ?1",
                [uuid],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }
}

/// Column values of a record that need encoding before they hit SQLite.
struct RecordRow {
    kind: &'static str,
    ddl_action: Option<&'static str>,
    statement: Option<String>,
    reverted_uuid: Option<String>,
    target_tables_json: String,
    executor_flags_json: String,
    artifacts_json: String,
}

impl RecordRow {
    fn encode(record: &MigrationRecord) -> Result<Self, StorageError> {
        let (kind, ddl_action, statement, reverted_uuid) = match &record.kind {
            MigrationKind::Statement { action, statement } => (
                "statement",
                Some(action.as_str()),
                Some(statement.clone()),
                None,
            ),
            MigrationKind::Revert { reverted_uuid } => {
                ("revert", None, None, Some(reverted_uuid.clone()))
            }
        };

        Ok(Self {
            kind,
            ddl_action,
            statement,
            reverted_uuid,
            target_tables_json: to_json(&record.target_tables)?,
            executor_flags_json: to_json(&record.strategy.executor_flags)?,
            artifacts_json: to_json(&record.artifacts)?,
        })
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn load_record(conn: &Connection, uuid: &str) -> Result<Option<MigrationRecord>, StorageError> {
    let record = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM schema_migrations WHERE uuid = ?1"),
            [uuid],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MigrationRecord> {
    let kind = match row.get::<_, String>(2)?.as_str() {
        "revert" => MigrationKind::Revert {
            reverted_uuid: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        },
        _ => {
            let action: String = row.get(3)?;
            MigrationKind::Statement {
                action: action
                    .parse::<DdlAction>()
                    .map_err(|err| conversion_error(3, err))?,
                statement: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            }
        }
    };

    let strategy: String = row.get(7)?;
    let strategy = StrategyOptions {
        strategy: strategy
            .parse::<DdlStrategy>()
            .map_err(|err| conversion_error(7, err))?,
        allow_concurrent: row.get(8)?,
        postpone_launch: row.get(9)?,
        postpone_completion: row.get(10)?,
        prefer_instant_ddl: row.get(11)?,
        executor_flags: from_json_column(row, 12)?,
    };

    let status: String = row.get(13)?;

    Ok(MigrationRecord {
        uuid: row.get(0)?,
        migration_context: row.get(1)?,
        kind,
        target_tables: from_json_column::<BTreeSet<String>>(row, 6)?,
        strategy,
        status: status
            .parse::<MigrationStatus>()
            .map_err(|err| conversion_error(13, err))?,
        ready_to_complete: row.get(14)?,
        complete_requested: row.get(15)?,
        cancel_requested: row.get(16)?,
        cutover_started: row.get(17)?,
        cleanup_requested: row.get(18)?,
        retries: u32::try_from(row.get::<_, i64>(19)?).unwrap_or(u32::MAX),
        artifacts: from_json_column(row, 20)?,
        executor_handle: row.get(21)?,
        message: row.get(22)?,
        requested_at: timestamp_column(row, 23)?,
        ready_at: optional_timestamp_column(row, 24)?,
        started_at: optional_timestamp_column(row, 25)?,
        liveness_at: optional_timestamp_column(row, 26)?,
        completed_at: optional_timestamp_column(row, 27)?,
    })
}

fn conversion_error<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn from_json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|err| conversion_error(index, err))
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_timestamp(raw).map_err(|err| conversion_error(index, err))
}

fn optional_timestamp_column(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(index)?
        .map(|raw| parse_timestamp(raw).map_err(|err| conversion_error(index, err)))
        .transpose()
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::NamedTempFile;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::seconds(offset_secs)
    }

    fn sample_record(uuid: &str, table: &str, requested_at: DateTime<Utc>) -> MigrationRecord {
        MigrationRecord::queued(
            uuid,
            "ctx-1",
            MigrationKind::Statement {
                action: DdlAction::Alter,
                statement: format!("alter table {table} engine=innodb"),
            },
            [table.to_string()].into_iter().collect(),
            StrategyOptions::parse("vitess --allow-concurrent --allow-zero-in-date")
                .expect("strategy"),
            requested_at,
        )
    }

    #[test]
    fn migration_creates_schema_migrations_table() {
        let store = MigrationStore::open_in_memory().expect("open store");
        assert!(store.table_exists("schema_migrations").expect("table check"));
        assert_eq!(
            store.schema_version().expect("schema version"),
            MIGRATION_STORE_SCHEMA_VERSION
        );
    }

    #[test]
    fn insert_get_roundtrip_preserves_record() {
        let store = MigrationStore::open_in_memory().expect("open store");
        let mut record = sample_record("u1", "t1", ts(0));
        record.add_artifacts(["_vt_hld_u1"]);
        record.message = Some("note".to_string());

        store.insert(&record).expect("insert");
        let loaded = store.get("u1").expect("get").expect("present");
        assert_eq!(loaded, record);
        assert!(store.get("missing").expect("get").is_none());
    }

    #[test]
    fn timestamps_keep_nanosecond_precision() {
        let store = MigrationStore::open_in_memory().expect("open store");
        let requested_at = Utc
            .timestamp_opt(1_760_000_000, 123_456_789)
            .single()
            .expect("valid timestamp");
        let record = sample_record("u1", "t1", requested_at);
        store.insert(&record).expect("insert");

        let loaded = store.get("u1").expect("get").expect("present");
        assert_eq!(loaded.requested_at, requested_at);
        assert_eq!(loaded, record);
    }

    #[test]
    fn revert_records_roundtrip() {
        let store = MigrationStore::open_in_memory().expect("open store");
        let record = MigrationRecord::queued(
            "rev-1",
            "ctx-1",
            MigrationKind::Revert {
                reverted_uuid: "u1".to_string(),
            },
            ["t1".to_string()].into_iter().collect(),
            StrategyOptions::default(),
            ts(0),
        );
        store.insert(&record).expect("insert");
        assert_eq!(store.get("rev-1").expect("get"), Some(record));
    }

    #[test]
    fn duplicate_insert_is_rejected_without_overwrite() {
        let store = MigrationStore::open_in_memory().expect("open store");
        let record = sample_record("u1", "t1", ts(0));
        store.insert(&record).expect("insert");

        let mut other = sample_record("u1", "t2", ts(5));
        other.migration_context = "ctx-2".to_string();
        let err = store.insert(&other).expect_err("duplicate");
        assert!(matches!(err, StorageError::DuplicateKey(uuid) if uuid == "u1"));

        let loaded = store.get("u1").expect("get").expect("present");
        assert_eq!(loaded.migration_context, "ctx-1");
    }

    #[test]
    fn scan_by_status_orders_by_submission() {
        let store = MigrationStore::open_in_memory().expect("open store");
        store.insert(&sample_record("late", "t1", ts(10))).expect("late");
        store.insert(&sample_record("early", "t2", ts(1))).expect("early");
        let mut done = sample_record("done", "t3", ts(0));
        done.status = MigrationStatus::Complete;
        store.insert(&done).expect("done");

        let queued = store
            .scan_by_status(&[MigrationStatus::Queued])
            .expect("scan");
        let uuids = queued.iter().map(|r| r.uuid.as_str()).collect::<Vec<_>>();
        assert_eq!(uuids, vec!["early", "late"]);

        assert!(store.scan_by_status(&[]).expect("empty scan").is_empty());
        assert_eq!(
            store
                .scan_by_status(&MigrationStatus::ALL)
                .expect("all")
                .len(),
            3
        );
        assert_eq!(
            store
                .count_by_status(MigrationStatus::Complete)
                .expect("count"),
            1
        );
    }

    #[test]
    fn compare_and_update_applies_on_expected_status() {
        let store = MigrationStore::open_in_memory().expect("open store");
        store.insert(&sample_record("u1", "t1", ts(0))).expect("insert");

        let outcome = store
            .compare_and_update("u1", MigrationStatus::Queued, |record| {
                record.uuid = "hijacked".to_string();
                record
                    .transition(MigrationStatus::Ready, ts(1))
                    .is_ok()
            })
            .expect("cas");
        let updated = outcome.applied().expect("applied");
        assert_eq!(updated.uuid, "u1");
        assert_eq!(updated.status, MigrationStatus::Ready);
        assert_eq!(store.row_version("u1").expect("version"), Some(1));

        let stored = store.get("u1").expect("get").expect("present");
        assert_eq!(stored.status, MigrationStatus::Ready);
        assert_eq!(stored.ready_at, Some(ts(1)));
        assert!(store.get("hijacked").expect("get").is_none());
    }

    #[test]
    fn compare_and_update_reports_conflict_missing_and_declined() {
        let store = MigrationStore::open_in_memory().expect("open store");
        store.insert(&sample_record("u1", "t1", ts(0))).expect("insert");

        let conflict = store
            .compare_and_update("u1", MigrationStatus::Running, |_| true)
            .expect("cas");
        assert_eq!(
            conflict,
            UpdateOutcome::Conflict {
                found: MigrationStatus::Queued
            }
        );

        let missing = store
            .compare_and_update("nope", MigrationStatus::Queued, |_| true)
            .expect("cas");
        assert_eq!(missing, UpdateOutcome::Missing);

        let declined = store
            .compare_and_update("u1", MigrationStatus::Queued, |record| {
                record.retries = 99;
                false
            })
            .expect("cas");
        assert!(matches!(declined, UpdateOutcome::Declined(ref r) if r.retries == 0));
        assert_eq!(store.get("u1").expect("get").expect("present").retries, 0);
        assert_eq!(store.row_version("u1").expect("version"), Some(0));
    }

    #[test]
    fn concurrent_updates_on_one_file_apply_exactly_once() {
        let file = NamedTempFile::new().expect("temp db");
        let seed = MigrationStore::open(file.path()).expect("open store");
        seed.insert(&sample_record("u1", "t1", ts(0))).expect("insert");

        let stores = (0..4)
            .map(|_| MigrationStore::open(file.path()).expect("open store"))
            .collect::<Vec<_>>();
        let barrier = std::sync::Barrier::new(stores.len());
        let outcomes = std::thread::scope(|scope| {
            let workers = stores
                .iter()
                .enumerate()
                .map(|(index, store)| {
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        store
                            .compare_and_update("u1", MigrationStatus::Queued, |record| {
                                record.message = Some(format!("worker {index}"));
                                record
                                    .transition(MigrationStatus::Ready, ts(1))
                                    .is_ok()
                            })
                            .expect("cas")
                    })
                })
                .collect::<Vec<_>>();
            workers
                .into_iter()
                .map(|worker| worker.join().expect("worker"))
                .collect::<Vec<_>>()
        });

        let applied = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                UpdateOutcome::Applied(record) => Some(record.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(applied.len(), 1);
        assert!(outcomes.iter().all(|outcome| matches!(
            outcome,
            UpdateOutcome::Applied(_)
                | UpdateOutcome::Conflict {
                    found: MigrationStatus::Ready
                }
        )));

        let stored = seed.get("u1").expect("get").expect("present");
        assert_eq!(stored, applied[0]);
        assert_eq!(seed.row_version("u1").expect("version"), Some(1));
    }

    #[test]
    fn artifacts_for_cleanup_lists_terminal_records_only() {
        let store = MigrationStore::open_in_memory().expect("open store");

        let mut failed = sample_record("failed", "t1", ts(0));
        failed.status = MigrationStatus::Failed;
        failed.add_artifacts(["_vt_vrp_failed", "_vt_hld_failed"]);
        store.insert(&failed).expect("failed");

        let mut running = sample_record("running", "t2", ts(1));
        running.status = MigrationStatus::Running;
        running.add_artifacts(["_vt_vrp_running"]);
        store.insert(&running).expect("running");

        let mut clean = sample_record("clean", "t3", ts(2));
        clean.status = MigrationStatus::Complete;
        store.insert(&clean).expect("clean");

        let cleanup = store.artifacts_for_cleanup().expect("cleanup");
        assert_eq!(
            cleanup,
            vec![(
                "failed".to_string(),
                vec!["_vt_hld_failed".to_string(), "_vt_vrp_failed".to_string()]
            )]
        );
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let store = MigrationStore::open(file.path()).expect("open store");
            store.insert(&sample_record("u1", "t1", ts(0))).expect("insert");
            store
                .compare_and_update("u1", MigrationStatus::Queued, |record| {
                    record.transition(MigrationStatus::Ready, ts(1)).is_ok()
                })
                .expect("cas");
        }

        let reopened = MigrationStore::open(file.path()).expect("reopen");
        let record = reopened.get("u1").expect("get").expect("present");
        assert_eq!(record.status, MigrationStatus::Ready);
        assert_eq!(
            reopened.schema_version().expect("version"),
            MIGRATION_STORE_SCHEMA_VERSION
        );
    }
}
