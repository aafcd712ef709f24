use osm_core::{MigrationRecord, MigrationStatus};
use std::collections::{BTreeMap, BTreeSet};

/// Projection of the tables held by Ready and Running migrations, plus the
/// owner of the exclusive slot. Rebuilt from the store every tick and
/// extended as the tick promotes records.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConflictTracker {
    tables: BTreeMap<String, BTreeSet<String>>,
    exclusive: BTreeSet<String>,
}

impl ConflictTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a MigrationRecord>) -> Self {
        let mut tracker = Self::new();
        for record in records {
            tracker.hold(record);
        }
        tracker
    }

    /// Registers a record if its status holds tables. Running records without
    /// `allow_concurrent` also take the exclusive slot.
    pub fn hold(&mut self, record: &MigrationRecord) {
        if !record.status.holds_tables() {
            return;
        }
        for table in &record.target_tables {
            self.tables
                .entry(table.clone())
                .or_default()
                .insert(record.uuid.clone());
        }
        if record.status == MigrationStatus::Running && !record.allow_concurrent() {
            self.exclusive.insert(record.uuid.clone());
        }
    }

    /// Holders of any of `tables`. Empty means the candidate may be admitted.
    pub fn conflicts(&self, tables: &BTreeSet<String>) -> BTreeSet<String> {
        tables
            .iter()
            .filter_map(|table| self.tables.get(table))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn exclusive_holder(&self) -> Option<&str> {
        self.exclusive.iter().next().map(String::as_str)
    }
}
