//! Per-tick admission decisions. These are pure functions over one record and
//! the current [`ConflictTracker`]; the scheduler applies them through the
//! store and feeds each promotion back into the tracker.

use crate::conflict::ConflictTracker;
use osm_core::MigrationRecord;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedVerdict {
    Promote,
    /// Submitted with `postpone_launch` and not launched yet.
    AwaitLaunch,
    /// Immediate operation with postponed completion and no Complete intent.
    AwaitComplete,
    Blocked { holders: BTreeSet<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyVerdict {
    Start,
    AwaitExclusiveSlot { holder: String },
}

/// Queued -> Ready. `instant_capable` is the executor's answer for ALTERs
/// that prefer instant DDL.
pub fn evaluate_queued(
    record: &MigrationRecord,
    tracker: &ConflictTracker,
    instant_capable: bool,
) -> QueuedVerdict {
    if record.postpone_launch() {
        return QueuedVerdict::AwaitLaunch;
    }
    if record.is_immediate(instant_capable) && !record.completion_permitted() {
        return QueuedVerdict::AwaitComplete;
    }

    let holders = tracker.conflicts(&record.target_tables);
    if holders.is_empty() {
        QueuedVerdict::Promote
    } else {
        QueuedVerdict::Blocked { holders }
    }
}

/// Ready -> Running. Table conflicts were settled on the way into Ready, so
/// only the exclusive slot matters here.
pub fn evaluate_ready(record: &MigrationRecord, tracker: &ConflictTracker) -> ReadyVerdict {
    if record.allow_concurrent() {
        return ReadyVerdict::Start;
    }
    match tracker.exclusive_holder() {
        Some(holder) if holder != record.uuid => ReadyVerdict::AwaitExclusiveSlot {
            holder: holder.to_string(),
        },
        _ => ReadyVerdict::Start,
    }
}
