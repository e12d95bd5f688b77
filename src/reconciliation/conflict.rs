//! Conflict classification, resolution policy and reporting.

use crate::snapshot::SnapshotItem;
use crate::types::{ReplicaSide, SyncPath};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Which side wins when both changed the same item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The most recently modified side wins; ties go to the remote
    #[default]
    KeepMostRecent,
    KeepLocal,
    KeepRemote,
}

impl ConflictPolicy {
    pub fn winner(self, local: &SnapshotItem, remote: &SnapshotItem) -> ReplicaSide {
        match self {
            ConflictPolicy::KeepLocal => ReplicaSide::Local,
            ConflictPolicy::KeepRemote => ReplicaSide::Remote,
            ConflictPolicy::KeepMostRecent => {
                if local.last_modified > remote.last_modified {
                    ReplicaSide::Local
                } else {
                    ReplicaSide::Remote
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    EditEdit,
    /// One side edited, the other deleted
    EditDelete,
    CreateCreate,
    MoveMove,
    /// One side moved, the other deleted
    MoveDelete,
    /// One side deleted a directory the other changed something inside
    ParentDelete,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictKind::EditEdit => "edit-edit",
            ConflictKind::EditDelete => "edit-delete",
            ConflictKind::CreateCreate => "create-create",
            ConflictKind::MoveMove => "move-move",
            ConflictKind::MoveDelete => "move-delete",
            ConflictKind::ParentDelete => "delete-parent/change-inside",
        };
        f.write_str(name)
    }
}

/// How a conflict was settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Both sides already agree; only the database is refreshed
    AlreadyInSync,
    /// Directories created on both sides were paired
    Merged,
    /// The winner's version is propagated; the loser is kept under `renamed_to`
    KeptBoth { renamed_to: String },
    /// The winner's move is applied on the other side
    WinnerMoveApplied,
    /// The delete is cancelled and the surviving version recreated
    Recreated,
}

/// One resolved conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub kind: ConflictKind,
    pub path: SyncPath,
    /// Side whose version prevailed
    pub winner: ReplicaSide,
    pub resolution: Resolution,
}

/// Receives every conflict resolution
pub trait ConflictSink: Send + Sync {
    fn report(&self, conflict: &ConflictReport);
}

/// Reports conflicts through `tracing`
#[derive(Debug, Default)]
pub struct LogConflictSink;

impl ConflictSink for LogConflictSink {
    fn report(&self, conflict: &ConflictReport) {
        warn!(
            kind = %conflict.kind,
            path = %conflict.path.display(),
            winner = %conflict.winner,
            resolution = ?conflict.resolution,
            "Conflict resolved"
        );
    }
}

/// Keeps reports in memory, for status queries and the CLI summary
#[derive(Debug, Default)]
pub struct RecordingConflictSink {
    reports: Mutex<Vec<ConflictReport>>,
}

impl RecordingConflictSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ConflictReport> {
        self.reports.lock().clone()
    }

    pub fn take(&self) -> Vec<ConflictReport> {
        std::mem::take(&mut *self.reports.lock())
    }
}

impl ConflictSink for RecordingConflictSink {
    fn report(&self, conflict: &ConflictReport) {
        LogConflictSink.report(conflict);
        self.reports.lock().push(conflict.clone());
    }
}

/// `name (conflict YYYYMMDD-HHMMSS).ext`; dot-files and extensionless names get the suffix at the end
pub fn conflict_name(name: &str, at: DateTime<Utc>) -> String {
    let suffix = format!(" (conflict {})", at.format("%Y%m%d-%H%M%S"));
    match name.rfind('.') {
        Some(index) if index > 0 => format!("{}{}{}", &name[..index], suffix, &name[index..]),
        _ => format!("{}{}", name, suffix),
    }
}
