//! Status queries
//!
//! Answers "is this path synchronized?" for shell integrations and the CLI,
//! from the live local snapshot, the sync database and the VFS status layer.

use crate::db::SyncDbStore;
use crate::propagation::Vfs;
use crate::reconciliation::UnsyncableItem;
use crate::snapshot::SharedSnapshot;
use crate::types::{ReplicaSide, SyncPath};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Synchronization state of one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    UpToDate,
    Syncing { progress: u8 },
    Unsyncable { reason: String },
    Unknown,
}

/// Unsyncable items of the last cycle, by local-side path
#[derive(Debug, Clone, Default)]
pub struct UnsyncableRegistry {
    inner: Arc<RwLock<HashMap<SyncPath, String>>>,
}

impl UnsyncableRegistry {
    pub fn replace(&self, items: &[UnsyncableItem]) {
        let mut map = self.inner.write();
        map.clear();
        for item in items {
            map.insert(item.path.clone(), item.reason.to_string());
        }
    }

    pub fn reason(&self, path: &Path) -> Option<String> {
        self.inner.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// StatusService: read-only view over a running engine
#[derive(Clone)]
pub struct StatusService {
    root: PathBuf,
    local: SharedSnapshot,
    db: Arc<dyn SyncDbStore>,
    vfs: Arc<dyn Vfs>,
    unsyncable: UnsyncableRegistry,
}

impl StatusService {
    pub fn new(
        root: PathBuf,
        local: SharedSnapshot,
        db: Arc<dyn SyncDbStore>,
        vfs: Arc<dyn Vfs>,
        unsyncable: UnsyncableRegistry,
    ) -> Self {
        Self {
            root,
            local,
            db,
            vfs,
            unsyncable,
        }
    }

    /// Root-relative form of an absolute or relative path; None outside the root
    fn relative(&self, path: &Path) -> Option<SyncPath> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root).ok()?.to_path_buf()
        } else {
            path.to_path_buf()
        };
        if relative.components().any(|c| matches!(c, Component::ParentDir | Component::Prefix(_))) {
            return None;
        }
        Some(relative)
    }

    /// Whether `path` lies inside the sync root and is tracked
    pub fn is_watched(&self, path: &Path) -> bool {
        match self.relative(path) {
            Some(relative) => self.local.read().id_from_path(&relative).is_some(),
            None => false,
        }
    }

    pub fn sync_status(&self, path: &Path) -> SyncStatus {
        let relative = match self.relative(path) {
            Some(relative) => relative,
            None => return SyncStatus::Unknown,
        };

        let vfs = self.vfs.status(&relative);
        if vfs.is_syncing {
            return SyncStatus::Syncing {
                progress: vfs.progress,
            };
        }
        if let Some(reason) = self.unsyncable.reason(&relative) {
            return SyncStatus::Unsyncable { reason };
        }

        let snapshot = self.local.read();
        if !snapshot.is_valid() {
            return SyncStatus::Unknown;
        }
        let id = match snapshot.id_from_path(&relative) {
            Some(id) => id,
            None => return SyncStatus::Unknown,
        };
        if &id == snapshot.root_id() {
            return SyncStatus::UpToDate;
        }
        let item = match snapshot.get(&id) {
            Some(item) => item,
            None => return SyncStatus::Unknown,
        };

        match self.db.get_by_id(ReplicaSide::Local, &id) {
            Ok(Some(node)) if node.remote_id.is_some() => {
                let same = item.is_dir() || (item.last_modified == node.last_modified_local && item.size == node.size);
                if same {
                    SyncStatus::UpToDate
                } else {
                    SyncStatus::Syncing { progress: 0 }
                }
            }
            // Not propagated yet
            Ok(_) => SyncStatus::Syncing { progress: 0 },
            Err(e) => {
                debug!(path = %relative.display(), error = %e, "Status lookup failed");
                SyncStatus::Unknown
            }
        }
    }
}
