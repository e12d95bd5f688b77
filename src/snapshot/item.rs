//! Snapshot item: one file or directory of a replica.

use crate::types::{NodeId, NodeType, SyncTime};
use serde::{Deserialize, Serialize};

/// SnapshotItem: metadata of a single node, identified by `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    /// Size in bytes, never negative
    pub size: i64,
    pub created_at: SyncTime,
    pub last_modified: SyncTime,
    pub can_write: bool,
    pub is_link: bool,
}

impl SnapshotItem {
    pub fn new(
        id: impl Into<NodeId>,
        parent_id: impl Into<NodeId>,
        name: impl Into<String>,
        node_type: NodeType,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.into(),
            name: name.into(),
            node_type,
            size: 0,
            created_at: 0,
            last_modified: 0,
            can_write: true,
            is_link: false,
        }
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    pub fn with_times(mut self, created_at: SyncTime, last_modified: SyncTime) -> Self {
        self.created_at = created_at;
        self.last_modified = last_modified;
        self
    }

    pub fn with_can_write(mut self, can_write: bool) -> Self {
        self.can_write = can_write;
        self
    }

    pub fn is_dir(&self) -> bool {
        self.node_type.is_dir()
    }

    /// Whether the content of this file differs from `other` (size or modification time)
    pub fn content_differs(&self, other: &SnapshotItem) -> bool {
        !self.is_dir() && (self.size != other.size || self.last_modified != other.last_modified)
    }
}
