//! Core types shared by the observation, reconciliation and propagation layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// NodeId: stable item identifier within one replica (inode on disk, file id on the drive)
pub type NodeId = String;

/// SyncPath: path of an item relative to the sync root
pub type SyncPath = PathBuf;

/// Seconds since the Unix epoch; negative values are pre-1970 dates
pub type SyncTime = i64;

/// Node type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    File,
    Directory,
}

impl NodeType {
    pub fn is_dir(self) -> bool {
        matches!(self, NodeType::Directory)
    }
}

/// Which replica an item, change or operation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReplicaSide {
    Local,
    Remote,
}

impl ReplicaSide {
    /// The opposite replica
    pub fn other(self) -> Self {
        match self {
            ReplicaSide::Local => ReplicaSide::Remote,
            ReplicaSide::Remote => ReplicaSide::Local,
        }
    }
}

impl fmt::Display for ReplicaSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaSide::Local => write!(f, "local"),
            ReplicaSide::Remote => write!(f, "remote"),
        }
    }
}

/// Normalized change kind, shared by watcher events and pending operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationType {
    None,
    Create,
    Edit,
    Delete,
    Move,
    Rights,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::None => "none",
            OperationType::Create => "create",
            OperationType::Edit => "edit",
            OperationType::Delete => "delete",
            OperationType::Move => "move",
            OperationType::Rights => "rights",
        };
        f.write_str(name)
    }
}
