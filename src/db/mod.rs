//! Sync database
//!
//! Last known-common state of every synchronized item: the local id ↔ remote
//! id pairing and what each side looked like at the last successful sync.
//! Reconciliation diffs each snapshot against this state.

mod sled_store;

pub use sled_store::SledSyncDb;

use crate::error::StorageError;
use crate::snapshot::SnapshotItem;
use crate::types::{NodeId, NodeType, ReplicaSide, SyncPath, SyncTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// Database id of the root pairing
pub const ROOT_DB_ID: u64 = 1;

/// DbNode: one synchronized pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbNode {
    pub db_id: u64,
    pub parent_db_id: u64,
    pub local_id: Option<NodeId>,
    pub remote_id: Option<NodeId>,
    pub local_name: String,
    pub remote_name: String,
    pub node_type: NodeType,
    pub size: i64,
    pub created_at: SyncTime,
    pub last_modified_local: SyncTime,
    pub last_modified_remote: SyncTime,
    pub can_write: bool,
    /// blake3 of the local content at last sync, hex encoded
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl DbNode {
    /// Pair built from the two sides of an item; `db_id` 0 asks the store to assign one
    pub fn from_items(parent_db_id: u64, local: &SnapshotItem, remote: &SnapshotItem) -> Self {
        Self {
            db_id: 0,
            parent_db_id,
            local_id: Some(local.id.clone()),
            remote_id: Some(remote.id.clone()),
            local_name: local.name.clone(),
            remote_name: remote.name.clone(),
            node_type: remote.node_type,
            size: remote.size,
            created_at: remote.created_at,
            last_modified_local: local.last_modified,
            last_modified_remote: remote.last_modified,
            can_write: remote.can_write,
            content_hash: None,
        }
    }

    pub fn id(&self, side: ReplicaSide) -> Option<&NodeId> {
        match side {
            ReplicaSide::Local => self.local_id.as_ref(),
            ReplicaSide::Remote => self.remote_id.as_ref(),
        }
    }

    pub fn name(&self, side: ReplicaSide) -> &str {
        match side {
            ReplicaSide::Local => &self.local_name,
            ReplicaSide::Remote => &self.remote_name,
        }
    }

    pub fn last_modified(&self, side: ReplicaSide) -> SyncTime {
        match side {
            ReplicaSide::Local => self.last_modified_local,
            ReplicaSide::Remote => self.last_modified_remote,
        }
    }

    pub fn set_name(&mut self, side: ReplicaSide, name: &str) {
        match side {
            ReplicaSide::Local => self.local_name = name.to_string(),
            ReplicaSide::Remote => self.remote_name = name.to_string(),
        }
    }

    pub fn set_last_modified(&mut self, side: ReplicaSide, value: SyncTime) {
        match side {
            ReplicaSide::Local => self.last_modified_local = value,
            ReplicaSide::Remote => self.last_modified_remote = value,
        }
    }

    pub fn set_id(&mut self, side: ReplicaSide, id: NodeId) {
        match side {
            ReplicaSide::Local => self.local_id = Some(id),
            ReplicaSide::Remote => self.remote_id = Some(id),
        }
    }

    /// Drop one side of the pairing, leaving the other side to be recreated
    pub fn clear_id(&mut self, side: ReplicaSide) {
        match side {
            ReplicaSide::Local => self.local_id = None,
            ReplicaSide::Remote => self.remote_id = None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.node_type.is_dir()
    }
}

/// blake3 of a file's content, hex encoded
pub fn content_hash(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

/// Sync database interface
pub trait SyncDbStore: Send + Sync {
    fn get(&self, db_id: u64) -> Result<Option<DbNode>, StorageError>;

    fn get_by_id(&self, side: ReplicaSide, id: &str) -> Result<Option<DbNode>, StorageError>;

    fn children(&self, db_id: u64) -> Result<Vec<DbNode>, StorageError>;

    /// Insert a pair, assigning a db id when `db_id` is 0. Returns the db id.
    fn insert(&self, node: DbNode) -> Result<u64, StorageError>;

    /// Replace an existing pair, keeping indexes in step
    fn update(&self, node: &DbNode) -> Result<(), StorageError>;

    /// Remove a pair and everything below it
    fn remove_subtree(&self, db_id: u64) -> Result<Vec<DbNode>, StorageError>;

    fn all(&self) -> Result<Vec<DbNode>, StorageError>;

    fn cursor(&self) -> Result<Option<String>, StorageError>;

    fn set_cursor(&self, cursor: &str) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError>;

    /// Root-relative path of a pair using one side's names
    fn path(&self, db_id: u64, side: ReplicaSide) -> Result<SyncPath, StorageError> {
        let mut names = Vec::new();
        let mut current = db_id;
        let mut hops = 0usize;
        while current != ROOT_DB_ID {
            let node = self.get(current)?.ok_or(StorageError::NodeNotFound(current))?;
            names.push(node.name(side).to_string());
            current = node.parent_db_id;
            hops += 1;
            if hops > 4096 {
                return Err(StorageError::Inconsistent(format!(
                    "parent chain of {} does not reach the root",
                    db_id
                )));
            }
        }
        Ok(names.iter().rev().collect())
    }
}

/// In-memory view of the database for one reconciliation cycle
#[derive(Debug, Default, Clone)]
pub struct DbIndex {
    nodes: HashMap<u64, DbNode>,
    local: HashMap<NodeId, u64>,
    remote: HashMap<NodeId, u64>,
    children: HashMap<u64, Vec<u64>>,
}

impl DbIndex {
    pub fn load(store: &dyn SyncDbStore) -> Result<Self, StorageError> {
        Ok(Self::from_nodes(store.all()?))
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = DbNode>) -> Self {
        let mut index = DbIndex::default();
        for node in nodes {
            if let Some(id) = &node.local_id {
                index.local.insert(id.clone(), node.db_id);
            }
            if let Some(id) = &node.remote_id {
                index.remote.insert(id.clone(), node.db_id);
            }
            if node.db_id != ROOT_DB_ID {
                index.children.entry(node.parent_db_id).or_default().push(node.db_id);
            }
            index.nodes.insert(node.db_id, node);
        }
        for children in index.children.values_mut() {
            children.sort_unstable();
        }
        index
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, db_id: u64) -> Option<&DbNode> {
        self.nodes.get(&db_id)
    }

    pub fn by_id(&self, side: ReplicaSide, id: &str) -> Option<&DbNode> {
        let db_id = match side {
            ReplicaSide::Local => self.local.get(id),
            ReplicaSide::Remote => self.remote.get(id),
        }?;
        self.nodes.get(db_id)
    }

    pub fn children(&self, db_id: u64) -> impl Iterator<Item = &DbNode> {
        self.children
            .get(&db_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.nodes.get(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DbNode> {
        self.nodes.values()
    }

    /// Pair ids of `db_id` and everything below it
    pub fn subtree(&self, db_id: u64) -> Vec<u64> {
        let mut collected = Vec::new();
        let mut stack = vec![db_id];
        while let Some(current) = stack.pop() {
            if let Some(children) = self.children.get(&current) {
                stack.extend(children.iter().copied());
            }
            collected.push(current);
        }
        collected
    }

    /// Root-relative path of a pair using one side's names
    pub fn path(&self, db_id: u64, side: ReplicaSide) -> SyncPath {
        let mut names = Vec::new();
        let mut current = db_id;
        for _ in 0..self.nodes.len() {
            if current == ROOT_DB_ID {
                break;
            }
            match self.nodes.get(&current) {
                Some(node) => {
                    names.push(node.name(side));
                    current = node.parent_db_id;
                }
                None => break,
            }
        }
        names.iter().rev().collect()
    }

    /// Whether `ancestor` is `db_id` or one of its ancestors
    pub fn is_ancestor_or_self(&self, ancestor: u64, db_id: u64) -> bool {
        let mut current = db_id;
        for _ in 0..=self.nodes.len() {
            if current == ancestor {
                return true;
            }
            if current == ROOT_DB_ID {
                return false;
            }
            match self.nodes.get(&current) {
                Some(node) => current = node.parent_db_id,
                None => return false,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(db_id: u64, parent: u64, name: &str) -> DbNode {
        DbNode {
            db_id,
            parent_db_id: parent,
            local_id: Some(format!("l{}", db_id)),
            remote_id: Some(format!("r{}", db_id)),
            local_name: name.to_string(),
            remote_name: name.to_string(),
            node_type: NodeType::Directory,
            size: 0,
            created_at: 0,
            last_modified_local: 0,
            last_modified_remote: 0,
            can_write: true,
            content_hash: None,
        }
    }

    #[test]
    fn test_index_lookups_and_subtree() {
        let index = DbIndex::from_nodes(vec![
            node(ROOT_DB_ID, ROOT_DB_ID, ""),
            node(2, ROOT_DB_ID, "a"),
            node(3, 2, "b"),
            node(4, ROOT_DB_ID, "c"),
        ]);
        assert_eq!(index.by_id(ReplicaSide::Remote, "r3").unwrap().db_id, 3);
        assert_eq!(index.by_id(ReplicaSide::Local, "l4").unwrap().local_name, "c");
        let mut subtree = index.subtree(2);
        subtree.sort_unstable();
        assert_eq!(subtree, vec![2, 3]);
        assert!(index.is_ancestor_or_self(2, 3));
        assert!(!index.is_ancestor_or_self(4, 3));
        assert_eq!(index.children(ROOT_DB_ID).count(), 2);
        assert_eq!(index.path(3, ReplicaSide::Local), SyncPath::from("a/b"));
    }

    #[test]
    fn test_content_hash_matches_blake3() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(content_hash(&path).unwrap(), blake3::hash(b"hello").to_hex().to_string());
    }
}
