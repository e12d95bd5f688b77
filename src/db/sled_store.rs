//! sled-backed sync database
//!
//! Trees: `nodes` (db id → bincode DbNode), `local_index` / `remote_index`
//! (side id → db id), `children` (parent db id ‖ child db id → ()) and `meta`.

use super::{DbNode, SyncDbStore, ROOT_DB_ID};
use crate::error::StorageError;
use crate::types::{NodeType, ReplicaSide};
use std::path::Path;
use tracing::{debug, info};

const CURSOR_KEY: &[u8] = b"listing_cursor";

/// SledSyncDb: persistent [`SyncDbStore`]
pub struct SledSyncDb {
    db: sled::Db,
    nodes: sled::Tree,
    local_index: sled::Tree,
    remote_index: sled::Tree,
    children: sled::Tree,
    meta: sled::Tree,
}

impl SledSyncDb {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        debug!(path = %path.display(), "Opened sync database");
        Self::from_db(db)
    }

    /// Throwaway database, removed on drop
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            nodes: db.open_tree("nodes")?,
            local_index: db.open_tree("local_index")?,
            remote_index: db.open_tree("remote_index")?,
            children: db.open_tree("children")?,
            meta: db.open_tree("meta")?,
            db,
        })
    }

    /// Create the root pairing if missing, or re-pair it when a root id changed
    pub fn ensure_root(&self, local_root_id: &str, remote_root_id: &str) -> Result<DbNode, StorageError> {
        if let Some(mut root) = self.get(ROOT_DB_ID)? {
            if root.local_id.as_deref() != Some(local_root_id)
                || root.remote_id.as_deref() != Some(remote_root_id)
            {
                info!(local_root_id, remote_root_id, "Sync root ids changed, re-pairing root");
                root.local_id = Some(local_root_id.to_string());
                root.remote_id = Some(remote_root_id.to_string());
                self.update(&root)?;
            }
            return Ok(root);
        }

        let root = DbNode {
            db_id: ROOT_DB_ID,
            parent_db_id: ROOT_DB_ID,
            local_id: Some(local_root_id.to_string()),
            remote_id: Some(remote_root_id.to_string()),
            local_name: String::new(),
            remote_name: String::new(),
            node_type: NodeType::Directory,
            size: 0,
            created_at: 0,
            last_modified_local: 0,
            last_modified_remote: 0,
            can_write: true,
            content_hash: None,
        };
        self.write_node(&root, None)?;
        info!("Initialized sync database root");
        Ok(root)
    }

    fn side_index(&self, side: ReplicaSide) -> &sled::Tree {
        match side {
            ReplicaSide::Local => &self.local_index,
            ReplicaSide::Remote => &self.remote_index,
        }
    }

    fn child_key(parent: u64, child: u64) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&parent.to_be_bytes());
        key[8..].copy_from_slice(&child.to_be_bytes());
        key
    }

    fn decode_db_id(bytes: &[u8]) -> Result<u64, StorageError> {
        let array: [u8; 8] = bytes
            .try_into()
            .map_err(|_| StorageError::Inconsistent("malformed db id".to_string()))?;
        Ok(u64::from_be_bytes(array))
    }

    /// Write a node and refresh the indexes touched since `previous`
    fn write_node(&self, node: &DbNode, previous: Option<&DbNode>) -> Result<(), StorageError> {
        let key = node.db_id.to_be_bytes();
        if let Some(previous) = previous {
            for side in [ReplicaSide::Local, ReplicaSide::Remote] {
                if let Some(old_id) = previous.id(side) {
                    if previous.id(side) != node.id(side) {
                        self.side_index(side).remove(old_id.as_bytes())?;
                    }
                }
            }
            if previous.parent_db_id != node.parent_db_id {
                self.children
                    .remove(Self::child_key(previous.parent_db_id, node.db_id))?;
            }
        }

        self.nodes.insert(key, bincode::serialize(node)?)?;
        for side in [ReplicaSide::Local, ReplicaSide::Remote] {
            if let Some(id) = node.id(side) {
                self.side_index(side).insert(id.as_bytes(), &key[..])?;
            }
        }
        if node.db_id != ROOT_DB_ID {
            self.children
                .insert(Self::child_key(node.parent_db_id, node.db_id), Vec::<u8>::new())?;
        }
        Ok(())
    }

    fn erase_node(&self, node: &DbNode) -> Result<(), StorageError> {
        self.nodes.remove(node.db_id.to_be_bytes())?;
        for side in [ReplicaSide::Local, ReplicaSide::Remote] {
            if let Some(id) = node.id(side) {
                // Only drop the index entry if it still points at this pair
                let index = self.side_index(side);
                if let Some(current) = index.get(id.as_bytes())? {
                    if Self::decode_db_id(&current)? == node.db_id {
                        index.remove(id.as_bytes())?;
                    }
                }
            }
        }
        self.children
            .remove(Self::child_key(node.parent_db_id, node.db_id))?;
        Ok(())
    }
}

impl SyncDbStore for SledSyncDb {
    fn get(&self, db_id: u64) -> Result<Option<DbNode>, StorageError> {
        match self.nodes.get(db_id.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_by_id(&self, side: ReplicaSide, id: &str) -> Result<Option<DbNode>, StorageError> {
        match self.side_index(side).get(id.as_bytes())? {
            Some(bytes) => self.get(Self::decode_db_id(&bytes)?),
            None => Ok(None),
        }
    }

    fn children(&self, db_id: u64) -> Result<Vec<DbNode>, StorageError> {
        let mut children = Vec::new();
        for entry in self.children.scan_prefix(db_id.to_be_bytes()) {
            let (key, _) = entry?;
            let child_id = Self::decode_db_id(&key[8..])?;
            if let Some(child) = self.get(child_id)? {
                children.push(child);
            }
        }
        Ok(children)
    }

    fn insert(&self, mut node: DbNode) -> Result<u64, StorageError> {
        if node.db_id == 0 {
            node.db_id = self.db.generate_id()? + ROOT_DB_ID + 1;
        }
        if node.db_id != ROOT_DB_ID && self.get(node.parent_db_id)?.is_none() {
            return Err(StorageError::NodeNotFound(node.parent_db_id));
        }
        self.write_node(&node, None)?;
        Ok(node.db_id)
    }

    fn update(&self, node: &DbNode) -> Result<(), StorageError> {
        let previous = self.get(node.db_id)?.ok_or(StorageError::NodeNotFound(node.db_id))?;
        self.write_node(node, Some(&previous))
    }

    fn remove_subtree(&self, db_id: u64) -> Result<Vec<DbNode>, StorageError> {
        if db_id == ROOT_DB_ID {
            return Err(StorageError::Inconsistent("the root pair cannot be removed".to_string()));
        }
        let mut removed = Vec::new();
        let mut stack = vec![db_id];
        while let Some(current) = stack.pop() {
            let node = match self.get(current)? {
                Some(node) => node,
                None => continue,
            };
            for child in self.children(current)? {
                stack.push(child.db_id);
            }
            self.erase_node(&node)?;
            removed.push(node);
        }
        Ok(removed)
    }

    fn all(&self) -> Result<Vec<DbNode>, StorageError> {
        self.nodes
            .iter()
            .values()
            .map(|value| -> Result<DbNode, StorageError> { Ok(bincode::deserialize(&value?)?) })
            .collect()
    }

    fn cursor(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .meta
            .get(CURSOR_KEY)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn set_cursor(&self, cursor: &str) -> Result<(), StorageError> {
        self.meta.insert(CURSOR_KEY, cursor.as_bytes())?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn pair(parent: u64, local: &str, remote: &str, name: &str) -> DbNode {
        DbNode {
            db_id: 0,
            parent_db_id: parent,
            local_id: Some(local.to_string()),
            remote_id: Some(remote.to_string()),
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
    fn test_insert_lookup_and_path() {
        let db = SledSyncDb::temporary().unwrap();
        db.ensure_root("lroot", "rroot").unwrap();
        let a = db.insert(pair(ROOT_DB_ID, "l1", "r1", "docs")).unwrap();
        let b = db.insert(pair(a, "l2", "r2", "2024")).unwrap();

        assert_eq!(db.get_by_id(ReplicaSide::Local, "l2").unwrap().unwrap().db_id, b);
        assert_eq!(db.path(b, ReplicaSide::Remote).unwrap(), PathBuf::from("docs/2024"));
        assert_eq!(db.children(ROOT_DB_ID).unwrap().len(), 1);
        assert!(db.insert(pair(999, "l9", "r9", "x")).is_err());
    }

    #[test]
    fn test_update_moves_pair_and_reindexes() {
        let db = SledSyncDb::temporary().unwrap();
        db.ensure_root("lroot", "rroot").unwrap();
        let a = db.insert(pair(ROOT_DB_ID, "l1", "r1", "a")).unwrap();
        let b = db.insert(pair(ROOT_DB_ID, "l2", "r2", "b")).unwrap();

        let mut moved = db.get(b).unwrap().unwrap();
        moved.parent_db_id = a;
        moved.remote_id = Some("r2bis".to_string());
        db.update(&moved).unwrap();

        assert!(db.get_by_id(ReplicaSide::Remote, "r2").unwrap().is_none());
        assert_eq!(db.get_by_id(ReplicaSide::Remote, "r2bis").unwrap().unwrap().db_id, b);
        assert_eq!(db.children(ROOT_DB_ID).unwrap().len(), 1);
        assert_eq!(db.children(a).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_subtree_and_cursor() {
        let db = SledSyncDb::temporary().unwrap();
        db.ensure_root("lroot", "rroot").unwrap();
        let a = db.insert(pair(ROOT_DB_ID, "l1", "r1", "a")).unwrap();
        db.insert(pair(a, "l2", "r2", "b")).unwrap();

        let removed = db.remove_subtree(a).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(db.all().unwrap().len(), 1);
        assert!(db.get_by_id(ReplicaSide::Local, "l2").unwrap().is_none());

        assert_eq!(db.cursor().unwrap(), None);
        db.set_cursor("c-42").unwrap();
        assert_eq!(db.cursor().unwrap().as_deref(), Some("c-42"));
    }
}
