//! Change detection: one snapshot against the last known-common state.

use crate::db::{content_hash, DbIndex, DbNode, ROOT_DB_ID};
use crate::snapshot::{Snapshot, SnapshotItem};
use crate::types::{NodeId, ReplicaSide};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::debug;

/// Changes seen on one pair, from one side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairChange {
    /// Parent or name differs from the database
    pub moved: bool,
    /// File content differs
    pub edited: bool,
    /// Metadata differs but content is identical
    pub touched: bool,
    pub deleted: bool,
    /// Deleted along with its deleted parent
    pub nested_delete: bool,
    pub rights: bool,
}

impl PairChange {
    pub fn is_empty(&self) -> bool {
        *self == PairChange::default()
    }

    /// Changed in a way that must survive a delete on the other side
    pub fn is_active(&self) -> bool {
        self.moved || self.edited
    }
}

/// All changes of one side
#[derive(Debug, Clone)]
pub struct SideChanges {
    pub side: ReplicaSide,
    /// Items without a pairing
    pub creates: Vec<NodeId>,
    pub pairs: BTreeMap<u64, PairChange>,
}

impl SideChanges {
    pub fn pair(&self, db_id: u64) -> PairChange {
        self.pairs.get(&db_id).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.creates.len() + self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decides whether a file whose signature moved still holds the synced content
pub trait ContentProbe {
    fn unchanged(&self, item: &SnapshotItem, node: &DbNode, snapshot: &Snapshot) -> bool;
}

/// Never looks at content
pub struct SignatureOnly;

impl ContentProbe for SignatureOnly {
    fn unchanged(&self, _item: &SnapshotItem, _node: &DbNode, _snapshot: &Snapshot) -> bool {
        false
    }
}

/// Hashes local files under the sync root and compares with the stored hash
pub struct LocalContentProbe {
    root: PathBuf,
}

impl LocalContentProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ContentProbe for LocalContentProbe {
    fn unchanged(&self, item: &SnapshotItem, node: &DbNode, snapshot: &Snapshot) -> bool {
        let stored = match &node.content_hash {
            Some(hash) if item.size == node.size => hash,
            _ => return false,
        };
        let path = match snapshot.path(&item.id) {
            Ok((path, false)) => self.root.join(path),
            _ => return false,
        };
        match content_hash(&path) {
            Ok(hash) => &hash == stored,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Could not hash file");
                false
            }
        }
    }
}

/// Compare `snapshot` with the database, skipping `excluded` items
pub fn detect_changes(
    snapshot: &Snapshot,
    db: &DbIndex,
    excluded: &HashSet<NodeId>,
    probe: &dyn ContentProbe,
) -> SideChanges {
    let side = snapshot.side();
    let mut changes = SideChanges {
        side,
        creates: Vec::new(),
        pairs: BTreeMap::new(),
    };

    for item in snapshot.items() {
        if excluded.contains(&item.id) {
            continue;
        }
        let node = match db.by_id(side, &item.id) {
            Some(node) => node,
            None => {
                changes.creates.push(item.id.clone());
                continue;
            }
        };
        if node.node_type != item.node_type {
            // Same id, different kind of node: the old pair is gone
            changes.pairs.entry(node.db_id).or_default().deleted = true;
            changes.creates.push(item.id.clone());
            continue;
        }

        let mut change = PairChange::default();
        let synced_parent = if node.parent_db_id == ROOT_DB_ID {
            Some(snapshot.root_id().clone())
        } else {
            db.get(node.parent_db_id).and_then(|parent| parent.id(side).cloned())
        };
        change.moved = synced_parent.as_deref() != Some(item.parent_id.as_str())
            || node.name(side) != item.name;

        if !item.is_dir()
            && (item.size != node.size || item.last_modified != node.last_modified(side))
        {
            if probe.unchanged(item, node, snapshot) {
                change.touched = true;
            } else {
                change.edited = true;
            }
        }
        if side == ReplicaSide::Remote && item.can_write != node.can_write {
            change.rights = true;
        }
        if !change.is_empty() {
            changes.pairs.insert(node.db_id, change);
        }
    }

    for node in db.nodes() {
        if node.db_id == ROOT_DB_ID {
            continue;
        }
        let id = match node.id(side) {
            Some(id) => id,
            None => continue,
        };
        if snapshot.contains(id) {
            continue;
        }
        let parent_gone = node.parent_db_id != ROOT_DB_ID
            && db
                .get(node.parent_db_id)
                .and_then(|parent| parent.id(side))
                .map(|parent_id| !snapshot.contains(parent_id))
                .unwrap_or(false);
        let change = changes.pairs.entry(node.db_id).or_default();
        change.deleted = true;
        change.nested_delete = parent_gone;
    }

    debug!(
        side = %side,
        creates = changes.creates.len(),
        pairs = changes.pairs.len(),
        "Detected changes"
    );
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::NameCaseRule;
    use crate::types::NodeType;

    fn synced(db_id: u64, parent: u64, id: &str, name: &str, node_type: NodeType) -> DbNode {
        DbNode {
            db_id,
            parent_db_id: parent,
            local_id: Some(id.to_string()),
            remote_id: Some(format!("r{}", id)),
            local_name: name.to_string(),
            remote_name: name.to_string(),
            node_type,
            size: 10,
            created_at: 0,
            last_modified_local: 100,
            last_modified_remote: 100,
            can_write: true,
            content_hash: None,
        }
    }

    fn root_node() -> DbNode {
        synced(ROOT_DB_ID, ROOT_DB_ID, "root", "", NodeType::Directory)
    }

    #[test]
    fn test_detects_create_move_edit_delete() {
        let db = DbIndex::from_nodes(vec![
            root_node(),
            synced(2, ROOT_DB_ID, "d", "dir", NodeType::Directory),
            synced(3, 2, "f", "file.txt", NodeType::File),
            synced(4, ROOT_DB_ID, "g", "gone.txt", NodeType::File),
            synced(5, ROOT_DB_ID, "e", "edit.txt", NodeType::File),
        ]);
        let mut local = Snapshot::new(ReplicaSide::Local, "root", NameCaseRule::Sensitive);
        local.upsert(SnapshotItem::new("d", "root", "dir", NodeType::Directory)).unwrap();
        // moved to the root and renamed
        local
            .upsert(SnapshotItem::new("f", "root", "moved.txt", NodeType::File).with_size(10).with_times(0, 100))
            .unwrap();
        local
            .upsert(SnapshotItem::new("e", "root", "edit.txt", NodeType::File).with_size(12).with_times(0, 150))
            .unwrap();
        local.upsert(SnapshotItem::new("n", "d", "new.txt", NodeType::File)).unwrap();

        let changes = detect_changes(&local, &db, &HashSet::new(), &SignatureOnly);
        assert_eq!(changes.creates, vec!["n".to_string()]);
        assert!(changes.pair(3).moved);
        assert!(!changes.pair(3).edited);
        assert!(changes.pair(5).edited);
        assert!(changes.pair(4).deleted);
        assert!(!changes.pair(4).nested_delete);
        assert!(changes.pair(2).is_empty());
    }

    #[test]
    fn test_child_of_deleted_directory_is_nested() {
        let db = DbIndex::from_nodes(vec![
            root_node(),
            synced(2, ROOT_DB_ID, "d", "dir", NodeType::Directory),
            synced(3, 2, "f", "file.txt", NodeType::File),
        ]);
        let local = Snapshot::new(ReplicaSide::Local, "root", NameCaseRule::Sensitive);
        let changes = detect_changes(&local, &db, &HashSet::new(), &SignatureOnly);
        assert!(changes.pair(2).deleted && !changes.pair(2).nested_delete);
        assert!(changes.pair(3).deleted && changes.pair(3).nested_delete);
    }

    #[test]
    fn test_touched_file_with_same_hash_is_not_an_edit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("same.txt"), b"0123456789").unwrap();
        let mut node = synced(2, ROOT_DB_ID, "s", "same.txt", NodeType::File);
        node.content_hash = Some(content_hash(&dir.path().join("same.txt")).unwrap());
        let db = DbIndex::from_nodes(vec![root_node(), node]);

        let mut local = Snapshot::new(ReplicaSide::Local, "root", NameCaseRule::Sensitive);
        local
            .upsert(SnapshotItem::new("s", "root", "same.txt", NodeType::File).with_size(10).with_times(0, 999))
            .unwrap();
        let probe = LocalContentProbe::new(dir.path());
        let changes = detect_changes(&local, &db, &HashSet::new(), &probe);
        assert!(changes.pair(2).touched);
        assert!(!changes.pair(2).edited);
    }
}
