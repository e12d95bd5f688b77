//! Snapshot
//!
//! In-memory tree mirroring one replica. Items live in an arena keyed by id with a
//! parent → children name index; there are no pointers between items. Paths are
//! computed lazily and cached with path compression.

mod builder;
mod item;
mod naming;

pub use builder::{BuildReport, SnapshotBuilder};
pub use item::SnapshotItem;
pub use naming::{has_root_name, is_structurally_invalid, NameCaseRule};

use crate::error::SnapshotError;
use crate::types::{NodeId, NodeType, ReplicaSide, SyncPath};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::warn;

/// Snapshot: tree of one replica at a point in time
pub struct Snapshot {
    side: ReplicaSide,
    root_id: NodeId,
    items: HashMap<NodeId, SnapshotItem>,
    /// parent id → (name key → child id)
    children: HashMap<NodeId, BTreeMap<String, NodeId>>,
    path_cache: Mutex<HashMap<NodeId, SyncPath>>,
    case_rule: NameCaseRule,
    valid: bool,
    revision: u64,
}

impl Snapshot {
    /// Create a snapshot holding only its root
    pub fn new(side: ReplicaSide, root_id: impl Into<NodeId>, case_rule: NameCaseRule) -> Self {
        let root_id = root_id.into();
        let root = SnapshotItem::new(root_id.clone(), root_id.clone(), "", NodeType::Directory);
        let mut items = HashMap::new();
        items.insert(root_id.clone(), root);
        let mut children = HashMap::new();
        children.insert(root_id.clone(), BTreeMap::new());

        Self {
            side,
            root_id,
            items,
            children,
            path_cache: Mutex::new(HashMap::new()),
            case_rule,
            valid: false,
            revision: 0,
        }
    }

    pub fn side(&self) -> ReplicaSide {
        self.side
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    pub fn case_rule(&self) -> NameCaseRule {
        self.case_rule
    }

    /// Number of items, root excluded
    pub fn len(&self) -> usize {
        self.items.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether the snapshot reflects its replica (false until explored, or after events were lost)
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&SnapshotItem> {
        self.items.get(id)
    }

    /// All items, root excluded
    pub fn items(&self) -> impl Iterator<Item = &SnapshotItem> {
        let root_id = &self.root_id;
        self.items.values().filter(move |item| &item.id != root_id)
    }

    pub fn children(&self, id: &str) -> impl Iterator<Item = &SnapshotItem> {
        self.children
            .get(id)
            .into_iter()
            .flat_map(|names| names.values())
            .filter_map(|child_id| self.items.get(child_id))
    }

    /// Child of `parent_id` whose name matches `name` under the case rule
    pub fn find_child(&self, parent_id: &str, name: &str) -> Option<&SnapshotItem> {
        let key = self.case_rule.key(name);
        self.children
            .get(parent_id)
            .and_then(|names| names.get(&key))
            .and_then(|id| self.items.get(id))
    }

    /// Ids of `id` and everything below it, parents before children
    pub fn subtree(&self, id: &str) -> Vec<NodeId> {
        let mut collected = Vec::new();
        if !self.items.contains_key(id) {
            return collected;
        }
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(names) = self.children.get(&current) {
                stack.extend(names.values().rev().cloned());
            }
            collected.push(current);
        }
        collected
    }

    /// Whether `ancestor` is `id` itself or one of its ancestors
    pub fn is_ancestor_or_self(&self, ancestor: &str, id: &str) -> bool {
        let mut current = id;
        for _ in 0..self.items.len() {
            if current == ancestor {
                return true;
            }
            if current == self.root_id {
                return false;
            }
            match self.items.get(current) {
                Some(item) => current = &item.parent_id,
                None => return false,
            }
        }
        false
    }

    /// Insert or update an item. Returns true when the item was not present before.
    pub fn upsert(&mut self, item: SnapshotItem) -> Result<bool, SnapshotError> {
        if item.id == self.root_id {
            return Err(SnapshotError::RootImmutable("modified"));
        }
        if item.id.is_empty() || is_structurally_invalid(&item.name) {
            return Err(SnapshotError::InvalidItem {
                id: item.id.clone(),
                reason: format!("invalid name '{}'", item.name),
            });
        }
        if item.size < 0 {
            return Err(SnapshotError::InvalidItem {
                id: item.id.clone(),
                reason: format!("negative size {}", item.size),
            });
        }
        if item.parent_id == item.id {
            return Err(SnapshotError::Cycle {
                id: item.id.clone(),
                parent_id: item.parent_id.clone(),
            });
        }

        let parent = self
            .items
            .get(&item.parent_id)
            .ok_or_else(|| SnapshotError::MissingParent {
                id: item.id.clone(),
                parent_id: item.parent_id.clone(),
            })?;
        if !parent.is_dir() {
            return Err(SnapshotError::InvalidItem {
                id: item.id.clone(),
                reason: format!("parent {} is not a directory", item.parent_id),
            });
        }

        let key = self.case_rule.key(&item.name);
        if let Some(existing) = self
            .children
            .get(&item.parent_id)
            .and_then(|names| names.get(&key))
        {
            if existing != &item.id {
                return Err(SnapshotError::NameClash {
                    parent_id: item.parent_id.clone(),
                    name: item.name.clone(),
                    existing: existing.clone(),
                });
            }
        }

        let previous = self.items.get(&item.id).cloned();
        match previous {
            Some(previous) => {
                let has_children = self
                    .children
                    .get(&item.id)
                    .map(|names| !names.is_empty())
                    .unwrap_or(false);
                if !item.is_dir() && has_children {
                    return Err(SnapshotError::InvalidItem {
                        id: item.id.clone(),
                        reason: "directory with children cannot become a file".to_string(),
                    });
                }

                let moved = previous.parent_id != item.parent_id;
                let renamed = previous.name != item.name;
                if moved && self.is_ancestor_or_self(&item.id, &item.parent_id) {
                    return Err(SnapshotError::Cycle {
                        id: item.id.clone(),
                        parent_id: item.parent_id.clone(),
                    });
                }
                if moved || renamed {
                    let old_key = self.case_rule.key(&previous.name);
                    if let Some(names) = self.children.get_mut(&previous.parent_id) {
                        names.remove(&old_key);
                    }
                    self.invalidate_paths(&item.id);
                }
                if item.is_dir() {
                    self.children.entry(item.id.clone()).or_default();
                } else {
                    self.children.remove(&item.id);
                }
                self.children
                    .entry(item.parent_id.clone())
                    .or_default()
                    .insert(key, item.id.clone());
                self.items.insert(item.id.clone(), item);
                self.revision += 1;
                Ok(false)
            }
            None => {
                if item.is_dir() {
                    self.children.insert(item.id.clone(), BTreeMap::new());
                }
                self.children
                    .entry(item.parent_id.clone())
                    .or_default()
                    .insert(key, item.id.clone());
                self.items.insert(item.id.clone(), item);
                self.revision += 1;
                Ok(true)
            }
        }
    }

    /// Remove an item and its whole subtree. Returns the removed items, parents first.
    pub fn remove(&mut self, id: &str) -> Result<Vec<SnapshotItem>, SnapshotError> {
        if id == self.root_id {
            return Err(SnapshotError::RootImmutable("removed"));
        }
        let item = self
            .items
            .get(id)
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;
        let key = self.case_rule.key(&item.name);
        let parent_id = item.parent_id.clone();
        if let Some(names) = self.children.get_mut(&parent_id) {
            names.remove(&key);
        }

        let ids = self.subtree(id);
        let cache = self.path_cache.get_mut();
        let mut removed = Vec::with_capacity(ids.len());
        for node_id in ids {
            cache.remove(&node_id);
            self.children.remove(&node_id);
            if let Some(item) = self.items.remove(&node_id) {
                removed.push(item);
            }
        }
        self.revision += 1;
        Ok(removed)
    }

    /// Drop every item but the root and mark the snapshot invalid
    pub fn clear(&mut self) {
        let root = self.items.remove(&self.root_id);
        self.items.clear();
        self.children.clear();
        self.path_cache.get_mut().clear();
        if let Some(root) = root {
            self.items.insert(self.root_id.clone(), root);
        }
        self.children.insert(self.root_id.clone(), BTreeMap::new());
        self.valid = false;
        self.revision += 1;
    }

    /// Path of an item relative to the root, and whether it must be ignored
    ///
    /// Walks ancestors until a cached path or the root is found, then writes the
    /// computed path forward into every visited item's cache entry.
    pub fn path(&self, id: &str) -> Result<(SyncPath, bool), SnapshotError> {
        let mut cache = self.path_cache.lock();
        if let Some(path) = cache.get(id) {
            return Ok((path.clone(), has_root_name(path)));
        }

        let mut chain: Vec<(&NodeId, &str)> = Vec::new();
        let mut base = SyncPath::new();
        let mut current: &str = id;
        let mut reached = false;
        for _ in 0..self.items.len() {
            if current == self.root_id {
                reached = true;
                break;
            }
            if let Some(path) = cache.get(current) {
                base = path.clone();
                reached = true;
                break;
            }
            let item = self
                .items
                .get(current)
                .ok_or_else(|| SnapshotError::NotFound(current.to_string()))?;
            chain.push((&item.id, &item.name));
            current = &item.parent_id;
        }
        if !reached {
            return Err(SnapshotError::Cycle {
                id: id.to_string(),
                parent_id: current.to_string(),
            });
        }

        let mut path = base;
        for (node_id, name) in chain.into_iter().rev() {
            path.push(name);
            cache.insert(node_id.clone(), path.clone());
        }

        let ignore = has_root_name(&path);
        if ignore {
            warn!(side = %self.side, id, path = %path.display(), "Path has a root name, ignoring item");
        }
        Ok((path, ignore))
    }

    /// Resolve a root-relative path to an item id
    pub fn id_from_path(&self, path: &Path) -> Option<NodeId> {
        let mut current = self.root_id.clone();
        for component in path.components() {
            match component {
                Component::Normal(name) => {
                    let name = name.to_str()?;
                    current = self.find_child(&current, name)?.id.clone();
                }
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(current)
    }

    /// Verify the structural invariants: single self-parented root, existing parents,
    /// indexed unique sibling names, no cycles.
    pub fn check_integrity(&self) -> Result<(), SnapshotError> {
        let root = self
            .items
            .get(&self.root_id)
            .ok_or_else(|| SnapshotError::NotFound(self.root_id.clone()))?;
        if root.parent_id != self.root_id {
            return Err(SnapshotError::InvalidItem {
                id: self.root_id.clone(),
                reason: "root is not its own parent".to_string(),
            });
        }

        for item in self.items() {
            let parent = self
                .items
                .get(&item.parent_id)
                .ok_or_else(|| SnapshotError::MissingParent {
                    id: item.id.clone(),
                    parent_id: item.parent_id.clone(),
                })?;
            if !parent.is_dir() {
                return Err(SnapshotError::InvalidItem {
                    id: item.id.clone(),
                    reason: "parent is not a directory".to_string(),
                });
            }
            let indexed = self
                .children
                .get(&item.parent_id)
                .and_then(|names| names.get(&self.case_rule.key(&item.name)));
            if indexed != Some(&item.id) {
                return Err(SnapshotError::InvalidItem {
                    id: item.id.clone(),
                    reason: "missing from parent's name index".to_string(),
                });
            }
            if !self.is_ancestor_or_self(&self.root_id, &item.id) {
                return Err(SnapshotError::Cycle {
                    id: item.id.clone(),
                    parent_id: item.parent_id.clone(),
                });
            }
        }

        let indexed_count: usize = self.children.values().map(|names| names.len()).sum();
        if indexed_count != self.len() {
            return Err(SnapshotError::InvalidItem {
                id: self.root_id.clone(),
                reason: format!(
                    "name index holds {} entries for {} items",
                    indexed_count,
                    self.len()
                ),
            });
        }
        Ok(())
    }

    fn invalidate_paths(&mut self, id: &str) {
        let ids = self.subtree(id);
        let cache = self.path_cache.get_mut();
        for node_id in ids {
            cache.remove(&node_id);
        }
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        Self {
            side: self.side,
            root_id: self.root_id.clone(),
            items: self.items.clone(),
            children: self.children.clone(),
            path_cache: Mutex::new(self.path_cache.lock().clone()),
            case_rule: self.case_rule,
            valid: self.valid,
            revision: self.revision,
        }
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("side", &self.side)
            .field("root_id", &self.root_id)
            .field("items", &self.len())
            .field("valid", &self.valid)
            .field("revision", &self.revision)
            .finish()
    }
}

/// Snapshot shared between its single writer (the observer) and any number of readers
#[derive(Clone)]
pub struct SharedSnapshot {
    inner: Arc<RwLock<Snapshot>>,
}

impl SharedSnapshot {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.inner.write()
    }

    /// Swap in a rebuilt snapshot in one step
    pub fn replace(&self, snapshot: Snapshot) {
        *self.inner.write() = snapshot;
    }

    /// Consistent private copy for a reconciliation cycle
    pub fn frozen(&self) -> Snapshot {
        self.inner.read().clone()
    }

    pub fn invalidate(&self) {
        self.inner.write().set_valid(false);
    }

    pub fn is_valid(&self) -> bool {
        self.inner.read().is_valid()
    }
}
