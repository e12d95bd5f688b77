//! Watch descriptor ↔ path index owned by a watcher thread.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};

/// WatchIndex: bidirectional map with registration order
#[derive(Debug)]
pub struct WatchIndex<W> {
    by_id: HashMap<W, (PathBuf, u64)>,
    by_path: HashMap<PathBuf, W>,
    next_seq: u64,
}

impl<W: Clone + Eq + Hash> Default for WatchIndex<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Clone + Eq + Hash> WatchIndex<W> {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_path: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Record a watch. A descriptor re-registered on a new path moves to that path.
    pub fn insert(&mut self, id: W, path: PathBuf) {
        if let Some((old_path, _)) = self.by_id.remove(&id) {
            self.by_path.remove(&old_path);
        }
        if let Some(old_id) = self.by_path.remove(&path) {
            self.by_id.remove(&old_id);
        }
        self.by_id.insert(id.clone(), (path.clone(), self.next_seq));
        self.by_path.insert(path, id);
        self.next_seq += 1;
    }

    pub fn path(&self, id: &W) -> Option<&Path> {
        self.by_id.get(id).map(|(path, _)| path.as_path())
    }

    pub fn id(&self, path: &Path) -> Option<&W> {
        self.by_path.get(path)
    }

    pub fn remove(&mut self, id: &W) -> Option<PathBuf> {
        let (path, _) = self.by_id.remove(id)?;
        self.by_path.remove(&path);
        Some(path)
    }

    /// Remove every watch on `prefix` or below it, returning the descriptors in
    /// registration order. Matches are collected before anything is erased.
    pub fn remove_subtree(&mut self, prefix: &Path) -> Vec<W> {
        let mut matched: Vec<(u64, W)> = self
            .by_id
            .iter()
            .filter(|(_, (path, _))| path.starts_with(prefix))
            .map(|(id, (_, seq))| (*seq, id.clone()))
            .collect();
        matched.sort_by_key(|(seq, _)| *seq);

        matched
            .into_iter()
            .map(|(_, id)| {
                self.remove(&id);
                id
            })
            .collect()
    }
}
